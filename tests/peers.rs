//! Services talking over real sockets through the caching client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use peercache::{
    application::todo::{CreateTodoList, TodoService},
    cache::{CacheConfig, CacheState, Signals},
    domain::entities::TodoList,
    infra::{
        client::{CachingHttpClient, ClientError},
        http::{GatewayState, RequestContext, TodoState, build_gateway_router, build_todo_router},
    },
};
use serde_json::{Value, json};
use url::Url;

async fn spawn(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .await
            .expect("server should run");
    });
    addr
}

async fn spawn_todo() -> (SocketAddr, Arc<TodoService>) {
    let todo = Arc::new(TodoService::new(Signals::new()));
    let router = build_todo_router(
        TodoState {
            todo: Arc::clone(&todo),
        },
        Some(CacheState::new(CacheConfig::default())),
    );
    (spawn(router).await, todo)
}

fn client() -> CachingHttpClient {
    CachingHttpClient::new(CacheConfig::default()).expect("client should build")
}

fn context(pairs: &[(&'static str, &str)]) -> RequestContext {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.insert(*name, HeaderValue::from_str(value).expect("header value"));
    }
    RequestContext::from_headers(&headers)
}

fn create_list(todo: &TodoService, owner: &str, name: &str) -> TodoList {
    todo.create_list(
        owner,
        CreateTodoList {
            name: name.to_string(),
        },
    )
    .expect("list should be created")
}

#[tokio::test]
async fn peer_not_modified_is_replaced_by_the_stored_payload() {
    let revalidations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&revalidations);
    let peer = Router::new().route(
        "/report",
        get(move |headers: HeaderMap| {
            let seen = Arc::clone(&seen);
            async move {
                if headers.get(header::IF_NONE_MATCH).is_some_and(|v| v == "\"r1\"") {
                    seen.fetch_add(1, Ordering::SeqCst);
                    return StatusCode::NOT_MODIFIED.into_response();
                }
                (
                    [(header::ETAG, "\"r1\""), (header::CONTENT_TYPE, "application/json")],
                    r#"{"total":3}"#,
                )
                    .into_response()
            }
        }),
    );
    let addr = spawn(peer).await;
    let url = format!("http://{addr}/report");
    let session = client().session(RequestContext::default());

    let first = session.get(&url).await.expect("first call");
    assert_eq!(first.status(), StatusCode::OK);

    let second = session.get(&url).await.expect("second call");
    assert_eq!(revalidations.load(Ordering::SeqCst), 1);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.body(), first.body());
    assert_eq!(second.etag(), Some("\"r1\""));
    assert_eq!(second.json::<Value>().expect("json")["total"], 3);
}

#[tokio::test]
async fn varied_peer_answers_stay_per_user() {
    let revalidations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&revalidations);
    let peer = Router::new().route(
        "/profile",
        get(move |headers: HeaderMap| {
            let seen = Arc::clone(&seen);
            async move {
                let user = headers
                    .get("x-user")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let etag = format!("\"{user}\"");
                if headers.get(header::IF_NONE_MATCH).is_some_and(|v| v == etag.as_str()) {
                    seen.fetch_add(1, Ordering::SeqCst);
                    return StatusCode::NOT_MODIFIED.into_response();
                }
                (
                    [(header::ETAG, etag), (header::VARY, "x-user".to_string())],
                    user,
                )
                    .into_response()
            }
        }),
    );
    let addr = spawn(peer).await;
    let url = format!("http://{addr}/profile");
    let client = client();
    let alice = client.session(context(&[("x-user", "alice@example.com")]));
    let bob = client.session(context(&[("x-user", "bob@example.com")]));

    assert_eq!(alice.get(&url).await.expect("alice").text(), "alice@example.com");
    assert_eq!(bob.get(&url).await.expect("bob").text(), "bob@example.com");
    assert_eq!(revalidations.load(Ordering::SeqCst), 0);
    assert_eq!(client.cache().len(), 2);

    assert_eq!(alice.get(&url).await.expect("alice again").text(), "alice@example.com");
    assert_eq!(bob.get(&url).await.expect("bob again").text(), "bob@example.com");
    assert_eq!(revalidations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn uncached_peer_answers_pass_through() {
    let peer = Router::new().route("/plain", get(|| async { "no validator" }));
    let addr = spawn(peer).await;
    let client = client();
    let session = client.session(RequestContext::default());

    let response = session
        .get(&format!("http://{addr}/plain"))
        .await
        .expect("call");
    assert_eq!(response.text(), "no validator");
    assert!(client.cache().is_empty());
}

#[tokio::test]
async fn post_redirect_caches_the_followed_get() {
    let (addr, todo) = spawn_todo().await;
    let list = create_list(&todo, "a@example.com", "groceries");
    let client = client();
    let session = client.session(context(&[
        ("x-user", "a@example.com"),
        ("x-role", "owner"),
    ]));

    let created = session
        .post_json(
            &format!("http://{addr}/lists/{}/entries", list.list_id),
            &json!({ "text": "milk" }),
        )
        .await
        .expect("post")
        .error_for_status()
        .expect("success");
    assert_eq!(created.status(), StatusCode::OK);
    assert!(created.url().path().contains("/entries/"));
    assert_eq!(created.json::<Value>().expect("json")["text"], "milk");
    assert_eq!(client.cache().len(), 1);

    let again = session
        .get(created.url().as_str())
        .await
        .expect("get")
        .error_for_status()
        .expect("success");
    assert_eq!(again.body(), created.body());
    assert_eq!(again.etag(), created.etag());
}

#[tokio::test]
async fn upstream_errors_surface_with_their_message() {
    let (addr, _todo) = spawn_todo().await;
    let session = client().session(context(&[("x-user", "a@example.com")]));

    let err = session
        .get(&format!("http://{addr}/lists/missing"))
        .await
        .expect("transport ok")
        .error_for_status()
        .expect_err("no role means not found");
    match err {
        ClientError::Upstream { status, message } => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(message, "TodoList doesn't exist or you don't have access");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn redirect_loops_are_cut_off() {
    let peer = Router::new().route(
        "/loop",
        get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/loop")]).into_response() }),
    );
    let addr = spawn(peer).await;
    let client = CachingHttpClient::new(CacheConfig {
        max_redirects: 2,
        ..Default::default()
    })
    .expect("client should build");

    let err = client
        .session(RequestContext::default())
        .get(&format!("http://{addr}/loop"))
        .await
        .expect_err("loop must fail");
    assert!(matches!(err, ClientError::TooManyRedirects { limit: 2 }));
}

struct Stack {
    gateway: SocketAddr,
    http: reqwest::Client,
}

impl Stack {
    async fn start() -> Self {
        let (todo_addr, _todo) = spawn_todo().await;
        let todo_url = Url::parse(&format!("http://{todo_addr}/")).expect("todo url");
        let gateway = spawn(build_gateway_router(GatewayState {
            client: client(),
            todo_url,
        }))
        .await;
        Self {
            gateway,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.gateway)
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        headers: &[(&str, &str)],
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = self.http.request(method, self.url(path));
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.expect("gateway should answer");
        let status = response.status();
        let bytes = response.bytes().await.expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}

const ALICE: (&str, &str) = ("x-user", "alice@example.com");
const BOB: (&str, &str) = ("x-user", "bob@example.com");

#[tokio::test]
async fn gateway_resolves_roles_before_forwarding() {
    let stack = Stack::start().await;

    let (status, list) = stack
        .call(
            reqwest::Method::POST,
            "/lists",
            &[ALICE],
            Some(json!({ "name": "groceries" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let list_id = list["list_id"].as_str().expect("list id").to_string();
    let path = format!("/lists/{list_id}");

    let (status, fetched) = stack.call(reqwest::Method::GET, &path, &[ALICE], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "groceries");

    let (status, _) = stack.call(reqwest::Method::GET, &path, &[BOB], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = stack
        .call(reqwest::Method::GET, &path, &[BOB, ("x-role", "owner")], None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = stack.call(reqwest::Method::GET, &path, &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn gateway_reads_stay_fresh_across_writes() {
    let stack = Stack::start().await;

    let (_, list) = stack
        .call(
            reqwest::Method::POST,
            "/lists",
            &[ALICE],
            Some(json!({ "name": "chores" })),
        )
        .await;
    let list_id = list["list_id"].as_str().expect("list id").to_string();
    let entries = format!("/lists/{list_id}/entries");

    let (status, before) = stack.call(reqwest::Method::GET, &entries, &[ALICE], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(before, json!([]));

    let (status, again) = stack.call(reqwest::Method::GET, &entries, &[ALICE], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, before);

    let (status, entry) = stack
        .call(
            reqwest::Method::POST,
            &entries,
            &[ALICE],
            Some(json!({ "text": "sweep" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["text"], "sweep");

    let (status, after) = stack.call(reqwest::Method::GET, &entries, &[ALICE], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after.as_array().map(Vec::len), Some(1));

    let (status, renamed) = stack
        .call(
            reqwest::Method::PATCH,
            &format!("/lists/{list_id}"),
            &[ALICE],
            Some(json!({ "name": "weekend chores" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["name"], "weekend chores");
}

#[tokio::test]
async fn gateway_health_is_local() {
    let stack = Stack::start().await;
    let response = stack
        .http
        .get(stack.url("/health"))
        .send()
        .await
        .expect("health");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.expect("text"), "OK");
}
