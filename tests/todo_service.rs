//! Conditional GET behaviour of the todo service, driven in-process.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use http_body_util::BodyExt;
use peercache::{
    application::todo::{CreateTodoList, TodoService},
    cache::{CacheConfig, CacheState, Signals},
    domain::entities::TodoList,
    infra::http::{TodoState, build_todo_router},
};
use serde_json::Value;
use tower::ServiceExt;

struct Harness {
    app: Router,
    todo: Arc<TodoService>,
    cache: CacheState,
}

fn harness_with(config: CacheConfig) -> Harness {
    let todo = Arc::new(TodoService::new(Signals::new()));
    let cache = CacheState::new(config);
    let app = build_todo_router(
        TodoState {
            todo: Arc::clone(&todo),
        },
        Some(cache.clone()),
    );
    Harness { app, todo, cache }
}

fn harness() -> Harness {
    harness_with(CacheConfig::default())
}

fn request(method: Method, uri: &str, headers: &[(&str, &str)], body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).expect("request should build")
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("body should be json")
}

fn etag(response: &Response) -> String {
    response
        .headers()
        .get(header::ETAG)
        .expect("etag header")
        .to_str()
        .expect("ascii etag")
        .to_string()
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

const OWNER: (&str, &str) = ("x-role", "owner");

#[tokio::test]
async fn matching_validator_answers_not_modified() {
    let h = harness();
    let list = create_list(&h.todo, "a@example.com", "groceries");
    let uri = format!("/lists/{}", list.list_id);

    let first = send(&h.app, request(Method::GET, &uri, &[OWNER], None)).await;
    assert_eq!(first.status(), StatusCode::OK);
    let tag = etag(&first);
    assert_eq!(body_json(first).await["name"], "groceries");

    let second = send(
        &h.app,
        request(Method::GET, &uri, &[OWNER, ("if-none-match", tag.as_str())], None),
    )
    .await;
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(etag(&second), tag);
    assert!(body_bytes(second).await.is_empty());

    let stale = send(
        &h.app,
        request(Method::GET, &uri, &[OWNER, ("if-none-match", "\"other\"")], None),
    )
    .await;
    assert_eq!(stale.status(), StatusCode::OK);
    assert_eq!(etag(&stale), tag);
}

#[tokio::test]
async fn varied_header_selects_a_separate_entry() {
    let h = harness();
    create_list(&h.todo, "a@example.com", "mine");
    create_list(&h.todo, "b@example.com", "theirs");

    let for_a = send(
        &h.app,
        request(Method::GET, "/lists", &[("x-user", "a@example.com")], None),
    )
    .await;
    assert_eq!(for_a.status(), StatusCode::OK);
    assert_eq!(for_a.headers()[header::VARY], "x-user");
    let tag_a = etag(&for_a);

    let for_b = send(
        &h.app,
        request(
            Method::GET,
            "/lists",
            &[("x-user", "b@example.com"), ("if-none-match", tag_a.as_str())],
            None,
        ),
    )
    .await;
    assert_eq!(for_b.status(), StatusCode::OK);
    assert_ne!(etag(&for_b), tag_a);
    let lists = body_json(for_b).await;
    assert_eq!(lists[0]["name"], "theirs");
}

#[tokio::test]
async fn mutation_evicts_only_dependent_entries() {
    let h = harness();
    let groceries = create_list(&h.todo, "a@example.com", "groceries");
    let chores = create_list(&h.todo, "a@example.com", "chores");
    let groceries_uri = format!("/lists/{}", groceries.list_id);
    let chores_uri = format!("/lists/{}", chores.list_id);

    let first = send(&h.app, request(Method::GET, &groceries_uri, &[OWNER], None)).await;
    let groceries_tag = etag(&first);
    let first = send(&h.app, request(Method::GET, &chores_uri, &[OWNER], None)).await;
    let chores_tag = etag(&first);
    assert_eq!(h.cache.store.len(), 2);

    let renamed = send(
        &h.app,
        request(
            Method::PATCH,
            &groceries_uri,
            &[OWNER],
            Some(serde_json::json!({ "name": "market" })),
        ),
    )
    .await;
    assert_eq!(renamed.status(), StatusCode::SEE_OTHER);
    assert_eq!(renamed.headers()[header::LOCATION], groceries_uri.as_str());

    let refetched = send(
        &h.app,
        request(
            Method::GET,
            &groceries_uri,
            &[OWNER, ("if-none-match", groceries_tag.as_str())],
            None,
        ),
    )
    .await;
    assert_eq!(refetched.status(), StatusCode::OK);
    assert_ne!(etag(&refetched), groceries_tag);
    assert_eq!(body_json(refetched).await["name"], "market");

    let untouched = send(
        &h.app,
        request(
            Method::GET,
            &chores_uri,
            &[OWNER, ("if-none-match", chores_tag.as_str())],
            None,
        ),
    )
    .await;
    assert_eq!(untouched.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn new_collaboration_refreshes_the_list_index() {
    let h = harness();
    let user = ("x-user", "a@example.com");

    let created = send(
        &h.app,
        request(
            Method::POST,
            "/lists",
            &[user],
            Some(serde_json::json!({ "name": "trip" })),
        ),
    )
    .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let location = created.headers()[header::LOCATION]
        .to_str()
        .expect("ascii location")
        .to_string();
    assert!(location.starts_with("/lists/"));

    let index = send(&h.app, request(Method::GET, "/lists", &[user], None)).await;
    let tag = etag(&index);
    assert_eq!(body_json(index).await.as_array().map(Vec::len), Some(1));

    create_list(&h.todo, "a@example.com", "books");

    let index = send(
        &h.app,
        request(Method::GET, "/lists", &[user, ("if-none-match", tag.as_str())], None),
    )
    .await;
    assert_eq!(index.status(), StatusCode::OK);
    assert_eq!(body_json(index).await.as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn entries_follow_redirect_targets_and_deletes() {
    let h = harness();
    let list = create_list(&h.todo, "a@example.com", "groceries");
    let entries_uri = format!("/lists/{}/entries", list.list_id);

    let created = send(
        &h.app,
        request(
            Method::POST,
            &entries_uri,
            &[OWNER],
            Some(serde_json::json!({ "text": "milk" })),
        ),
    )
    .await;
    assert_eq!(created.status(), StatusCode::SEE_OTHER);
    let entry_uri = created.headers()[header::LOCATION]
        .to_str()
        .expect("ascii location")
        .to_string();

    let entry = send(&h.app, request(Method::GET, &entry_uri, &[OWNER], None)).await;
    let tag = etag(&entry);
    assert_eq!(body_json(entry).await["text"], "milk");

    let listing = send(&h.app, request(Method::GET, &entries_uri, &[OWNER], None)).await;
    let listing_tag = etag(&listing);

    let deleted = send(&h.app, request(Method::DELETE, &entry_uri, &[OWNER], None)).await;
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let gone = send(
        &h.app,
        request(Method::GET, &entry_uri, &[OWNER, ("if-none-match", tag.as_str())], None),
    )
    .await;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);

    let listing = send(
        &h.app,
        request(
            Method::GET,
            &entries_uri,
            &[OWNER, ("if-none-match", listing_tag.as_str())],
            None,
        ),
    )
    .await;
    assert_eq!(listing.status(), StatusCode::OK);
    assert_eq!(body_json(listing).await, serde_json::json!([]));
}

#[tokio::test]
async fn guarded_routes_hide_lists_without_a_role() {
    let h = harness();
    let list = create_list(&h.todo, "a@example.com", "private");

    let response = send(
        &h.app,
        request(Method::GET, &format!("/lists/{}", list.list_id), &[], None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!response.headers().contains_key(header::ETAG));
    assert_eq!(
        body_json(response).await["message"],
        "TodoList doesn't exist or you don't have access"
    );
}

#[tokio::test]
async fn role_lookup_is_unguarded_and_invalidated_by_role_changes() {
    let h = harness();
    let list = create_list(&h.todo, "a@example.com", "shared");
    let uri = format!("/lists/{}/collaborators/b@example.com", list.list_id);

    let missing = send(&h.app, request(Method::GET, &uri, &[], None)).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let merged = send(
        &h.app,
        request(
            Method::PATCH,
            &format!("/lists/{}/collaborators", list.list_id),
            &[OWNER],
            Some(serde_json::json!([{ "email": "b@example.com", "role": "viewer" }])),
        ),
    )
    .await;
    assert_eq!(merged.status(), StatusCode::SEE_OTHER);

    let viewer = send(&h.app, request(Method::GET, &uri, &[], None)).await;
    let tag = etag(&viewer);
    assert_eq!(body_json(viewer).await["role"], "viewer");

    send(
        &h.app,
        request(
            Method::PATCH,
            &format!("/lists/{}/collaborators", list.list_id),
            &[OWNER],
            Some(serde_json::json!([{ "email": "b@example.com", "role": "editor" }])),
        ),
    )
    .await;

    let editor = send(&h.app, request(Method::GET, &uri, &[("if-none-match", tag.as_str())], None)).await;
    assert_eq!(editor.status(), StatusCode::OK);
    assert_eq!(body_json(editor).await["role"], "editor");
}

#[tokio::test]
async fn oversized_bodies_are_forwarded_uncached() {
    let h = harness_with(CacheConfig {
        max_body_bytes: 8,
        ..Default::default()
    });
    let list = create_list(&h.todo, "a@example.com", "a name well past eight bytes");
    let uri = format!("/lists/{}", list.list_id);

    let response = send(&h.app, request(Method::GET, &uri, &[OWNER], None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(header::ETAG));
    assert_eq!(
        body_json(response).await["name"],
        "a name well past eight bytes"
    );
    assert!(h.cache.store.is_empty());
}

#[tokio::test]
async fn disabled_cache_passes_responses_through() {
    let todo = Arc::new(TodoService::new(Signals::new()));
    let app = build_todo_router(
        TodoState {
            todo: Arc::clone(&todo),
        },
        None,
    );
    let list = create_list(&todo, "a@example.com", "plain");

    let response = send(
        &app,
        request(Method::GET, &format!("/lists/{}", list.list_id), &[OWNER], None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(header::ETAG));
}

#[tokio::test]
async fn health_is_never_cached() {
    let h = harness();
    let response = send(&h.app, request(Method::GET, "/health", &[], None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(header::ETAG));
    assert_eq!(body_bytes(response).await, b"OK");
}

#[tokio::test]
async fn malformed_bodies_answer_with_a_json_message() {
    let h = harness();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/lists")
        .header("x-user", "a@example.com")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request should build");
    let response = send(&h.app, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(
        body["message"]
            .as_str()
            .is_some_and(|message| message.contains("JSON")),
        "unexpected body: {body}"
    );

    let request = Request::builder()
        .method(Method::POST)
        .uri("/lists")
        .body(Body::from(r#"{"name":"x"}"#))
        .expect("request should build");
    let response = send(&h.app, request).await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(body_json(response).await["message"].is_string());
}

#[tokio::test]
async fn repeated_reads_hold_one_subscription_per_entry() {
    let h = harness();
    let list = create_list(&h.todo, "a@example.com", "groceries");
    let uri = format!("/lists/{}", list.list_id);
    let lists = h.todo.registry::<TodoList>();

    for _ in 0..200 {
        let response = send(&h.app, request(Method::GET, &uri, &[OWNER], None)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(h.cache.store.len(), 1);
    assert_eq!(lists.len(), 1);
}
