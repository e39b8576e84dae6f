use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequest, FromRequestParts, Path, Request, State},
    http::{StatusCode, header, request::Parts},
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::get,
};

use crate::{
    application::{
        error::{AppError, HttpError},
        todo::{CreateCollaborator, CreateTodoEntry, CreateTodoList, TodoService, UpdateTodoEntry},
    },
    cache::{CacheScope, CacheState, InvalidationFilter, response_cache_layer},
    domain::entities::{Collaborator, TodoEntry, TodoList},
    infra::db::by_list,
};

use super::{
    health,
    middleware::{
        HEADER_ROLE, HEADER_USER, RequestContext, capture_request_context, log_responses,
    },
};

#[derive(Clone)]
pub struct TodoState {
    pub todo: Arc<TodoService>,
}

pub fn build_todo_router(state: TodoState, cache: Option<CacheState>) -> Router {
    let routes = Router::new()
        .route("/lists", get(get_lists).post(post_lists))
        .route(
            "/lists/{list_id}",
            get(get_list).patch(patch_list).delete(delete_list),
        )
        .route(
            "/lists/{list_id}/collaborators",
            get(get_collaborators)
                .patch(patch_collaborators)
                .delete(delete_collaborators),
        )
        .route(
            "/lists/{list_id}/collaborators/{email}",
            get(get_collaborator),
        )
        .route(
            "/lists/{list_id}/entries",
            get(get_entries).post(post_entries),
        )
        .route(
            "/lists/{list_id}/entries/{entry_id}",
            get(get_entry).patch(patch_entry).delete(delete_entry),
        );

    let routes = match cache {
        Some(cache_state) => routes.layer(middleware::from_fn_with_state(
            cache_state,
            response_cache_layer,
        )),
        None => routes,
    };

    routes
        .route("/health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(capture_request_context))
}

/// JSON request body whose rejections answer with a `{ "message" }` body.
struct JsonBody<T>(T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = axum::extract::rejection::JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state).await?;
        Ok(Self(value))
    }
}

/// Present when the caller holds some role on the addressed list.
struct ListAccess;

impl<S> FromRequestParts<S> for ListAccess
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let context = RequestContext::from_request_parts(parts, state)
            .await
            .unwrap_or_default();
        match context.role() {
            Some(_) => Ok(ListAccess),
            None => Err(HttpError::new(
                "infra::http::todo::list_access",
                StatusCode::NOT_FOUND,
                "TodoList doesn't exist or you don't have access",
                "request carries no x-role",
            )),
        }
    }
}

async fn get_lists(
    State(state): State<TodoState>,
    scope: CacheScope,
    context: RequestContext,
) -> Json<Vec<TodoList>> {
    let user = context.user().unwrap_or_default();
    let lists = state.todo.lists_for(&user);

    let invalidation = scope.vary_on([HEADER_USER]);
    invalidation.subscribe(
        &state.todo.registry::<Collaborator>(),
        InvalidationFilter::new().with("email", user.as_str()),
    );
    let lists_registry = state.todo.registry::<TodoList>();
    for list in &lists {
        invalidation.subscribe(&lists_registry, by_list(&list.list_id));
    }

    Json(lists)
}

async fn post_lists(
    State(state): State<TodoState>,
    context: RequestContext,
    JsonBody(input): JsonBody<CreateTodoList>,
) -> Result<Response, AppError> {
    let owner = context.user().unwrap_or_default();
    let list = state.todo.create_list(&owner, input)?;
    let location = format!("/lists/{}", list.list_id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(list),
    )
        .into_response())
}

async fn get_list(
    _: ListAccess,
    State(state): State<TodoState>,
    scope: CacheScope,
    Path(list_id): Path<String>,
) -> Result<Json<TodoList>, AppError> {
    let list = state.todo.list(&list_id)?;
    scope
        .vary_on([HEADER_ROLE])
        .subscribe(&state.todo.registry::<TodoList>(), by_list(&list_id));
    Ok(Json(list))
}

async fn patch_list(
    _: ListAccess,
    State(state): State<TodoState>,
    Path(list_id): Path<String>,
    JsonBody(input): JsonBody<CreateTodoList>,
) -> Result<Redirect, AppError> {
    state.todo.rename_list(&list_id, input)?;
    Ok(Redirect::to(&format!("/lists/{list_id}")))
}

async fn delete_list(
    _: ListAccess,
    State(state): State<TodoState>,
    Path(list_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.todo.delete_list(&list_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_collaborators(
    _: ListAccess,
    State(state): State<TodoState>,
    scope: CacheScope,
    Path(list_id): Path<String>,
) -> Json<Vec<Collaborator>> {
    let collaborators = state.todo.collaborators(&list_id);
    scope
        .vary_on([HEADER_ROLE])
        .subscribe(&state.todo.registry::<Collaborator>(), by_list(&list_id));
    Json(collaborators)
}

async fn patch_collaborators(
    _: ListAccess,
    State(state): State<TodoState>,
    Path(list_id): Path<String>,
    JsonBody(input): JsonBody<Vec<CreateCollaborator>>,
) -> Result<Redirect, AppError> {
    state.todo.merge_collaborators(&list_id, input)?;
    Ok(Redirect::to(&format!("/lists/{list_id}/collaborators")))
}

async fn delete_collaborators(
    _: ListAccess,
    State(state): State<TodoState>,
    Path(list_id): Path<String>,
    JsonBody(emails): JsonBody<Vec<String>>,
) -> Redirect {
    state.todo.remove_collaborators(&list_id, &emails);
    Redirect::to(&format!("/lists/{list_id}/collaborators"))
}

/// Unguarded: this is how peers resolve a caller's role.
async fn get_collaborator(
    State(state): State<TodoState>,
    scope: CacheScope,
    Path((list_id, email)): Path<(String, String)>,
) -> Result<Json<Collaborator>, AppError> {
    let collaborator = state.todo.collaborator(&list_id, &email)?;
    scope.invalidation().subscribe(
        &state.todo.registry::<Collaborator>(),
        by_list(&list_id).with("email", email.as_str()),
    );
    Ok(Json(collaborator))
}

async fn get_entries(
    _: ListAccess,
    State(state): State<TodoState>,
    scope: CacheScope,
    Path(list_id): Path<String>,
) -> Result<Json<Vec<TodoEntry>>, AppError> {
    let entries = state.todo.entries(&list_id)?;
    scope
        .vary_on([HEADER_ROLE])
        .subscribe(&state.todo.registry::<TodoEntry>(), by_list(&list_id))
        .subscribe(&state.todo.registry::<TodoList>(), by_list(&list_id));
    Ok(Json(entries))
}

async fn post_entries(
    _: ListAccess,
    State(state): State<TodoState>,
    Path(list_id): Path<String>,
    JsonBody(input): JsonBody<CreateTodoEntry>,
) -> Result<Redirect, AppError> {
    let entry = state.todo.create_entry(&list_id, input)?;
    Ok(Redirect::to(&format!(
        "/lists/{list_id}/entries/{}",
        entry.entry_id
    )))
}

async fn get_entry(
    _: ListAccess,
    State(state): State<TodoState>,
    scope: CacheScope,
    Path((list_id, entry_id)): Path<(String, String)>,
) -> Result<Json<TodoEntry>, AppError> {
    let entry = state.todo.entry(&list_id, &entry_id)?;
    scope.vary_on([HEADER_ROLE]).subscribe(
        &state.todo.registry::<TodoEntry>(),
        by_list(&list_id).with("entry_id", entry_id.as_str()),
    );
    Ok(Json(entry))
}

async fn patch_entry(
    _: ListAccess,
    State(state): State<TodoState>,
    Path((list_id, entry_id)): Path<(String, String)>,
    JsonBody(input): JsonBody<UpdateTodoEntry>,
) -> Result<Redirect, AppError> {
    state.todo.update_entry(&list_id, &entry_id, input)?;
    Ok(Redirect::to(&format!("/lists/{list_id}/entries/{entry_id}")))
}

async fn delete_entry(
    _: ListAccess,
    State(state): State<TodoState>,
    Path((list_id, entry_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state.todo.delete_entry(&list_id, &entry_id)?;
    Ok(StatusCode::NO_CONTENT)
}
