//! Tasks Lambda - jobs booked for customers.
//!
//! Endpoints:
//! - GET /tasks - List tasks
//! - POST /task - Create a task
//! - GET /task/{name} - Get a task
//! - PUT /task/{name} - Update a task
//! - DELETE /task/{name} - Delete a task

use std::sync::Arc;

use lambda_http::{Body, Error, Request, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;
use validator::Validate;

use shared::http;
use shared::models::{now_iso, Task, TaskChanges};
use shared::repo::{tasks_schema, TaskRepo};
use shared::store::{PutMode, UpdateMode};
use shared::{parse_body, resolve_tenant, Config};

use crate::{dynamo_table, load_aws_config, respond, route_of, validate_body};

const LIST_LIMIT: usize = 200;

/// Create task request. Older clients send `phone`, `start_date` and `requirement`.
#[derive(Debug, Deserialize, Validate)]
struct CreateTaskRequest {
    #[validate(required, length(min = 1))]
    name: Option<String>,
    phone_number: Option<String>,
    phone: Option<String>,
    address: Option<String>,
    start_datetime: Option<String>,
    start_date: Option<String>,
    request: Option<String>,
    requirement: Option<String>,
}

fn first_filled(current: Option<String>, legacy: Option<String>) -> String {
    current
        .filter(|v| !v.is_empty())
        .or(legacy)
        .unwrap_or_default()
}

/// Application state
pub struct AppState {
    pub default_client_id: String,
    pub tasks: TaskRepo,
}

impl AppState {
    pub async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let sdk = load_aws_config().await;
        Ok(Self {
            default_client_id: config.default_client_id,
            tasks: TaskRepo::new(dynamo_table(&sdk, tasks_schema(config.tasks_table))),
        })
    }
}

pub async fn handler(state: Arc<AppState>, event: Request) -> Result<Response<Body>, Error> {
    Ok(respond(route(&state, &event).await))
}

async fn route(state: &AppState, event: &Request) -> shared::Result<Response<Body>> {
    let (method, path) = route_of(event);
    if method == "OPTIONS" {
        return http::ok_empty();
    }

    let client_id = resolve_tenant(event, &state.default_client_id).client_id;
    let name = http::path_tail(&path, "/task");

    match (method.as_str(), path.as_str(), name) {
        ("GET", "/tasks", _) => {
            let tasks = state.tasks.list(&client_id, LIST_LIMIT).await?;
            http::ok(json!({ "items": tasks }))
        }
        ("POST", "/task", _) => create_task(state, &client_id, event).await,
        ("GET", _, Some(name)) => match state.tasks.get(&client_id, &name).await? {
            Some(task) => http::ok(json!({ "item": task })),
            None => http::error_response(404, "not found"),
        },
        ("PUT", _, Some(name)) => {
            let fields: Map<String, Value> = parse_body!(event.body());
            let changes = TaskChanges::from_fields(&fields);
            if changes.is_empty() {
                return http::error_response(400, "nothing to update");
            }
            let task = state
                .tasks
                .update(&client_id, &name, changes, UpdateMode::MustExist)
                .await?;
            http::ok(json!({ "item": task }))
        }
        ("DELETE", _, Some(name)) => {
            state.tasks.delete(&client_id, &name, true).await?;
            http::ok_empty()
        }
        _ => http::not_found_route(),
    }
}

async fn create_task(state: &AppState, client_id: &str, event: &Request) -> shared::Result<Response<Body>> {
    let request: CreateTaskRequest = parse_body!(event.body());
    validate_body(&request, "name required")?;
    let Some(name) = request.name else {
        return http::error_response(400, "name required");
    };

    let now = now_iso();
    let task = Task {
        client_id: client_id.to_string(),
        name,
        phone_number: first_filled(request.phone_number, request.phone),
        address: request.address.unwrap_or_default(),
        request: first_filled(request.request, request.requirement),
        start_datetime: first_filled(request.start_datetime, request.start_date),
        created_at: now.clone(),
        updated_at: now,
    };
    state.tasks.put(&task, PutMode::IfAbsent).await?;

    info!(client_id, task = %task.name, "Created task");
    http::ok(json!({ "item": task }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{json_of, request};
    use shared::store::MemoryTable;

    fn state() -> AppState {
        AppState {
            default_client_id: "ueki".into(),
            tasks: TaskRepo::new(Arc::new(MemoryTable::new(tasks_schema("tasks")))),
        }
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (u16, Value) {
        let response = respond(route(state, &request(method, uri, &[], body)).await);
        (response.status().as_u16(), json_of(&response))
    }

    #[tokio::test]
    async fn test_create_with_legacy_fields() {
        let state = state();
        let (status, body) = call(
            &state,
            "POST",
            "/task",
            Some(json!({"name": "mow", "phone": "0901", "start_date": "2024-06-01", "requirement": "芝刈り", "request": ""})),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["item"]["phone_number"], "0901");
        assert_eq!(body["item"]["start_datetime"], "2024-06-01");
        assert_eq!(body["item"]["request"], "芝刈り");
        assert_eq!(body["item"]["address"], "");

        let (status, _) = call(&state, "POST", "/task", Some(json!({"name": "mow"}))).await;
        assert_eq!(status, 409);

        let (status, body) = call(&state, "POST", "/task", Some(json!({"address": "x"}))).await;
        assert_eq!((status, body["error"].as_str()), (400, Some("name required")));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let state = state();
        call(&state, "POST", "/task", Some(json!({"name": "mow", "request": "old"}))).await;

        let (status, body) = call(&state, "PUT", "/task/mow", Some(json!({"request": "new", "requirement": "legacy"}))).await;
        assert_eq!(status, 200);
        assert_eq!(body["item"]["request"], "new");

        let (status, body) = call(&state, "PUT", "/task/mow", Some(json!({"unrelated": 1}))).await;
        assert_eq!((status, body["error"].as_str()), (400, Some("nothing to update")));

        let (status, _) = call(&state, "PUT", "/task/mow", Some(json!({"request": null, "requirement": "legacy"}))).await;
        assert_eq!(status, 400);

        let (status, _) = call(&state, "PUT", "/task/ghost", Some(json!({"address": "x"}))).await;
        assert_eq!(status, 409);

        let (status, _) = call(&state, "DELETE", "/task/mow", None).await;
        assert_eq!(status, 200);
        let (status, _) = call(&state, "GET", "/task/mow", None).await;
        assert_eq!(status, 404);
        let (status, _) = call(&state, "DELETE", "/task/mow", None).await;
        assert_eq!(status, 409);
    }

    #[tokio::test]
    async fn test_list_and_unknown_routes() {
        let state = state();
        call(&state, "POST", "/task", Some(json!({"name": "a"}))).await;
        call(&state, "POST", "/task", Some(json!({"name": "b"}))).await;
        let (_, body) = call(&state, "GET", "/tasks", None).await;
        assert_eq!(body["items"].as_array().unwrap().len(), 2);

        let (status, _) = call(&state, "GET", "/task", None).await;
        assert_eq!(status, 404);
        let (status, _) = call(&state, "PATCH", "/task/a", None).await;
        assert_eq!(status, 404);
        let (status, body) = call(&state, "POST", "/task", Some(json!("not an object"))).await;
        assert_eq!(status, 400);
        assert_eq!(body["ok"], false);
    }
}
