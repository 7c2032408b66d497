//! FAQ Lambda - the knowledge base the assistant answers from.
//!
//! Endpoints:
//! - GET /faqs - List FAQs
//! - POST /faq - Create a FAQ
//! - GET /faq/{question} - Get a FAQ
//! - PUT /faq/{question} - Replace the answer
//! - DELETE /faq/{question} - Delete a FAQ

use std::sync::Arc;

use lambda_http::{Body, Error, Request, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use validator::Validate;

use shared::http;
use shared::repo::{faq_schema, FaqRepo};
use shared::{parse_body, resolve_tenant, Config};

use crate::{dynamo_table, load_aws_config, respond, route_of, validate_body};

const LIST_LIMIT: usize = 200;

/// Create FAQ request
#[derive(Debug, Deserialize, Validate)]
struct CreateFaqRequest {
    #[validate(required, length(min = 1))]
    question: Option<String>,
    #[validate(required)]
    answer: Option<String>,
}

/// Update FAQ request
#[derive(Debug, Deserialize, Validate)]
struct UpdateFaqRequest {
    #[validate(required)]
    answer: Option<String>,
}

/// Application state
pub struct AppState {
    pub default_client_id: String,
    pub faqs: FaqRepo,
}

impl AppState {
    pub async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let sdk = load_aws_config().await;
        Ok(Self {
            default_client_id: config.default_client_id,
            faqs: FaqRepo::new(dynamo_table(&sdk, faq_schema(config.faq_table))),
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
    let question = http::path_tail(&path, "/faq");

    match (method.as_str(), path.as_str(), question) {
        ("GET", "/faqs", _) => {
            let faqs = state.faqs.list(&client_id, LIST_LIMIT).await?;
            http::ok(json!({ "items": faqs }))
        }
        ("POST", "/faq", _) => {
            let request: CreateFaqRequest = parse_body!(event.body());
            validate_body(&request, "question and answer required")?;
            let (Some(question), Some(answer)) = (request.question, request.answer) else {
                return http::error_response(400, "question and answer required");
            };
            let faq = state.faqs.create(&client_id, &question, &answer).await?;
            info!(client_id = %client_id, "Created FAQ");
            http::ok(json!({ "item": faq }))
        }
        ("GET", _, Some(question)) => match state.faqs.get(&client_id, &question).await? {
            Some(faq) => http::ok(json!({ "item": faq })),
            None => http::error_response(404, "not found"),
        },
        ("PUT", _, Some(question)) => {
            let request: UpdateFaqRequest = parse_body!(event.body());
            validate_body(&request, "answer required")?;
            let answer = request.answer.unwrap_or_default();
            let faq = state.faqs.update_answer(&client_id, &question, &answer).await?;
            http::ok(json!({ "item": faq }))
        }
        ("DELETE", _, Some(question)) => {
            state.faqs.delete(&client_id, &question).await?;
            http::ok_empty()
        }
        _ => http::not_found_route(),
    }
}
