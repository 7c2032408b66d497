//! Route handlers for the assistant's HTTP Lambdas.
//!
//! Each module owns one Lambda: its `AppState`, its `handler` and its routes.
//! The binaries under `src/bin` only wire a module into the Lambda runtime.

use std::sync::Arc;

use aws_config::{BehaviorVersion, SdkConfig};
use lambda_http::{Body, Request, Response};
use shared::store::{DynamoTable, KvTable, TableSchema};
use tracing::{debug, error, info};
use validator::Validate;

pub mod calllogs;
pub mod chat;
pub mod faq;
pub mod tasks;

#[cfg(test)]
mod test_support;

/// Load the AWS SDK configuration from the Lambda environment.
pub async fn load_aws_config() -> SdkConfig {
    aws_config::load_defaults(BehaviorVersion::latest()).await
}

/// A DynamoDB-backed table.
pub fn dynamo_table(sdk: &SdkConfig, schema: TableSchema) -> Arc<dyn KvTable> {
    Arc::new(DynamoTable::new(aws_sdk_dynamodb::Client::new(sdk), schema))
}

/// Method and path of a request, with a trailing slash removed.
pub fn route_of(event: &Request) -> (String, String) {
    let method = event.method().as_str().to_ascii_uppercase();
    let raw_path = event.uri().path();
    let path = match raw_path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    info!(method = %method, path, "Received request");
    (method, path.to_string())
}

/// Turn a route result into a response, mapping errors to their envelope.
pub fn respond(result: shared::Result<Response<Body>>) -> Response<Body> {
    result.unwrap_or_else(|err| {
        let status = err.status_code();
        if status >= 500 {
            error!(status, "Request failed: {}", err);
        } else {
            info!(status, "Request rejected: {}", err);
        }
        shared::http::from_error(&err)
    })
}

/// Validate a request body, reporting `message` when any rule fails.
pub fn validate_body<T: Validate>(body: &T, message: &str) -> shared::Result<()> {
    body.validate().map_err(|errors| {
        debug!("Request body failed validation: {}", errors);
        shared::Error::Validation(message.to_string())
    })
}
