//! Request builders shared by the route tests.

use std::collections::HashMap;

use lambda_http::{Body, Request, RequestExt, Response};
use serde_json::Value;

pub const TENANT: &str = "acme";

pub fn request(method: &str, uri: &str, query: &[(&str, &str)], body: Option<Value>) -> Request {
    let body = body.map(|b| Body::from(b.to_string())).unwrap_or(Body::Empty);
    let params: HashMap<String, String> = query
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    lambda_http::http::Request::builder()
        .method(method)
        .uri(uri)
        .header("x-client-id", TENANT)
        .body(body)
        .unwrap()
        .with_query_string_parameters(params)
}

pub fn json_of(response: &Response<Body>) -> Value {
    serde_json::from_slice(response.body().as_ref()).unwrap()
}
