//! HTTP helpers for Lambda functions.

use lambda_http::http::HeaderValue;
use lambda_http::{Body, Request, RequestExt, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::{Error, Result};

const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Headers", "*"),
    ("Access-Control-Allow-Methods", "GET,POST,PUT,DELETE,OPTIONS"),
];

/// Standard API response envelope: `{"ok": bool, ...fields}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Create a JSON response with the given status code and data.
pub fn json_response<T: Serialize>(status: u16, data: &T) -> Result<Response<Body>> {
    let body = serde_json::to_string(data)?;
    build(status, "application/json; charset=utf-8", Body::from(body))
}

/// `200 {"ok": true, ...fields}` where `fields` must serialize to an object.
pub fn ok(fields: Value) -> Result<Response<Body>> {
    json_response(200, &ApiResponse::success(fields))
}

/// `200 {"ok": true}`.
pub fn ok_empty() -> Result<Response<Body>> {
    ok(json!({}))
}

/// Create an error response with the given status code and message.
pub fn error_response(status: u16, message: impl Into<String>) -> Result<Response<Body>> {
    json_response(status, &ApiResponse::<()>::error(message))
}

/// Map an [`Error`] into its error envelope, never failing.
pub fn from_error(err: &Error) -> Response<Body> {
    error_response(err.status_code(), err.to_string()).unwrap_or_else(|_| {
        let mut response = Response::new(Body::from(r#"{"ok":false,"error":"Internal error"}"#));
        *response.status_mut() = lambda_http::http::StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

pub fn not_found_route() -> Result<Response<Body>> {
    error_response(404, "route not found")
}

/// Raw bytes (audio) with CORS headers. The runtime base64-encodes binary bodies.
pub fn binary_response(status: u16, content_type: &str, data: Vec<u8>) -> Result<Response<Body>> {
    build(status, content_type, Body::Binary(data))
}

fn build(status: u16, content_type: &str, body: Body) -> Result<Response<Body>> {
    let mut builder = Response::builder()
        .status(status)
        .header("content-type", content_type);
    for (name, value) in CORS_HEADERS {
        builder = builder.header(name, HeaderValue::from_static(value));
    }
    builder
        .body(body)
        .map_err(|e| Error::Internal(format!("Failed to build response: {}", e)))
}

/// Parse the request body as JSON. An empty body parses as `{}`.
pub fn parse_json_body<T: DeserializeOwned>(body: &Body) -> Result<T> {
    let bytes: &[u8] = body.as_ref();
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return serde_json::from_str("{}")
            .map_err(|e| Error::Validation(format!("Invalid request body: {}", e)));
    }
    serde_json::from_slice(bytes).map_err(|e| Error::Validation(format!("Invalid request body: {}", e)))
}

/// First value of a query string parameter, trimmed; blank counts as absent.
pub fn query_param<'a>(event: &'a Request, name: &str) -> Option<&'a str> {
    event
        .query_string_parameters_ref()
        .and_then(|params| params.first(name))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// First present parameter among `names`.
pub fn query_param_any<'a>(event: &'a Request, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| query_param(event, name))
}

/// Path segment after `prefix` (e.g. `/faq/{question}`), URL-decoded.
pub fn path_tail(path: &str, prefix: &str) -> Option<String> {
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(rest)
        .map(|value| value.into_owned())
        .unwrap_or_else(|_| rest.to_string());
    Some(decoded)
}

/// Macro to parse request body, returning early with 400 on parse error.
///
/// Usage:
/// ```ignore
/// let request: MyRequest = parse_body!(event.body());
/// ```
#[macro_export]
macro_rules! parse_body {
    ($body:expr) => {
        match $crate::http::parse_json_body($body) {
            Ok(parsed) => parsed,
            Err(err) => return Ok($crate::http::from_error(&err)),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_envelope_flattens_fields() {
        let body = serde_json::to_value(ApiResponse::success(json!({"reply": "はい"}))).unwrap();
        assert_eq!(body, json!({"ok": true, "reply": "はい"}));

        let err = serde_json::to_value(ApiResponse::<()>::error("not found")).unwrap();
        assert_eq!(err, json!({"ok": false, "error": "not found"}));
    }

    #[test]
    fn test_non_ascii_is_not_escaped() {
        let response = ok(json!({"reply": "申し訳ありません"})).unwrap();
        let text = std::str::from_utf8(response.body().as_ref()).unwrap().to_string();
        assert!(text.contains("申し訳ありません"));
    }

    #[test]
    fn test_cors_headers_present() {
        let response = error_response(404, "route not found").unwrap();
        assert_eq!(response.status(), 404);
        let headers = response.headers();
        assert_eq!(headers["Access-Control-Allow-Origin"], "*");
        assert_eq!(headers["Access-Control-Allow-Methods"], "GET,POST,PUT,DELETE,OPTIONS");
        assert_eq!(headers["content-type"], "application/json; charset=utf-8");
    }

    #[test]
    fn test_empty_body_parses_as_empty_object() {
        #[derive(Debug, Deserialize)]
        struct Payload {
            name: Option<String>,
        }
        let parsed: Payload = parse_json_body(&Body::Empty).unwrap();
        assert!(parsed.name.is_none());

        let err = parse_json_body::<Payload>(&Body::from("{not json")).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_path_tail_decodes() {
        assert_eq!(path_tail("/faq/%E5%96%B6%E6%A5%AD", "/faq").as_deref(), Some("営業"));
        assert_eq!(path_tail("/task/weekly", "/task").as_deref(), Some("weekly"));
        assert_eq!(path_tail("/task/", "/task"), None);
        assert_eq!(path_tail("/task", "/task"), None);
        assert_eq!(path_tail("/tasks", "/task"), None);
    }
}
