//! Call Logs Lambda - conversation turns and call recordings.
//!
//! Endpoints:
//! - POST /call - Record a turn
//! - GET /call?phone&ts | ?call_sid - One turn, or every turn of a call
//! - PUT /call - Update a turn
//! - DELETE /call?phone&ts | ?call_sid - Delete a turn, or a whole call
//! - GET /calls?phone&from&to&limit&order&next_token - Page through a caller's turns
//! - GET /phones - Distinct callers
//! - GET /recordings?call_sid - Recordings of a call
//! - GET /recording/{sid}[.ext]?format - Recording audio
//! - GET /transcription?recording_sid&format - Speech-to-text of a recording

use std::sync::Arc;

use lambda_http::{Body, Error, Request, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use shared::http::{self, query_param, query_param_any};
use shared::models::{now_iso, CallLog, CallLogChanges};
use shared::config::DEFAULT_TRANSCRIPTION_SECRET;
use shared::openai::{AudioFormat, LazyOpenAi, Transcriber};
use shared::pagination::{decode_token, encode_token};
use shared::repo::{call_logs_schema, CallListQuery, CallLogRepo};
use shared::telephony::{split_recording_name, RecordingSource, TwilioClient};
use shared::{normalize_phone, parse_body, resolve_tenant, Config, SettingsCredentials};

use crate::{dynamo_table, load_aws_config, respond, route_of};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 1000;
const MAX_PHONES: usize = 1000;

/// Create call log request
#[derive(Debug, Deserialize)]
struct CreateCallRequest {
    phone_number: Option<String>,
    ts: Option<String>,
    user_text: Option<String>,
    assistant_text: Option<String>,
    #[serde(alias = "callSid")]
    call_sid: Option<String>,
}

/// Update call log request
#[derive(Debug, Deserialize)]
struct UpdateCallRequest {
    phone_number: Option<String>,
    ts: Option<String>,
    user_text: Option<String>,
    assistant_text: Option<String>,
    #[serde(alias = "callSid")]
    call_sid: Option<String>,
}

/// Application state
pub struct AppState {
    pub default_client_id: String,
    pub calls: CallLogRepo,
    pub recordings: Option<Arc<dyn RecordingSource>>,
    pub transcriber: Arc<dyn Transcriber>,
}

impl AppState {
    pub async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let sdk = load_aws_config().await;
        let http_client = reqwest::Client::new();

        let recordings = config.twilio.clone().map(|credentials| {
            Arc::new(TwilioClient::new(http_client.clone(), credentials)) as Arc<dyn RecordingSource>
        });
        if recordings.is_none() {
            warn!("Twilio credentials are not configured");
        }

        let credentials = SettingsCredentials::new(
            Some(aws_sdk_secretsmanager::Client::new(&sdk)),
            config.openai.clone().with_default_secret(DEFAULT_TRANSCRIPTION_SECRET),
        );
        let transcriber = Arc::new(LazyOpenAi::new(http_client, Arc::new(credentials)));

        Ok(Self {
            default_client_id: config.default_client_id,
            calls: CallLogRepo::new(dynamo_table(&sdk, call_logs_schema(config.call_logs_table))),
            recordings,
            transcriber,
        })
    }

    fn recordings(&self) -> shared::Result<&dyn RecordingSource> {
        self.recordings
            .as_deref()
            .ok_or_else(|| shared::Error::Config("Twilio credentials are not configured".to_string()))
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

    let tenant = resolve_tenant(event, &state.default_client_id);
    let client_id = tenant.client_id.as_str();

    match (method.as_str(), path.as_str()) {
        ("GET", "/recordings") => list_recordings(state, event).await,
        ("GET", "/transcription") => transcribe(state, event).await,
        ("GET", "/calls") => list_calls(state, client_id, event).await,
        ("GET", "/phones") => {
            let phones = state.calls.distinct_phones(client_id, MAX_PHONES).await?;
            http::ok(json!({ "items": phones }))
        }
        ("POST", "/call") => create_call(state, client_id, event).await,
        ("GET", "/call") => get_call(state, client_id, event).await,
        ("PUT", "/call") => update_call(state, client_id, event).await,
        ("DELETE", "/call") => delete_call(state, client_id, event).await,
        ("GET", p) if p == "/recording" || p.starts_with("/recording/") => stream_recording(state, event, p).await,
        _ => http::not_found_route(),
    }
}

async fn list_recordings(state: &AppState, event: &Request) -> shared::Result<Response<Body>> {
    let Some(call_sid) = query_param_any(event, &["call_sid", "callSid"]) else {
        return http::error_response(400, "call_sid is required");
    };
    let items = state.recordings()?.list_recordings(call_sid).await?;
    http::ok(json!({ "items": items }))
}

async fn stream_recording(state: &AppState, event: &Request, path: &str) -> shared::Result<Response<Body>> {
    let recordings = state.recordings()?;
    let Some(name) = http::path_tail(path, "/recording") else {
        return http::error_response(400, "recording sid missing");
    };
    let (sid, _ext) = split_recording_name(&name);
    if sid.is_empty() {
        return http::error_response(400, "recording sid missing");
    }
    let format = AudioFormat::parse_or_default(query_param(event, "format"));

    let audio = recordings.fetch_recording(sid, format).await?;
    info!(sid, bytes = audio.len(), "Streaming recording");
    http::binary_response(200, format.content_type(), audio)
}

async fn transcribe(state: &AppState, event: &Request) -> shared::Result<Response<Body>> {
    let Some(recording_sid) = query_param_any(event, &["recording_sid", "sid"]) else {
        return http::error_response(400, "recording_sid is required");
    };
    let recordings = state.recordings()?;
    state.transcriber.ready().await?;
    let format = AudioFormat::parse_or_default(query_param(event, "format"));

    let audio = recordings.fetch_recording(recording_sid, format).await?;
    let transcription = state.transcriber.transcribe(audio, format).await?;
    info!(recording_sid, chars = transcription.text.chars().count(), "Transcribed recording");
    http::ok(json!({
        "text": transcription.text,
        "segments": transcription.segments,
    }))
}

async fn list_calls(state: &AppState, client_id: &str, event: &Request) -> shared::Result<Response<Body>> {
    let Some(phone) = normalize_phone(query_param(event, "phone")) else {
        return http::error_response(400, "phone is required");
    };
    let limit = query_param(event, "limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let descending = query_param(event, "order").is_some_and(|o| o.eq_ignore_ascii_case("desc"));

    let query = CallListQuery {
        phone,
        from: query_param(event, "from").map(str::to_string),
        to: query_param(event, "to").map(str::to_string),
        descending,
        limit,
        start_key: decode_token(query_param(event, "next_token")),
    };
    let (items, last_key) = state.calls.list_for_phone(client_id, query).await?;
    let next_token = last_key.as_ref().map(encode_token).transpose()?;
    http::ok(json!({ "items": items, "next_token": next_token }))
}

async fn create_call(state: &AppState, client_id: &str, event: &Request) -> shared::Result<Response<Body>> {
    let request: CreateCallRequest = parse_body!(event.body());
    let Some(phone) = normalize_phone(request.phone_number.as_deref()) else {
        return http::error_response(400, "phone_number required");
    };
    let ts = request.ts.filter(|t| !t.trim().is_empty()).unwrap_or_else(now_iso);

    let mut log = CallLog::new(client_id, &phone, &ts);
    log.user_text = request.user_text.unwrap_or_default();
    log.assistant_text = request.assistant_text.unwrap_or_default();
    log.call_sid = request.call_sid.filter(|s| !s.is_empty());
    state.calls.put(&log).await?;

    info!(client_id, phone = %phone, "Recorded call log");
    http::ok(json!({ "item": log }))
}

/// `phone` and `ts` query values, when both are usable.
fn phone_and_ts(event: &Request) -> Option<(String, String)> {
    let phone = normalize_phone(query_param(event, "phone"))?;
    let ts = query_param(event, "ts")?;
    Some((phone, ts.to_string()))
}

async fn get_call(state: &AppState, client_id: &str, event: &Request) -> shared::Result<Response<Body>> {
    let call_sid = query_param_any(event, &["call_sid", "callSid"]);
    match (phone_and_ts(event), call_sid) {
        (Some((phone, ts)), _) => match state.calls.get(client_id, &phone, &ts).await? {
            Some(log) => http::ok(json!({ "item": log })),
            None => http::error_response(404, "not found"),
        },
        (None, Some(call_sid)) => {
            let logs = state.calls.by_call_sid(client_id, call_sid, None).await?;
            if logs.is_empty() {
                return http::error_response(404, "not found");
            }
            http::ok(json!({ "items": logs }))
        }
        (None, None) => http::error_response(400, "phone and ts required (or provide call_sid)"),
    }
}

async fn update_call(state: &AppState, client_id: &str, event: &Request) -> shared::Result<Response<Body>> {
    let request: UpdateCallRequest = parse_body!(event.body());
    let phone = normalize_phone(request.phone_number.as_deref());
    let ts = request.ts.filter(|t| !t.is_empty());
    let (Some(phone), Some(ts)) = (phone, ts) else {
        return http::error_response(400, "phone_number and ts required");
    };

    let changes = CallLogChanges {
        user_text: request.user_text,
        assistant_text: request.assistant_text,
        call_sid: request.call_sid,
    };
    if changes.is_empty() {
        return http::error_response(400, "nothing to update");
    }

    let log = state.calls.update(client_id, &phone, &ts, changes).await?;
    http::ok(json!({ "item": log }))
}

async fn delete_call(state: &AppState, client_id: &str, event: &Request) -> shared::Result<Response<Body>> {
    let call_sid = query_param_any(event, &["call_sid", "callSid"]);
    match (phone_and_ts(event), call_sid) {
        (Some((phone, ts)), _) => {
            state.calls.delete(client_id, &phone, &ts).await?;
            http::ok_empty()
        }
        (None, Some(call_sid)) => {
            let deleted = state.calls.delete_call(client_id, call_sid).await?;
            info!(client_id, call_sid, deleted, "Deleted call");
            http::ok(json!({ "deleted": deleted }))
        }
        (None, None) => http::error_response(400, "phone and ts required (or provide call_sid)"),
    }
}
