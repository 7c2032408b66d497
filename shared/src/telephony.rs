//! Twilio REST client for call recordings.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::TwilioCredentials;
use crate::openai::AudioFormat;
use crate::{Error, Result};

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Summary of one recording attached to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub sid: String,
    pub duration: Option<String>,
    pub date_created: Option<String>,
    /// Format the recording is served in by default.
    pub media_format: String,
}

/// Telephony provider holding call recordings.
#[async_trait]
pub trait RecordingSource: Send + Sync {
    async fn list_recordings(&self, call_sid: &str) -> Result<Vec<RecordingSummary>>;

    async fn fetch_recording(&self, recording_sid: &str, format: AudioFormat) -> Result<Vec<u8>>;
}

/// Basic-auth client against the Twilio account.
#[derive(Clone)]
pub struct TwilioClient {
    http: HttpClient,
    credentials: TwilioCredentials,
}

impl TwilioClient {
    pub fn new(http: HttpClient, credentials: TwilioCredentials) -> Self {
        Self { http, credentials }
    }

    fn account_url(&self, path: &str) -> String {
        format!(
            "{}/Accounts/{}/{}",
            TWILIO_API_BASE,
            urlencoding::encode(&self.credentials.account_sid),
            path
        )
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.credentials.account_sid, Some(&self.credentials.auth_token))
            .timeout(Duration::from_secs(20))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Twilio request failed");
            return Err(Error::Upstream(format!(
                "Twilio HTTP {}: {}",
                status.as_u16(),
                body.chars().take(300).collect::<String>()
            )));
        }
        Ok(response)
    }
}

fn text_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Map Twilio's recordings list payload.
pub fn parse_recordings(payload: &Value) -> Vec<RecordingSummary> {
    payload
        .get("recordings")
        .and_then(Value::as_array)
        .map(|recordings| {
            recordings
                .iter()
                .filter_map(|r| {
                    Some(RecordingSummary {
                        sid: text_field(r, "sid")?,
                        duration: text_field(r, "duration"),
                        date_created: text_field(r, "date_created"),
                        media_format: AudioFormat::Mp3.extension().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Split `RE123.wav` into the sid and an optional extension at the first dot.
pub fn split_recording_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once('.') {
        Some((sid, ext)) => (sid, Some(ext)),
        None => (name, None),
    }
}

#[async_trait]
impl RecordingSource for TwilioClient {
    async fn list_recordings(&self, call_sid: &str) -> Result<Vec<RecordingSummary>> {
        let url = self.account_url(&format!("Calls/{}/Recordings.json", urlencoding::encode(call_sid)));
        let payload: Value = self.get(&url).await?.json().await?;
        let recordings = parse_recordings(&payload);
        info!(call_sid, count = recordings.len(), "Listed recordings");
        Ok(recordings)
    }

    async fn fetch_recording(&self, recording_sid: &str, format: AudioFormat) -> Result<Vec<u8>> {
        let url = self.account_url(&format!(
            "Recordings/{}.{}",
            urlencoding::encode(recording_sid),
            format.extension()
        ));
        let bytes = self.get(&url).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}
