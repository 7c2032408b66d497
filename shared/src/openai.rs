//! OpenAI chat completion and transcription clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client as HttpClient, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::secrets::{CredentialSource, OpenAiCredentials};
use crate::{Error, Result};

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const TRANSCRIPTION_MODEL: &str = "whisper-1";

/// A message in a chat completion conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// Assistant turn that requested tool calls.
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.unwrap_or_default()),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    /// Result of one tool call.
    pub fn tool_result(tool_call_id: Option<String>, name: &str, content: String) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id,
            name: Some(name.to_string()),
        }
    }
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    /// JSON-encoded arguments
    #[serde(default)]
    pub arguments: String,
}

/// Chat completion request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(model: &str, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.to_string(),
            messages,
            tools: None,
            tool_choice: None,
            temperature: 0.3,
            max_tokens: 1200,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = Some(tools);
        self.tool_choice = Some("auto".to_string());
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ChatMessage,
}

impl ChatCompletion {
    pub fn first_message(self) -> Option<ChatMessage> {
        self.choices.into_iter().next().map(|c| c.message)
    }
}

/// Hosted chat completion model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion>;
}

/// Audio container accepted by the transcription endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Wav,
}

impl AudioFormat {
    /// Parse a user-supplied format; anything unknown falls back to mp3.
    pub fn parse_or_default(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("wav") => AudioFormat::Wav,
            _ => AudioFormat::Mp3,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
        }
    }
}

/// Speech-to-text result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub segments: Option<Value>,
}

/// Hosted speech-to-text model.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Fails when the model cannot be reached at all, before any audio is fetched.
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn transcribe(&self, audio: Vec<u8>, format: AudioFormat) -> Result<Transcription>;
}

/// OpenAI REST client.
#[derive(Clone)]
pub struct OpenAiClient {
    http: HttpClient,
    credentials: OpenAiCredentials,
}

impl OpenAiClient {
    pub fn new(http: HttpClient, credentials: OpenAiCredentials) -> Self {
        Self { http, credentials }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request.bearer_auth(&self.credentials.api_key);
        if let Some(project) = &self.credentials.project {
            request = request.header("OpenAI-Project", project);
        }
        if let Some(org) = &self.credentials.organization {
            request = request.header("OpenAI-Organization", org);
        }
        request
    }
}

/// Pull a readable message out of an OpenAI error body.
fn upstream_message(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let err = v.get("error")?;
            let message = err.get("message").and_then(Value::as_str).unwrap_or("OpenAI error");
            let code = err.get("code").and_then(Value::as_str).unwrap_or_default();
            Some(format!("{} ({})", message, code))
        })
        .unwrap_or_else(|| body.chars().take(500).collect());
    format!("OpenAI HTTP {}: {}", status.as_u16(), detail)
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        info!(
            messages = request.messages.len(),
            tools = request.tools.is_some(),
            project = self.credentials.project.is_some(),
            org = self.credentials.organization.is_some(),
            "Calling OpenAI chat.completions"
        );

        let response = self
            .authorize(self.http.post(CHAT_COMPLETIONS_URL))
            .timeout(Duration::from_secs(10))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = upstream_message(status, &body);
            error!("{}", message);
            return Err(Error::Upstream(message));
        }

        Ok(response.json::<ChatCompletion>().await?)
    }
}

#[async_trait]
impl Transcriber for OpenAiClient {
    async fn transcribe(&self, audio: Vec<u8>, format: AudioFormat) -> Result<Transcription> {
        let file = Part::bytes(audio)
            .file_name(format!("audio.{}", format.extension()))
            .mime_str(format.content_type())?;
        let form = Form::new()
            .text("model", TRANSCRIPTION_MODEL)
            .text("response_format", "verbose_json")
            .text("temperature", "0")
            .part("file", file);

        let response = self
            .authorize(self.http.post(TRANSCRIPTIONS_URL))
            .timeout(Duration::from_secs(25))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Upstream(upstream_message(status, &body)));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|_| Error::Upstream("Invalid response from OpenAI".to_string()))?;
        if value.get("error").is_some_and(|e| !e.is_null()) {
            return Err(Error::Upstream(upstream_message(status, &body)));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// An [`OpenAiClient`] built on first use.
///
/// Credentials are looked up when a request needs them. A failed lookup is
/// not remembered, so the next request tries again; a successful one is
/// kept for the life of the process.
pub struct LazyOpenAi {
    http: HttpClient,
    source: Arc<dyn CredentialSource>,
    client: OnceCell<OpenAiClient>,
}

impl LazyOpenAi {
    pub fn new(http: HttpClient, source: Arc<dyn CredentialSource>) -> Self {
        Self {
            http,
            source,
            client: OnceCell::new(),
        }
    }

    pub async fn client(&self) -> Result<&OpenAiClient> {
        self.client
            .get_or_try_init(|| async {
                let credentials = self.source.credentials().await?;
                Ok::<_, Error>(OpenAiClient::new(self.http.clone(), credentials))
            })
            .await
    }
}

#[async_trait]
impl ChatModel for LazyOpenAi {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        self.client().await?.complete(request).await
    }
}

#[async_trait]
impl Transcriber for LazyOpenAi {
    async fn ready(&self) -> Result<()> {
        self.client().await.map(|_| ())
    }

    async fn transcribe(&self, audio: Vec<u8>, format: AudioFormat) -> Result<Transcription> {
        self.client().await?.transcribe(audio, format).await
    }
}
