//! AWS Secrets Manager integration and OpenAI credential resolution.

use async_trait::async_trait;
use aws_sdk_secretsmanager::Client as SecretsClient;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::OpenAiSettings;
use crate::{Error, Result};

/// Cached secrets with lazy initialization.
static SECRETS_CACHE: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();

fn get_cache() -> &'static RwLock<HashMap<String, String>> {
    SECRETS_CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

const KEY_FIELDS: [&str; 8] = [
    "OPENAI_API_KEY",
    "api_key",
    "key",
    "OPENAI_APIKEY",
    "openai_api_key",
    "OPENAI-API-KEY",
    "API_KEY",
    "token",
];
const PROJECT_FIELDS: [&str; 3] = ["OPENAI_PROJECT", "project", "project_id"];
const ORG_FIELDS: [&str; 4] = ["OPENAI_ORG", "OPENAI_ORGANIZATION", "organization", "org"];

/// Resolved OpenAI credentials.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OpenAiCredentials {
    pub api_key: String,
    pub project: Option<String>,
    pub organization: Option<String>,
}

impl std::fmt::Debug for OpenAiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCredentials")
            .field("api_key", &"***")
            .field("project", &self.project.is_some())
            .field("organization", &self.organization.is_some())
            .finish()
    }
}

/// Get a secret value from Secrets Manager with caching.
pub async fn get_secret(client: &SecretsClient, secret_id: &str) -> Result<String> {
    // Check cache first
    {
        let cache = get_cache().read().await;
        if let Some(value) = cache.get(secret_id) {
            return Ok(value.clone());
        }
    }

    let response = client
        .get_secret_value()
        .secret_id(secret_id)
        .send()
        .await
        .map_err(|e| Error::Aws(format!("Failed to get secret: {}", e)))?;

    let secret_string = response
        .secret_string()
        .ok_or_else(|| Error::Aws("Secret has no string value".to_string()))?
        .trim()
        .to_string();

    {
        let mut cache = get_cache().write().await;
        cache.insert(secret_id.to_string(), secret_string.clone());
    }

    Ok(secret_string)
}

fn first_field(obj: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .filter_map(|field| obj.get(*field))
        .filter_map(|value| match value {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .find(|s| !s.is_empty())
}

/// Find an embedded `sk-...` token in free text.
fn embedded_key(text: &str) -> Option<String> {
    let start = text.find("sk-")?;
    let token: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (token.len() >= 13).then_some(token)
}

/// Parse OpenAI credentials out of a secret string.
///
/// JSON secrets are searched under the common field names, falling back to
/// any string value that looks like a key. Plain secrets are the key itself.
pub fn parse_openai_secret(secret: &str) -> (Option<String>, Option<String>, Option<String>) {
    let secret = secret.trim();
    if secret.is_empty() {
        return (None, None, None);
    }

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(secret) {
        let api_key = first_field(&obj, &KEY_FIELDS).or_else(|| {
            obj.values()
                .filter_map(Value::as_str)
                .map(str::trim)
                .find(|v| v.starts_with("sk-") || v.len() > 20)
                .map(str::to_string)
        });
        return (
            api_key,
            first_field(&obj, &PROJECT_FIELDS),
            first_field(&obj, &ORG_FIELDS),
        );
    }

    if secret.starts_with("sk-") {
        return (Some(secret.to_string()), None, None);
    }
    if let Some(key) = embedded_key(secret) {
        return (Some(key), None, None);
    }
    if !secret.contains('{') {
        return (Some(secret.to_string()), None, None);
    }
    (None, None, None)
}

/// Resolve OpenAI credentials.
///
/// An environment key together with a project or organization is used as-is.
/// Otherwise the configured secret fills in whatever the environment lacks.
pub async fn resolve_openai_credentials(
    client: Option<&SecretsClient>,
    settings: &OpenAiSettings,
) -> Result<OpenAiCredentials> {
    let mut api_key = settings.api_key.clone();
    let mut project = settings.project.clone();
    let mut organization = settings.organization.clone();

    let env_complete = api_key.is_some() && (project.is_some() || organization.is_some());
    if !env_complete {
        if let (Some(client), Some(secret_name)) = (client, settings.secret_name.as_deref()) {
            match get_secret(client, secret_name).await {
                Ok(secret) => {
                    let (key, secret_project, secret_org) = parse_openai_secret(&secret);
                    api_key = api_key.or(key);
                    project = project.or(secret_project);
                    organization = organization.or(secret_org);
                }
                Err(e) => warn!("Failed to fetch OpenAI secret: {}", e),
            }
        }
    }

    let api_key = api_key.ok_or_else(|| {
        Error::Config("OpenAI API key is not configured (env or Secrets Manager)".to_string())
    })?;

    info!(
        project = project.is_some(),
        org = organization.is_some(),
        "Resolved OpenAI credentials"
    );

    Ok(OpenAiCredentials {
        api_key,
        project,
        organization,
    })
}

/// Where OpenAI credentials come from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self) -> Result<OpenAiCredentials>;
}

/// Environment settings, completed from Secrets Manager when a secret is named.
pub struct SettingsCredentials {
    client: Option<SecretsClient>,
    settings: OpenAiSettings,
}

impl SettingsCredentials {
    pub fn new(client: Option<SecretsClient>, settings: OpenAiSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl CredentialSource for SettingsCredentials {
    async fn credentials(&self) -> Result<OpenAiCredentials> {
        resolve_openai_credentials(self.client.as_ref(), &self.settings).await
    }
}
