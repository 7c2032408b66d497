//! Configuration management for Lambda functions.

use std::env;

use crate::{Error, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Call log table (PK `client_id`, SK `{phone}#{ts}`)
    pub call_logs_table: String,
    /// FAQ table (PK `client_id`, SK `question`)
    pub faq_table: String,
    /// Prompt/config documents table (PK `client_id`, SK `id`)
    pub prompts_table: String,
    /// Tasks table (PK `client_id`, SK `name`)
    pub tasks_table: String,
    /// AWS region
    pub aws_region: String,
    /// Tenant used when a request carries no tenant information
    pub default_client_id: String,
    /// Chat completion model
    pub chat_model: String,
    /// CloudWatch log group served by `/chat-logs`
    pub chat_log_group: String,
    pub openai: OpenAiSettings,
    pub twilio: Option<TwilioCredentials>,
}

/// OpenAI credentials as found in the environment.
#[derive(Debug, Clone, Default)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub project: Option<String>,
    pub organization: Option<String>,
    /// Secrets Manager secret holding the key when the environment lacks it
    pub secret_name: Option<String>,
}

/// Secret read for transcription when `OPENAI_SECRET_NAME` is unset.
pub const DEFAULT_TRANSCRIPTION_SECRET: &str = "UEKI_OPENAI_APIKEY";

impl OpenAiSettings {
    /// Fall back to `name` when no secret is configured.
    pub fn with_default_secret(mut self, name: &str) -> Self {
        if self.secret_name.is_none() {
            self.secret_name = Some(name.to_string());
        }
        self
    }
}

/// Twilio account credentials.
#[derive(Clone)]
pub struct TwilioCredentials {
    pub account_sid: String,
    pub auth_token: String,
}

impl std::fmt::Debug for TwilioCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwilioCredentials")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"***")
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| lookup(name))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };
        let var_or = |name: &str, default: &str| var(&[name]).unwrap_or_else(|| default.to_string());

        let twilio = match (var(&["TWILIO_ACCOUNT_SID"]), var(&["TWILIO_AUTH_TOKEN"])) {
            (Some(account_sid), Some(auth_token)) => Some(TwilioCredentials {
                account_sid,
                auth_token,
            }),
            _ => None,
        };

        let default_client_id = var_or("DEFAULT_CLIENT_ID", "ueki");
        if default_client_id.contains('#') {
            return Err(Error::Config(
                "DEFAULT_CLIENT_ID must not contain '#'".to_string(),
            ));
        }

        Ok(Self {
            call_logs_table: var_or("CALL_LOGS_TABLE_NAME", "ueki-chatbot"),
            faq_table: var_or("FAQ_TABLE_NAME", "ueki-faq"),
            prompts_table: var_or("PROMPTS_TABLE_NAME", "ueki-prompts"),
            tasks_table: var_or("TASKS_TABLE_NAME", "ueki-tasks"),
            aws_region: var(&["AWS_REGION", "AWS_DEFAULT_REGION"])
                .unwrap_or_else(|| "ap-northeast-1".to_string()),
            default_client_id,
            chat_model: var_or("OPENAI_CHAT_MODEL", "gpt-4o-mini"),
            chat_log_group: var_or("CHAT_LOG_GROUP_NAME", "/aws/lambda/ueki-chat"),
            openai: OpenAiSettings {
                api_key: var(&["OPENAI_API_KEY", "OPENAI_APIKEY", "OPENAI_API_TOKEN"]),
                project: var(&["OPENAI_PROJECT", "OPENAI_PROJECT_ID"]),
                organization: var(&["OPENAI_ORG", "OPENAI_ORGANIZATION"]),
                secret_name: var(&["OPENAI_SECRET_NAME"]),
            },
            twilio,
        })
    }
}
