//! Shared data models.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current UTC time as ISO-8601 with seconds precision (`2024-05-01T09:30:00+00:00`).
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// One conversation turn recorded for a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLog {
    pub client_id: String,
    /// `{phone_number}#{ts}`
    pub sk: String,
    pub ts: String,
    pub phone_number: String,
    #[serde(default)]
    pub user_text: String,
    #[serde(default)]
    pub assistant_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
}

impl CallLog {
    pub fn sort_key(phone_number: &str, ts: &str) -> String {
        format!("{}#{}", phone_number, ts)
    }

    pub fn new(client_id: &str, phone_number: &str, ts: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            sk: Self::sort_key(phone_number, ts),
            ts: ts.to_string(),
            phone_number: phone_number.to_string(),
            user_text: String::new(),
            assistant_text: String::new(),
            call_sid: None,
        }
    }
}

/// Frequently asked question for a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Faq {
    pub client_id: String,
    pub question: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Field-service task (a job booked for a customer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub client_id: String,
    pub name: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub start_datetime: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Partial task update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskChanges {
    pub request: Option<String>,
    pub start_datetime: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
}

impl TaskChanges {
    /// Read changes from a JSON object. Legacy names (`requirement`,
    /// `start_date`, `phone`) are used only when the current name is absent;
    /// a current name set to `null` still hides its legacy alias.
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        Self {
            request: aliased_text(fields, "request", Some("requirement")),
            start_datetime: aliased_text(fields, "start_datetime", Some("start_date")),
            phone_number: aliased_text(fields, "phone_number", Some("phone")),
            address: aliased_text(fields, "address", None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_none()
            && self.start_datetime.is_none()
            && self.phone_number.is_none()
            && self.address.is_none()
    }
}

/// First non-null value among `names`, rendered as text.
pub fn field_text(fields: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| fields.get(*name))
        .find_map(text_of)
}

fn aliased_text(fields: &Map<String, Value>, current: &str, legacy: Option<&str>) -> Option<String> {
    let value = match fields.get(current) {
        Some(value) => value,
        None => fields.get(legacy?)?,
    };
    text_of(value)
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Partial call log update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallLogChanges {
    pub user_text: Option<String>,
    pub assistant_text: Option<String>,
    pub call_sid: Option<String>,
}

impl CallLogChanges {
    pub fn is_empty(&self) -> bool {
        self.user_text.is_none() && self.assistant_text.is_none() && self.call_sid.is_none()
    }
}

/// Ids of the per-tenant documents in the prompts table.
pub mod prompt_ids {
    pub const SYSTEM: &str = "system";
    pub const FUNCTIONS: &str = "functions";
    pub const EXT_TOOLS: &str = "ext-tools";
}
