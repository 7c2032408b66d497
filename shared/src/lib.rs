//! Shared library for the assistant's Lambda functions.
//!
//! Configuration, errors, the HTTP envelope, tenant resolution, the
//! key-value tables and the clients for the hosted APIs used by every Lambda.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod logs;
pub mod models;
pub mod openai;
pub mod pagination;
pub mod phone;
pub mod repo;
pub mod secrets;
pub mod store;
pub mod telephony;
pub mod tools;

pub use auth::{resolve_tenant, Tenant, TenantSource};
pub use config::Config;
pub use error::{Error, Result};
pub use models::{CallLog, Faq, Task};
pub use phone::normalize_phone;
pub use repo::{CallLogRepo, FaqRepo, PromptRepo, TaskRepo};
pub use secrets::{CredentialSource, OpenAiCredentials, SettingsCredentials};
