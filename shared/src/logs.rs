//! Recent CloudWatch log events of a Lambda's log group.

use async_trait::async_trait;
use aws_sdk_cloudwatchlogs::error::DisplayErrorContext;
use aws_sdk_cloudwatchlogs::Client as LogsClient;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const DEFAULT_LIMIT: i32 = 100;
const MAX_LIMIT: i32 = 200;
const DEFAULT_MINUTES: i64 = 60;
const MAX_MINUTES: i64 = 24 * 60;

/// One log line as served by `/chat-logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub timestamp: Option<i64>,
    pub ingestion_time: Option<i64>,
    pub message: Option<String>,
    pub log_stream_name: Option<String>,
    pub event_id: Option<String>,
}

/// Which events to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogWindow {
    pub start_time_ms: i64,
    pub limit: i32,
}

impl LogWindow {
    /// Build a window from raw query values. Unparsable values take the
    /// defaults; a missing or non-positive start looks back `minutes` from now.
    pub fn from_query(limit: Option<&str>, minutes: Option<&str>, start_time_ms: Option<&str>, now_ms: i64) -> Self {
        let limit = limit
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT);
        let minutes = minutes
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(DEFAULT_MINUTES)
            .clamp(1, MAX_MINUTES);
        let start_time_ms = start_time_ms
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(now_ms - minutes * 60 * 1000);
        Self { start_time_ms, limit }
    }
}

#[async_trait]
pub trait LogEventSource: Send + Sync {
    async fn events(&self, log_group: &str, window: LogWindow) -> Result<Vec<LogEvent>>;
}

/// CloudWatch Logs backed source.
#[derive(Clone)]
pub struct CloudWatchLogs {
    client: LogsClient,
}

impl CloudWatchLogs {
    pub fn new(client: LogsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogEventSource for CloudWatchLogs {
    async fn events(&self, log_group: &str, window: LogWindow) -> Result<Vec<LogEvent>> {
        let output = self
            .client
            .filter_log_events()
            .log_group_name(log_group)
            .start_time(window.start_time_ms)
            .limit(window.limit)
            .send()
            .await
            .map_err(|e| Error::Aws(format!("filter_log_events failed: {}", DisplayErrorContext(&e))))?;

        Ok(output
            .events()
            .iter()
            .map(|e| LogEvent {
                timestamp: e.timestamp(),
                ingestion_time: e.ingestion_time(),
                message: e.message().map(str::to_string),
                log_stream_name: e.log_stream_name().map(str::to_string),
                event_id: e.event_id().map(str::to_string),
            })
            .collect())
    }
}
