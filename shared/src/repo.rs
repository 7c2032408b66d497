//! Typed, tenant-scoped access to the four tables.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::models::{now_iso, prompt_ids, CallLog, CallLogChanges, Faq, Task, TaskChanges};
use crate::phone::normalize_phone;
use crate::store::{
    from_item, key, to_item, Item, KvTable, PutMode, Query, SortCondition, TableSchema, UpdateMode,
};
use crate::Result;

/// Global secondary index on `call_sid` over the call log table.
pub const CALL_SID_INDEX: &str = "CallSidIndex";

/// Sorts after every character that appears in a timestamp.
const TS_UPPER_BOUND: &str = "~";

pub fn call_logs_schema(name: impl Into<String>) -> TableSchema {
    TableSchema::new(name, "client_id", Some("sk")).with_index(CALL_SID_INDEX, "call_sid", None)
}

pub fn faq_schema(name: impl Into<String>) -> TableSchema {
    TableSchema::new(name, "client_id", Some("question"))
}

pub fn tasks_schema(name: impl Into<String>) -> TableSchema {
    TableSchema::new(name, "client_id", Some("name"))
}

pub fn prompts_schema(name: impl Into<String>) -> TableSchema {
    TableSchema::new(name, "client_id", Some("id"))
}

/// Sort-key condition selecting one phone's logs, optionally bounded by timestamp.
pub fn phone_range(phone: &str, from: Option<&str>, to: Option<&str>) -> SortCondition {
    let prefix = format!("{}#", phone);
    match (from, to) {
        (Some(from), Some(to)) => SortCondition::Between(format!("{prefix}{from}"), format!("{prefix}{to}")),
        (Some(from), None) => SortCondition::Between(format!("{prefix}{from}"), format!("{prefix}{TS_UPPER_BOUND}")),
        (None, Some(to)) => SortCondition::Between(prefix.clone(), format!("{prefix}{to}")),
        (None, None) => SortCondition::BeginsWith(prefix),
    }
}

/// Listing parameters for one caller's logs.
#[derive(Debug, Clone, Default)]
pub struct CallListQuery {
    pub phone: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub descending: bool,
    pub limit: usize,
    pub start_key: Option<Item>,
}

fn decode_all<T: serde::de::DeserializeOwned>(items: Vec<Item>) -> Result<Vec<T>> {
    items.into_iter().map(from_item).collect()
}

/// Conversation turns, partitioned by tenant and sorted by `{phone}#{ts}`.
#[derive(Clone)]
pub struct CallLogRepo {
    table: Arc<dyn KvTable>,
}

impl CallLogRepo {
    pub fn new(table: Arc<dyn KvTable>) -> Self {
        Self { table }
    }

    fn key(client_id: &str, phone: &str, ts: &str) -> Item {
        key(&[("client_id", client_id), ("sk", &CallLog::sort_key(phone, ts))])
    }

    pub async fn put(&self, log: &CallLog) -> Result<()> {
        self.table.put(to_item(log)?, PutMode::Overwrite).await
    }

    pub async fn get(&self, client_id: &str, phone: &str, ts: &str) -> Result<Option<CallLog>> {
        self.table
            .get(&Self::key(client_id, phone, ts))
            .await?
            .map(from_item)
            .transpose()
    }

    /// One page of a caller's logs.
    pub async fn list_for_phone(&self, client_id: &str, query: CallListQuery) -> Result<(Vec<CallLog>, Option<Item>)> {
        let page = self
            .table
            .query(
                &Query::partition(client_id)
                    .sort(phone_range(&query.phone, query.from.as_deref(), query.to.as_deref()))
                    .descending(query.descending)
                    .limit(query.limit)
                    .start_after(query.start_key),
            )
            .await?;
        Ok((decode_all(page.items)?, page.last_key))
    }

    /// The latest `limit` logs of one caller, oldest first.
    pub async fn recent_for_phone(&self, client_id: &str, phone: &str, limit: usize) -> Result<Vec<CallLog>> {
        let page = self
            .table
            .query(
                &Query::partition(client_id)
                    .sort(phone_range(phone, None, None))
                    .descending(true)
                    .limit(limit),
            )
            .await?;
        let mut logs = decode_all(page.items)?;
        logs.reverse();
        Ok(logs)
    }

    /// Logs of one call session. The index spans tenants, so rows are
    /// filtered to `client_id`. `max_pages` of `None` reads every page.
    pub async fn by_call_sid(&self, client_id: &str, call_sid: &str, max_pages: Option<usize>) -> Result<Vec<CallLog>> {
        let mut logs = Vec::new();
        let mut start = None;
        let mut pages = 0;
        loop {
            let page = self
                .table
                .query(
                    &Query::partition(call_sid)
                        .index(CALL_SID_INDEX)
                        .limit(200)
                        .start_after(start),
                )
                .await?;
            pages += 1;
            logs.extend(
                page.items
                    .into_iter()
                    .filter(|item| item.get("client_id").and_then(Value::as_str) == Some(client_id))
                    .map(from_item::<CallLog>)
                    .collect::<Result<Vec<_>>>()?,
            );
            start = page.last_key;
            if start.is_none() || max_pages.is_some_and(|max| pages >= max) {
                break;
            }
        }
        Ok(logs)
    }

    pub async fn update(&self, client_id: &str, phone: &str, ts: &str, changes: CallLogChanges) -> Result<CallLog> {
        let mut set = Item::new();
        if let Some(text) = changes.user_text {
            set.insert("user_text".into(), Value::String(text));
        }
        if let Some(text) = changes.assistant_text {
            set.insert("assistant_text".into(), Value::String(text));
        }
        if let Some(sid) = changes.call_sid {
            set.insert("call_sid".into(), Value::String(sid));
        }
        let item = self
            .table
            .update(&Self::key(client_id, phone, ts), set, UpdateMode::MustExist)
            .await?;
        from_item(item)
    }

    pub async fn delete(&self, client_id: &str, phone: &str, ts: &str) -> Result<()> {
        self.table.delete(&Self::key(client_id, phone, ts), true).await
    }

    /// Delete every log of a call session, returning how many were removed.
    pub async fn delete_call(&self, client_id: &str, call_sid: &str) -> Result<usize> {
        let logs = self.by_call_sid(client_id, call_sid, None).await?;
        for log in &logs {
            self.table
                .delete(&key(&[("client_id", &log.client_id), ("sk", &log.sk)]), true)
                .await?;
        }
        Ok(logs.len())
    }

    /// Sorted distinct callers of a tenant, stopping once `cap` are known.
    pub async fn distinct_phones(&self, client_id: &str, cap: usize) -> Result<Vec<String>> {
        let mut phones = BTreeSet::new();
        let mut start = None;
        loop {
            let page = self
                .table
                .query(&Query::partition(client_id).limit(500).start_after(start))
                .await?;
            for item in &page.items {
                if let Some(phone) = normalize_phone(item.get("phone_number").and_then(Value::as_str)) {
                    phones.insert(phone);
                }
            }
            start = page.last_key;
            if start.is_none() || phones.len() >= cap {
                break;
            }
        }
        Ok(phones.into_iter().take(cap).collect())
    }
}

/// FAQ entries, keyed by tenant and question text.
#[derive(Clone)]
pub struct FaqRepo {
    table: Arc<dyn KvTable>,
}

impl FaqRepo {
    pub fn new(table: Arc<dyn KvTable>) -> Self {
        Self { table }
    }

    fn key(client_id: &str, question: &str) -> Item {
        key(&[("client_id", client_id), ("question", question)])
    }

    pub async fn list(&self, client_id: &str, limit: usize) -> Result<Vec<Faq>> {
        let page = self.table.query(&Query::partition(client_id).limit(limit)).await?;
        decode_all(page.items)
    }

    /// Up to `max_pages` pages of `page_size` entries.
    pub async fn list_pages(&self, client_id: &str, page_size: usize, max_pages: usize) -> Result<Vec<Faq>> {
        let mut faqs = Vec::new();
        let mut start = None;
        for _ in 0..max_pages {
            let page = self
                .table
                .query(&Query::partition(client_id).limit(page_size).start_after(start))
                .await?;
            faqs.extend(decode_all::<Faq>(page.items)?);
            start = page.last_key;
            if start.is_none() {
                break;
            }
        }
        Ok(faqs)
    }

    pub async fn create(&self, client_id: &str, question: &str, answer: &str) -> Result<Faq> {
        let now = now_iso();
        let faq = Faq {
            client_id: client_id.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.table.put(to_item(&faq)?, PutMode::IfAbsent).await?;
        Ok(faq)
    }

    pub async fn get(&self, client_id: &str, question: &str) -> Result<Option<Faq>> {
        self.table
            .get(&Self::key(client_id, question))
            .await?
            .map(from_item)
            .transpose()
    }

    pub async fn update_answer(&self, client_id: &str, question: &str, answer: &str) -> Result<Faq> {
        let mut set = Item::new();
        set.insert("answer".into(), Value::String(answer.to_string()));
        set.insert("updated_at".into(), Value::String(now_iso()));
        let item = self
            .table
            .update(&Self::key(client_id, question), set, UpdateMode::MustExist)
            .await?;
        from_item(item)
    }

    pub async fn delete(&self, client_id: &str, question: &str) -> Result<()> {
        self.table.delete(&Self::key(client_id, question), true).await
    }
}

/// Tasks, keyed by tenant and task name.
#[derive(Clone)]
pub struct TaskRepo {
    table: Arc<dyn KvTable>,
}

impl TaskRepo {
    pub fn new(table: Arc<dyn KvTable>) -> Self {
        Self { table }
    }

    fn key(client_id: &str, name: &str) -> Item {
        key(&[("client_id", client_id), ("name", name)])
    }

    pub async fn list(&self, client_id: &str, limit: usize) -> Result<Vec<Task>> {
        let page = self.table.query(&Query::partition(client_id).limit(limit)).await?;
        decode_all(page.items)
    }

    pub async fn put(&self, task: &Task, mode: PutMode) -> Result<()> {
        self.table.put(to_item(task)?, mode).await
    }

    pub async fn get(&self, client_id: &str, name: &str) -> Result<Option<Task>> {
        self.table
            .get(&Self::key(client_id, name))
            .await?
            .map(from_item)
            .transpose()
    }

    /// Apply `changes` and bump `updated_at`.
    pub async fn update(&self, client_id: &str, name: &str, changes: TaskChanges, mode: UpdateMode) -> Result<Task> {
        let mut set = Item::new();
        for (field, value) in [
            ("request", changes.request),
            ("start_datetime", changes.start_datetime),
            ("phone_number", changes.phone_number),
            ("address", changes.address),
        ] {
            if let Some(value) = value {
                set.insert(field.to_string(), Value::String(value));
            }
        }
        set.insert("updated_at".into(), Value::String(now_iso()));
        let item = self.table.update(&Self::key(client_id, name), set, mode).await?;
        from_item(item)
    }

    pub async fn delete(&self, client_id: &str, name: &str, must_exist: bool) -> Result<()> {
        self.table.delete(&Self::key(client_id, name), must_exist).await
    }
}

/// Per-tenant prompt and configuration documents.
#[derive(Clone)]
pub struct PromptRepo {
    table: Arc<dyn KvTable>,
}

impl PromptRepo {
    pub fn new(table: Arc<dyn KvTable>) -> Self {
        Self { table }
    }

    async fn content(&self, client_id: &str, id: &str) -> Result<Option<Value>> {
        let item = self
            .table
            .get(&key(&[("client_id", client_id), ("id", id)]))
            .await?;
        Ok(item.and_then(|mut item| item.remove("content")))
    }

    async fn put_content(&self, client_id: &str, id: &str, content: Value) -> Result<()> {
        let item = to_item(&json!({
            "client_id": client_id,
            "id": id,
            "content": content,
            "updated_at": now_iso(),
        }))?;
        self.table.put(item, PutMode::Overwrite).await
    }

    /// The tenant's system prompt (markdown); empty when unset.
    pub async fn system_prompt(&self, client_id: &str) -> Result<String> {
        Ok(match self.content(client_id, prompt_ids::SYSTEM).await? {
            Some(Value::String(text)) => text,
            _ => String::new(),
        })
    }

    pub async fn set_system_prompt(&self, client_id: &str, markdown: &str) -> Result<()> {
        self.put_content(client_id, prompt_ids::SYSTEM, Value::String(markdown.to_string()))
            .await
    }

    /// A JSON configuration document. Older rows stored it as a JSON string.
    pub async fn json_document(&self, client_id: &str, id: &str) -> Result<Option<Value>> {
        Ok(match self.content(client_id, id).await? {
            Some(Value::Object(map)) => Some(Value::Object(map)),
            Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => Some(Value::Object(map)),
                _ => {
                    warn!(client_id, id, "Stored configuration is not a JSON object");
                    None
                }
            },
            _ => None,
        })
    }

    pub async fn set_json_document(&self, client_id: &str, id: &str, document: Value) -> Result<()> {
        self.put_content(client_id, id, document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTable;

    fn call_repo() -> CallLogRepo {
        CallLogRepo::new(Arc::new(MemoryTable::new(call_logs_schema("calls"))))
    }

    fn turn(client: &str, phone: &str, ts: &str, call_sid: Option<&str>) -> CallLog {
        let mut log = CallLog::new(client, phone, ts);
        log.user_text = format!("user@{}", ts);
        log.assistant_text = format!("bot@{}", ts);
        log.call_sid = call_sid.map(str::to_string);
        log
    }

    #[test]
    fn test_phone_range_bounds() {
        assert_eq!(
            phone_range("090", Some("2024-01-01"), None),
            SortCondition::Between("090#2024-01-01".into(), "090#~".into())
        );
        assert_eq!(
            phone_range("090", None, Some("2024-02-01")),
            SortCondition::Between("090#".into(), "090#2024-02-01".into())
        );
        assert_eq!(
            phone_range("090", Some("2024-01-01"), Some("2024-01-31")),
            SortCondition::Between("090#2024-01-01".into(), "090#2024-01-31".into())
        );
        assert_eq!(phone_range("090", None, None), SortCondition::BeginsWith("090#".into()));
    }

    #[tokio::test]
    async fn test_recent_for_phone_keeps_latest_turns() {
        let repo = call_repo();
        for ts in ["2024-01-01", "2024-01-02", "2024-01-03"] {
            repo.put(&turn("acme", "0901", ts, None)).await.unwrap();
        }
        repo.put(&turn("acme", "0902", "2024-01-09", None)).await.unwrap();

        let logs = repo.recent_for_phone("acme", "0901", 2).await.unwrap();
        let stamps: Vec<_> = logs.iter().map(|log| log.ts.as_str()).collect();
        assert_eq!(stamps, vec!["2024-01-02", "2024-01-03"]);
    }

    #[tokio::test]
    async fn test_list_for_phone_filters_range_and_phone() {
        let repo = call_repo();
        for ts in ["2024-01-01T00:00:00+00:00", "2024-02-01T00:00:00+00:00", "2024-03-01T00:00:00+00:00"] {
            repo.put(&turn("acme", "090", ts, None)).await.unwrap();
        }
        repo.put(&turn("acme", "0901", "2024-02-15T00:00:00+00:00", None)).await.unwrap();
        repo.put(&turn("other", "090", "2024-02-15T00:00:00+00:00", None)).await.unwrap();

        let (logs, next) = repo
            .list_for_phone(
                "acme",
                CallListQuery {
                    phone: "090".into(),
                    from: Some("2024-01-15".into()),
                    limit: 50,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let stamps: Vec<_> = logs.iter().map(|l| l.ts.as_str()).collect();
        assert_eq!(stamps, vec!["2024-02-01T00:00:00+00:00", "2024-03-01T00:00:00+00:00"]);
        assert!(next.is_none());

        let (logs, next) = repo
            .list_for_phone(
                "acme",
                CallListQuery {
                    phone: "090".into(),
                    descending: true,
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(logs[0].ts, "2024-03-01T00:00:00+00:00");
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn test_call_sid_lookup_is_tenant_scoped() {
        let repo = call_repo();
        repo.put(&turn("acme", "090", "t1", Some("CA1"))).await.unwrap();
        repo.put(&turn("acme", "090", "t2", Some("CA1"))).await.unwrap();
        repo.put(&turn("other", "080", "t1", Some("CA1"))).await.unwrap();

        let logs = repo.by_call_sid("acme", "CA1", None).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.client_id == "acme"));

        assert_eq!(repo.delete_call("acme", "CA1").await.unwrap(), 2);
        assert_eq!(repo.by_call_sid("other", "CA1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_phones_sorted_and_capped() {
        let repo = call_repo();
        for phone in ["0903", "0901", "0902", "0901"] {
            repo.put(&turn("acme", phone, &format!("t-{}", phone), None)).await.unwrap();
        }
        repo.put(&turn("acme", "0901", "t-later", None)).await.unwrap();

        assert_eq!(repo.distinct_phones("acme", 1000).await.unwrap(), vec!["0901", "0902", "0903"]);
        assert_eq!(repo.distinct_phones("acme", 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_task_update_requires_existing() {
        let repo = TaskRepo::new(Arc::new(MemoryTable::new(tasks_schema("tasks"))));
        let changes = TaskChanges {
            address: Some("Kyoto".into()),
            ..Default::default()
        };
        let err = repo
            .update("acme", "mow", changes.clone(), UpdateMode::MustExist)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);

        let task = repo.update("acme", "mow", changes, UpdateMode::Upsert).await.unwrap();
        assert_eq!(task.address, "Kyoto");
        assert_eq!(task.name, "mow");
    }

    #[tokio::test]
    async fn test_prompt_documents() {
        let repo = PromptRepo::new(Arc::new(MemoryTable::new(prompts_schema("prompts"))));
        assert_eq!(repo.system_prompt("acme").await.unwrap(), "");

        repo.set_system_prompt("acme", "# 植木屋").await.unwrap();
        assert_eq!(repo.system_prompt("acme").await.unwrap(), "# 植木屋");
        assert_eq!(repo.system_prompt("other").await.unwrap(), "");

        repo.set_json_document("acme", prompt_ids::FUNCTIONS, json!({"tools": []}))
            .await
            .unwrap();
        assert_eq!(
            repo.json_document("acme", prompt_ids::FUNCTIONS).await.unwrap(),
            Some(json!({"tools": []}))
        );

        // Legacy rows hold the document as a JSON string.
        repo.set_json_document("acme", prompt_ids::EXT_TOOLS, json!("{\"ext_tools\":[]}"))
            .await
            .unwrap();
        assert_eq!(
            repo.json_document("acme", prompt_ids::EXT_TOOLS).await.unwrap(),
            Some(json!({"ext_tools": []}))
        );
    }
}
