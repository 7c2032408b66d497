//! Key-value table access.
//!
//! Handlers talk to tables through [`KvTable`], which mirrors the subset of
//! DynamoDB they rely on: point reads and writes keyed by partition/sort key,
//! conditional writes, and partition queries with a sort-key condition.
//! [`DynamoTable`] is the production implementation, [`MemoryTable`] an
//! in-process one with the same semantics.

mod dynamo;
mod memory;

pub use dynamo::DynamoTable;
pub use memory::MemoryTable;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{Error, Result};

/// A stored item: attribute name to JSON value.
pub type Item = Map<String, Value>;

/// Primary or secondary key layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    pub partition: &'static str,
    pub sort: Option<&'static str>,
}

/// A global secondary index.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub name: &'static str,
    pub key: KeySchema,
}

/// Table name plus its key layout.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub key: KeySchema,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, partition: &'static str, sort: Option<&'static str>) -> Self {
        Self {
            name: name.into(),
            key: KeySchema { partition, sort },
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, name: &'static str, partition: &'static str, sort: Option<&'static str>) -> Self {
        self.indexes.push(IndexSchema {
            name,
            key: KeySchema { partition, sort },
        });
        self
    }

    /// Key layout used by a query: the table's own or the named index's.
    pub fn key_for(&self, index: Option<&str>) -> Result<&KeySchema> {
        match index {
            None => Ok(&self.key),
            Some(name) => self
                .indexes
                .iter()
                .find(|idx| idx.name == name)
                .map(|idx| &idx.key)
                .ok_or_else(|| Error::Store(format!("Unknown index {} on {}", name, self.name))),
        }
    }

    /// Extract the primary key attributes of `item`.
    pub fn key_of(&self, item: &Item) -> Result<Item> {
        let mut key = Item::new();
        for attr in std::iter::once(self.key.partition).chain(self.key.sort) {
            let value = item
                .get(attr)
                .filter(|v| v.as_str().is_some_and(|s| !s.is_empty()))
                .ok_or_else(|| Error::Validation(format!("{} is required", attr)))?;
            key.insert(attr.to_string(), value.clone());
        }
        Ok(key)
    }
}

/// Write behavior when the item may already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    Overwrite,
    /// Fail with [`Error::Conflict`] if the key is taken.
    IfAbsent,
}

/// Update behavior when the item may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Upsert,
    /// Fail with [`Error::Conflict`] if the key does not exist.
    MustExist,
}

/// Condition on the sort key of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortCondition {
    BeginsWith(String),
    /// Inclusive on both ends.
    Between(String, String),
    AtLeast(String),
    AtMost(String),
}

impl SortCondition {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            SortCondition::BeginsWith(prefix) => value.starts_with(prefix.as_str()),
            SortCondition::Between(lo, hi) => value >= lo.as_str() && value <= hi.as_str(),
            SortCondition::AtLeast(lo) => value >= lo.as_str(),
            SortCondition::AtMost(hi) => value <= hi.as_str(),
        }
    }
}

/// A partition query.
#[derive(Debug, Clone)]
pub struct Query {
    pub index: Option<&'static str>,
    pub partition: String,
    pub sort: Option<SortCondition>,
    pub forward: bool,
    pub limit: Option<usize>,
    pub start_key: Option<Item>,
}

impl Query {
    pub fn partition(value: impl Into<String>) -> Self {
        Self {
            index: None,
            partition: value.into(),
            sort: None,
            forward: true,
            limit: None,
            start_key: None,
        }
    }

    pub fn index(mut self, name: &'static str) -> Self {
        self.index = Some(name);
        self
    }

    pub fn sort(mut self, condition: SortCondition) -> Self {
        self.sort = Some(condition);
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.forward = !descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, key: Option<Item>) -> Self {
        self.start_key = key;
        self
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    /// Key to resume from; `None` once the query is exhausted.
    pub last_key: Option<Item>,
}

/// Access to a single key-value table.
#[async_trait]
pub trait KvTable: Send + Sync {
    async fn get(&self, key: &Item) -> Result<Option<Item>>;

    async fn put(&self, item: Item, mode: PutMode) -> Result<()>;

    /// Set the given attributes and return the whole item after the update.
    async fn update(&self, key: &Item, changes: Item, mode: UpdateMode) -> Result<Item>;

    async fn delete(&self, key: &Item, must_exist: bool) -> Result<()>;

    async fn query(&self, query: &Query) -> Result<Page>;
}

/// Serialize a model into a storable item.
pub fn to_item<T: Serialize>(value: &T) -> Result<Item> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Internal(format!("Expected an object, got {}", other))),
    }
}

/// Deserialize a stored item into a model.
pub fn from_item<T: DeserializeOwned>(item: Item) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(item))?)
}

/// Build a key item from attribute/value pairs.
pub fn key(pairs: &[(&str, &str)]) -> Item {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
        .collect()
}
