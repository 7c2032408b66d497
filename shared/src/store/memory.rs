//! In-process [`KvTable`] used by tests and local runs.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Item, KeySchema, KvTable, Page, PutMode, Query, TableSchema, UpdateMode};
use crate::{Error, Result};

type RowKey = (String, String);

/// Items held in a sorted map keyed by (partition, sort).
pub struct MemoryTable {
    schema: TableSchema,
    rows: RwLock<BTreeMap<RowKey, Item>>,
}

impl MemoryTable {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    fn row_key(&self, item: &Item) -> Result<RowKey> {
        let key = self.schema.key_of(item)?;
        Ok(attrs_of(&key, &self.schema.key))
    }
}

fn attr_str(item: &Item, name: &str) -> String {
    item.get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn attrs_of(item: &Item, key: &KeySchema) -> RowKey {
    (
        attr_str(item, key.partition),
        key.sort.map(|s| attr_str(item, s)).unwrap_or_default(),
    )
}

#[async_trait]
impl KvTable for MemoryTable {
    async fn get(&self, key: &Item) -> Result<Option<Item>> {
        let row = self.row_key(key)?;
        Ok(self.rows.read().await.get(&row).cloned())
    }

    async fn put(&self, item: Item, mode: PutMode) -> Result<()> {
        let row = self.row_key(&item)?;
        let mut rows = self.rows.write().await;
        if mode == PutMode::IfAbsent && rows.contains_key(&row) {
            return Err(Error::Conflict("PutItem condition not met".to_string()));
        }
        rows.insert(row, item);
        Ok(())
    }

    async fn update(&self, key: &Item, changes: Item, mode: UpdateMode) -> Result<Item> {
        let row = self.row_key(key)?;
        let key_item = self.schema.key_of(key)?;
        let changes: Vec<(String, Value)> = changes
            .into_iter()
            .filter(|(name, _)| !key_item.contains_key(name))
            .collect();
        if changes.is_empty() {
            return Err(Error::Validation("nothing to update".to_string()));
        }

        let mut rows = self.rows.write().await;
        if !rows.contains_key(&row) {
            if mode == UpdateMode::MustExist {
                return Err(Error::Conflict("UpdateItem condition not met".to_string()));
            }
            rows.insert(row.clone(), key_item);
        }
        let entry = rows
            .get_mut(&row)
            .ok_or_else(|| Error::Internal("row vanished during update".to_string()))?;
        entry.extend(changes);
        Ok(entry.clone())
    }

    async fn delete(&self, key: &Item, must_exist: bool) -> Result<()> {
        let row = self.row_key(key)?;
        let removed = self.rows.write().await.remove(&row);
        if removed.is_none() && must_exist {
            return Err(Error::Conflict("DeleteItem condition not met".to_string()));
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Page> {
        let key_schema = self.schema.key_for(query.index)?;
        let table_key = &self.schema.key;

        // Order by the queried key's sort attribute, then by primary key.
        let order_of = |item: &Item| {
            let (_, sort) = attrs_of(item, key_schema);
            (sort, attrs_of(item, table_key))
        };

        let rows = self.rows.read().await;
        let mut matched: Vec<&Item> = rows
            .values()
            .filter(|item| attr_str(item, key_schema.partition) == query.partition)
            .filter(|item| match (&query.sort, key_schema.sort) {
                (Some(cond), Some(sort_attr)) => cond.matches(&attr_str(item, sort_attr)),
                _ => true,
            })
            .collect();
        matched.sort_by_key(|item| order_of(*item));
        if !query.forward {
            matched.reverse();
        }

        if let Some(start) = &query.start_key {
            let start_order = order_of(start);
            matched.retain(|item| {
                let ord = order_of(*item).cmp(&start_order);
                if query.forward {
                    ord == Ordering::Greater
                } else {
                    ord == Ordering::Less
                }
            });
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        let has_more = matched.len() > limit;
        let items: Vec<Item> = matched.into_iter().take(limit).cloned().collect();

        let last_key = if has_more {
            items.last().map(|last| {
                let mut key = Item::new();
                for attr in [Some(table_key.partition), table_key.sort, Some(key_schema.partition), key_schema.sort]
                    .into_iter()
                    .flatten()
                {
                    if let Some(value) = last.get(attr) {
                        key.insert(attr.to_string(), value.clone());
                    }
                }
                key
            })
        } else {
            None
        };

        Ok(Page { items, last_key })
    }
}
