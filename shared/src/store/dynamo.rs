//! DynamoDB-backed [`KvTable`].

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, SdkError};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client as DynamoDbClient;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Number, Value};
use tracing::debug;

use super::{Item, KvTable, Page, PutMode, Query, SortCondition, TableSchema, UpdateMode};
use crate::{Error, Result};

/// A DynamoDB table accessed through the AWS SDK.
#[derive(Clone)]
pub struct DynamoTable {
    client: DynamoDbClient,
    schema: TableSchema,
}

impl DynamoTable {
    pub fn new(client: DynamoDbClient, schema: TableSchema) -> Self {
        Self { client, schema }
    }

    fn table_name(&self) -> &str {
        &self.schema.name
    }
}

/// Convert a JSON value into a DynamoDB attribute.
fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(values) => AttributeValue::L(values.iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), to_attribute(v)))
                .collect(),
        ),
    }
}

/// Convert a DynamoDB attribute into JSON. Integral numbers become integers.
fn from_attribute(attr: &AttributeValue) -> Value {
    match attr {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => number_value(n),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(values) => Value::Array(values.iter().map(from_attribute).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), from_attribute(v)))
                .collect(),
        ),
        AttributeValue::Ss(values) => Value::Array(values.iter().cloned().map(Value::String).collect()),
        AttributeValue::Ns(values) => Value::Array(values.iter().map(|n| number_value(n)).collect()),
        AttributeValue::B(blob) => Value::String(blob_string(blob)),
        AttributeValue::Bs(blobs) => Value::Array(blobs.iter().map(|b| Value::String(blob_string(b))).collect()),
        _ => Value::Null,
    }
}

fn number_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => Value::from(f as i64),
        Ok(f) => Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
        Err(_) => Value::String(raw.to_string()),
    }
}

fn blob_string(blob: &Blob) -> String {
    BASE64.encode(blob.as_ref())
}

fn to_attribute_map(item: &Item) -> HashMap<String, AttributeValue> {
    item.iter()
        .map(|(k, v)| (k.clone(), to_attribute(v)))
        .collect()
}

fn from_attribute_map(map: &HashMap<String, AttributeValue>) -> Item {
    map.iter()
        .map(|(k, v)| (k.clone(), from_attribute(v)))
        .collect()
}

/// Map an SDK failure, turning a failed condition into [`Error::Conflict`].
fn sdk_error<E, R>(op: &str, err: SdkError<E, R>, conditional_failed: impl Fn(&E) -> bool) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    if err.as_service_error().is_some_and(|e| conditional_failed(e)) {
        return Error::Conflict(format!("{} condition not met", op));
    }
    Error::Store(format!("{} failed: {}", op, DisplayErrorContext(&err)))
}

#[async_trait]
impl KvTable for DynamoTable {
    async fn get(&self, key: &Item) -> Result<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(self.table_name())
            .set_key(Some(to_attribute_map(key)))
            .send()
            .await
            .map_err(|e| sdk_error("GetItem", e, |_| false))?;

        Ok(output.item().map(from_attribute_map))
    }

    async fn put(&self, item: Item, mode: PutMode) -> Result<()> {
        let mut request = self
            .client
            .put_item()
            .table_name(self.table_name())
            .set_item(Some(to_attribute_map(&item)));

        if mode == PutMode::IfAbsent {
            request = request
                .condition_expression("attribute_not_exists(#pk)")
                .expression_attribute_names("#pk", self.schema.key.partition);
        }

        request
            .send()
            .await
            .map_err(|e| sdk_error("PutItem", e, |se| se.is_conditional_check_failed_exception()))?;
        Ok(())
    }

    async fn update(&self, key: &Item, changes: Item, mode: UpdateMode) -> Result<Item> {
        let key_attrs: Vec<&str> = std::iter::once(self.schema.key.partition)
            .chain(self.schema.key.sort)
            .collect();

        let mut assignments = Vec::new();
        let mut request = self
            .client
            .update_item()
            .table_name(self.table_name())
            .set_key(Some(to_attribute_map(key)))
            .return_values(ReturnValue::AllNew);

        for (i, (name, value)) in changes
            .iter()
            .filter(|(name, _)| !key_attrs.contains(&name.as_str()))
            .enumerate()
        {
            assignments.push(format!("#f{i} = :v{i}"));
            request = request
                .expression_attribute_names(format!("#f{i}"), name)
                .expression_attribute_values(format!(":v{i}"), to_attribute(value));
        }

        if assignments.is_empty() {
            return Err(Error::Validation("nothing to update".to_string()));
        }
        request = request.update_expression(format!("SET {}", assignments.join(", ")));

        if mode == UpdateMode::MustExist {
            request = request
                .condition_expression("attribute_exists(#pk)")
                .expression_attribute_names("#pk", self.schema.key.partition);
        }

        let output = request
            .send()
            .await
            .map_err(|e| sdk_error("UpdateItem", e, |se| se.is_conditional_check_failed_exception()))?;

        Ok(output.attributes().map(from_attribute_map).unwrap_or_default())
    }

    async fn delete(&self, key: &Item, must_exist: bool) -> Result<()> {
        let mut request = self
            .client
            .delete_item()
            .table_name(self.table_name())
            .set_key(Some(to_attribute_map(key)));

        if must_exist {
            request = request
                .condition_expression("attribute_exists(#pk)")
                .expression_attribute_names("#pk", self.schema.key.partition);
        }

        request
            .send()
            .await
            .map_err(|e| sdk_error("DeleteItem", e, |se| se.is_conditional_check_failed_exception()))?;
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Page> {
        let key_schema = self.schema.key_for(query.index)?;

        let mut condition = "#pk = :pk".to_string();
        let mut request = self
            .client
            .query()
            .table_name(self.table_name())
            .set_index_name(query.index.map(str::to_string))
            .scan_index_forward(query.forward)
            .expression_attribute_names("#pk", key_schema.partition)
            .expression_attribute_values(":pk", AttributeValue::S(query.partition.clone()));

        if let Some(sort) = &query.sort {
            let sort_attr = key_schema
                .sort
                .ok_or_else(|| Error::Store("Sort condition on a table without sort key".to_string()))?;
            request = request.expression_attribute_names("#sk", sort_attr);
            let (expr, values) = match sort {
                SortCondition::BeginsWith(prefix) => ("begins_with(#sk, :lo)", vec![(":lo", prefix)]),
                SortCondition::Between(lo, hi) => ("#sk BETWEEN :lo AND :hi", vec![(":lo", lo), (":hi", hi)]),
                SortCondition::AtLeast(lo) => ("#sk >= :lo", vec![(":lo", lo)]),
                SortCondition::AtMost(hi) => ("#sk <= :hi", vec![(":hi", hi)]),
            };
            condition.push_str(" AND ");
            condition.push_str(expr);
            for (name, value) in values {
                request = request.expression_attribute_values(name, AttributeValue::S(value.clone()));
            }
        }

        if let Some(limit) = query.limit {
            request = request.limit(i32::try_from(limit).unwrap_or(i32::MAX));
        }
        if let Some(start) = &query.start_key {
            request = request.set_exclusive_start_key(Some(to_attribute_map(start)));
        }

        let output = request
            .key_condition_expression(condition)
            .send()
            .await
            .map_err(|e| sdk_error("Query", e, |_| false))?;

        let items: Vec<Item> = output.items().iter().map(from_attribute_map).collect();
        debug!(table = %self.table_name(), count = items.len(), "query page");

        Ok(Page {
            items,
            last_key: output.last_evaluated_key().map(from_attribute_map),
        })
    }
}
