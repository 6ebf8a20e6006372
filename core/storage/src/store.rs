//! Local store trait definition.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;

use limeaura_common::{Error, Result};

use crate::collection::Collection;

/// A stored record: a primary key plus a JSON object body.
///
/// Indexed fields are read from the top level of `body`.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Get a top-level field of the body.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidInput("Document id cannot be empty".to_string()));
        }
        if !self.body.is_object() {
            return Err(Error::InvalidInput(format!(
                "Document {} body must be a JSON object",
                self.id
            )));
        }
        Ok(())
    }
}

/// An index lookup: `index IN (values)`, optionally sorted by another
/// indexed field.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub index: String,
    pub values: Vec<Value>,
    pub order_by: Option<String>,
}

impl Query {
    /// Match documents whose `index` field equals any of `values`.
    pub fn any_of<V: Into<Value>>(
        index: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            index: index.into(),
            values: values.into_iter().map(Into::into).collect(),
            order_by: None,
        }
    }

    /// Match documents whose `index` field equals `value`.
    pub fn equals(index: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::any_of(index, [value.into()])
    }

    /// Sort results ascending by `field`.
    pub fn sort_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    /// Check the query only touches indexed fields of `collection`.
    pub fn validate(&self, collection: Collection) -> Result<()> {
        if !collection.is_indexed(&self.index) {
            return Err(Error::InvalidInput(format!(
                "Field '{}' is not indexed in {}",
                self.index, collection
            )));
        }
        if let Some(order_by) = &self.order_by {
            if !collection.is_indexed(order_by) {
                return Err(Error::InvalidInput(format!(
                    "Cannot sort {} by unindexed field '{}'",
                    collection, order_by
                )));
            }
        }
        Ok(())
    }

    /// Whether `document` satisfies the predicate.
    pub fn matches(&self, document: &Document) -> bool {
        let field = document.field(&self.index).unwrap_or(&Value::Null);
        self.values
            .iter()
            .any(|value| compare_values(field, value) == Ordering::Equal)
    }

    /// Sort documents by the query's sort field, ties broken by id.
    pub fn sort(&self, documents: &mut [Document]) {
        match &self.order_by {
            Some(field) => documents.sort_by(|a, b| {
                let left = a.field(field).unwrap_or(&Value::Null);
                let right = b.field(field).unwrap_or(&Value::Null);
                compare_values(left, right).then_with(|| a.id.cmp(&b.id))
            }),
            None => documents.sort_by(|a, b| a.id.cmp(&b.id)),
        }
    }
}

/// Total order over JSON scalars: null < bool < number < string < other.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_))
        | (Value::Object(_), Value::Object(_))
        | (Value::Array(_), Value::Object(_))
        | (Value::Object(_), Value::Array(_)) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Local store trait for different backends.
///
/// Every write is atomic per document: readers never observe a partially
/// written record. Implementations must report an unusable backing store as
/// `Error::StoreUnavailable`.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Get a document by primary key.
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>>;

    /// Insert or replace a document.
    ///
    /// # Errors
    /// - Invalid document (empty id, non-object body)
    /// - Store unavailable (quota exceeded, database error)
    async fn put(&self, collection: Collection, document: Document) -> Result<()>;

    /// Delete a document. Deleting a missing id is not an error.
    async fn delete(&self, collection: Collection, id: &str) -> Result<()>;

    /// Run an index query.
    ///
    /// # Errors
    /// - Query names an unindexed field
    /// - Store unavailable
    async fn query(&self, collection: Collection, query: &Query) -> Result<Vec<Document>>;

    /// Count documents matching an index query.
    async fn count(&self, collection: Collection, query: &Query) -> Result<usize> {
        Ok(self.query(collection, query).await?.len())
    }
}
