//! Typed records on top of the document store.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use limeaura_common::model::{Comment, Project, Task};
use limeaura_common::{Error, Result};

use crate::collection::Collection;
use crate::store::{Document, LocalStore, Query};

/// A strongly typed value stored in one collection.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection the record lives in.
    const COLLECTION: Collection;

    /// Primary key.
    fn record_id(&self) -> &str;

    /// Encode as a store document.
    fn to_document(&self) -> Result<Document> {
        let body = serde_json::to_value(self)?;
        Ok(Document::new(self.record_id(), body))
    }

    /// Decode a store document.
    fn from_document(document: Document) -> Result<Self> {
        serde_json::from_value(document.body).map_err(|e| {
            Error::Serialization(format!(
                "{}/{}: {}",
                Self::COLLECTION,
                document.id,
                e
            ))
        })
    }
}

/// Typed accessors available on every [`LocalStore`].
#[async_trait]
pub trait RecordStore: LocalStore {
    async fn get_record<R: Record>(&self, id: &str) -> Result<Option<R>> {
        self.get(R::COLLECTION, id)
            .await?
            .map(R::from_document)
            .transpose()
    }

    async fn put_record<R: Record>(&self, record: &R) -> Result<()> {
        let document = record.to_document()?;
        self.put(R::COLLECTION, document).await
    }

    async fn delete_record<R: Record>(&self, id: &str) -> Result<()> {
        self.delete(R::COLLECTION, id).await
    }

    async fn query_records<R: Record>(&self, query: &Query) -> Result<Vec<R>> {
        self.query(R::COLLECTION, query)
            .await?
            .into_iter()
            .map(R::from_document)
            .collect()
    }
}

impl<S: LocalStore + ?Sized> RecordStore for S {}

impl Record for Task {
    const COLLECTION: Collection = Collection::Tasks;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Project {
    const COLLECTION: Collection = Collection::Projects;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Comment {
    const COLLECTION: Collection = Collection::Comments;

    fn record_id(&self) -> &str {
        &self.id
    }
}
