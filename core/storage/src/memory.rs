//! In-memory store for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use limeaura_common::{Error, Result};

use crate::collection::Collection;
use crate::store::{Document, LocalStore, Query};

type Tables = HashMap<Collection, BTreeMap<String, Value>>;

/// In-memory store.
///
/// Useful for testing and ephemeral sessions. All data is stored in memory
/// and lost on drop. An optional quota caps the total number of documents to
/// exercise the quota-exceeded path.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    quota: Option<usize>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            quota: None,
        }
    }

    /// Create a store that rejects writes once it holds `max_documents`.
    pub fn with_quota(max_documents: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            quota: Some(max_documents),
        }
    }

    /// Total number of documents across all collections.
    pub fn document_count(&self) -> Result<usize> {
        Ok(self.read()?.values().map(BTreeMap::len).sum())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        let tables = self.read()?;
        Ok(tables
            .get(&collection)
            .and_then(|table| table.get(id))
            .map(|body| Document::new(id, body.clone())))
    }

    async fn put(&self, collection: Collection, document: Document) -> Result<()> {
        document.validate()?;
        let mut tables = self.write()?;

        if let Some(quota) = self.quota {
            let exists = tables
                .get(&collection)
                .is_some_and(|table| table.contains_key(&document.id));
            let total: usize = tables.values().map(BTreeMap::len).sum();
            if !exists && total >= quota {
                return Err(Error::StoreUnavailable(format!(
                    "quota exceeded: {} documents",
                    quota
                )));
            }
        }

        tables
            .entry(collection)
            .or_default()
            .insert(document.id, document.body);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(table) = tables.get_mut(&collection) {
            table.remove(id);
        }
        Ok(())
    }

    async fn query(&self, collection: Collection, query: &Query) -> Result<Vec<Document>> {
        query.validate(collection)?;
        let tables = self.read()?;

        let mut documents: Vec<Document> = tables
            .get(&collection)
            .map(|table| {
                table
                    .iter()
                    .map(|(id, body)| Document::new(id.clone(), body.clone()))
                    .filter(|document| query.matches(document))
                    .collect()
            })
            .unwrap_or_default();

        query.sort(&mut documents);
        Ok(documents)
    }
}
