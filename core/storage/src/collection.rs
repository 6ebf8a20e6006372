//! Collection schema: names and secondary indexes.

use std::fmt;

/// A logical collection in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Tasks,
    Projects,
    Comments,
    /// The pending mutation queue.
    SyncOperations,
}

impl Collection {
    /// All collections, in schema order.
    pub const ALL: [Collection; 4] = [
        Collection::Tasks,
        Collection::Projects,
        Collection::Comments,
        Collection::SyncOperations,
    ];

    /// Stored collection name.
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Tasks => "tasks",
            Collection::Projects => "projects",
            Collection::Comments => "comments",
            Collection::SyncOperations => "syncOperations",
        }
    }

    /// Fields with a secondary index. Only these may be queried or sorted on.
    pub fn indexes(&self) -> &'static [&'static str] {
        match self {
            Collection::Tasks => &[
                "project_id",
                "status",
                "priority",
                "assignee_id",
                "due_date",
                "version",
            ],
            Collection::Projects => &["workspace_id", "status", "identifier"],
            Collection::Comments => &["task_id", "author_id"],
            Collection::SyncOperations => &["entity_id", "state", "created_at"],
        }
    }

    /// Check whether `field` is indexed in this collection.
    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexes().contains(&field)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
