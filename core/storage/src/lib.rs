//! Persistent local store for the LimeAura offline modules.
//!
//! This module provides a trait-based interface over durable, indexed
//! document storage, plus two backends:
//! - [`MemoryStore`]: in-process, for tests and ephemeral sessions
//! - [`SqliteStore`]: durable storage that survives process restarts
//!
//! # Design Principles
//! - Fixed schema: every collection declares its secondary indexes up front
//! - Async operations: all store access is async
//! - Loud failures: an unusable store surfaces as `Error::StoreUnavailable`,
//!   writes are never silently dropped

pub mod collection;
pub mod memory;
pub mod record;
pub mod sqlite;
pub mod store;

pub use collection::Collection;
pub use memory::MemoryStore;
pub use record::{Record, RecordStore};
pub use sqlite::SqliteStore;
pub use store::{Document, LocalStore, Query};
