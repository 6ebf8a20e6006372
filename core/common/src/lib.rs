//! Common utilities and types shared across the LimeAura offline modules.
//!
//! This crate holds the error taxonomy, identifiers and the domain models
//! (tasks, projects, comments) with their request DTOs.

pub mod error;
pub mod model;
pub mod types;

pub use error::{Error, Result};
pub use types::{EntityKind, OperationId, OperationType};
