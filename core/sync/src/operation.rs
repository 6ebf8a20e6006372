//! Sync operations: queued mutations and their lifecycle state.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use limeaura_common::model::{
    CreateCommentDto, CreateProjectDto, CreateTaskDto, UpdateCommentDto, UpdateProjectDto,
    UpdateTaskDto,
};
use limeaura_common::{EntityKind, Error, OperationId, OperationType, Result};
use limeaura_storage::{Collection, Record};

/// Lifecycle state of a queued operation.
///
/// ```text
/// pending  --> syncing
/// syncing  --> [removed] | conflict | failed
/// failed   --> syncing
/// conflict --> pending          (explicit resolution)
/// syncing  --> pending          (recovery after an interrupted pass)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Pending,
    Syncing,
    /// Confirmed by the remote. Never persisted: synced operations are removed.
    Synced,
    Conflict,
    Failed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::Syncing => "syncing",
            OperationState::Synced => "synced",
            OperationState::Conflict => "conflict",
            OperationState::Failed => "failed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Failed, Syncing)
                | (Syncing, Synced)
                | (Syncing, Conflict)
                | (Syncing, Failed)
                | (Syncing, Pending)
                | (Conflict, Pending)
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation of one entity kind, carrying that kind's DTOs.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange<C, U> {
    Create(C),
    Update(U),
    Delete,
}

impl<C, U> EntityChange<C, U>
where
    C: Serialize + DeserializeOwned,
    U: Serialize + DeserializeOwned,
{
    pub fn operation_type(&self) -> OperationType {
        match self {
            EntityChange::Create(_) => OperationType::Create,
            EntityChange::Update(_) => OperationType::Update,
            EntityChange::Delete => OperationType::Delete,
        }
    }

    fn body(&self) -> Result<Option<Value>> {
        Ok(match self {
            EntityChange::Create(dto) => Some(serde_json::to_value(dto)?),
            EntityChange::Update(dto) => Some(serde_json::to_value(dto)?),
            EntityChange::Delete => None,
        })
    }

    fn from_parts(op_type: OperationType, data: Option<Value>) -> Result<Self> {
        let required = |data: Option<Value>| {
            data.ok_or_else(|| {
                Error::InvalidInput(format!("{} operation requires a data payload", op_type))
            })
        };
        Ok(match op_type {
            OperationType::Create => EntityChange::Create(serde_json::from_value(required(data)?)?),
            OperationType::Update => EntityChange::Update(serde_json::from_value(required(data)?)?),
            OperationType::Delete => EntityChange::Delete,
        })
    }
}

/// A typed mutation, keyed by entity kind and operation type.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Task(EntityChange<CreateTaskDto, UpdateTaskDto>),
    Project(EntityChange<CreateProjectDto, UpdateProjectDto>),
    Comment(EntityChange<CreateCommentDto, UpdateCommentDto>),
}

impl Change {
    /// A delete of the given entity kind.
    pub fn delete(entity: EntityKind) -> Self {
        match entity {
            EntityKind::Task => Change::Task(EntityChange::Delete),
            EntityKind::Project => Change::Project(EntityChange::Delete),
            EntityKind::Comment => Change::Comment(EntityChange::Delete),
        }
    }

    /// Build a change from its untyped parts, validating the payload against
    /// the DTO for `entity` and `op_type`. The payload is ignored for deletes.
    pub fn from_parts(entity: EntityKind, op_type: OperationType, data: Option<Value>) -> Result<Self> {
        Ok(match entity {
            EntityKind::Task => Change::Task(EntityChange::from_parts(op_type, data)?),
            EntityKind::Project => Change::Project(EntityChange::from_parts(op_type, data)?),
            EntityKind::Comment => Change::Comment(EntityChange::from_parts(op_type, data)?),
        })
    }

    pub fn entity(&self) -> EntityKind {
        match self {
            Change::Task(_) => EntityKind::Task,
            Change::Project(_) => EntityKind::Project,
            Change::Comment(_) => EntityKind::Comment,
        }
    }

    pub fn operation_type(&self) -> OperationType {
        match self {
            Change::Task(change) => change.operation_type(),
            Change::Project(change) => change.operation_type(),
            Change::Comment(change) => change.operation_type(),
        }
    }

    /// Request body, `None` for deletes.
    pub fn body(&self) -> Result<Option<Value>> {
        match self {
            Change::Task(change) => change.body(),
            Change::Project(change) => change.body(),
            Change::Comment(change) => change.body(),
        }
    }
}

/// A mutation awaiting confirmation by the remote system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredOperation", into = "StoredOperation")]
pub struct SyncOperation {
    pub id: OperationId,
    pub entity_id: String,
    pub change: Change,
    pub state: OperationState,
    /// Non-conflict failures so far.
    pub retries: u32,
    /// FIFO ordering key, microsecond precision.
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl SyncOperation {
    pub fn entity(&self) -> EntityKind {
        self.change.entity()
    }

    pub fn operation_type(&self) -> OperationType {
        self.change.operation_type()
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}]",
            self.operation_type(),
            self.entity(),
            self.entity_id,
            self.id
        )
    }
}

impl Record for SyncOperation {
    const COLLECTION: Collection = Collection::SyncOperations;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

/// Persisted layout of a queue entry.
#[derive(Serialize, Deserialize)]
struct StoredOperation {
    id: OperationId,
    #[serde(rename = "type")]
    op_type: OperationType,
    entity: EntityKind,
    entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    state: OperationState,
    #[serde(default)]
    retries: u32,
    #[serde(with = "chrono::serde::ts_microseconds")]
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl TryFrom<StoredOperation> for SyncOperation {
    type Error = Error;

    fn try_from(stored: StoredOperation) -> Result<Self> {
        let change = Change::from_parts(stored.entity, stored.op_type, stored.data)?;
        Ok(Self {
            id: stored.id,
            entity_id: stored.entity_id,
            change,
            state: stored.state,
            retries: stored.retries,
            created_at: stored.created_at,
            last_error: stored.last_error,
        })
    }
}

impl From<SyncOperation> for StoredOperation {
    fn from(op: SyncOperation) -> Self {
        // DTOs are plain data, so encoding them cannot fail.
        let data = op.change.body().ok().flatten();
        Self {
            id: op.id,
            op_type: op.change.operation_type(),
            entity: op.change.entity(),
            entity_id: op.entity_id,
            data,
            state: op.state,
            retries: op.retries,
            created_at: op.created_at,
            last_error: op.last_error,
        }
    }
}
