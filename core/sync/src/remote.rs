//! Remote API seam used by the sync engine.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use std::fmt;

use limeaura_common::{OperationType, Result};

use crate::operation::SyncOperation;

/// Characters left unescaped in a path segment (RFC 3986 unreserved).
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request against the remote API, relative to its base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    /// Path starting with `/`, e.g. `/tasks/t-1`.
    pub path: String,
    pub body: Option<Value>,
}

impl RemoteRequest {
    /// Map an operation onto its REST call.
    ///
    /// CREATE posts to the collection, UPDATE patches and DELETE deletes the
    /// entity resource.
    pub fn for_operation(op: &SyncOperation) -> Result<Self> {
        let collection = op.entity().collection();
        let resource = || {
            format!(
                "/{}/{}",
                collection,
                utf8_percent_encode(&op.entity_id, PATH_SEGMENT)
            )
        };

        let (method, path) = match op.operation_type() {
            OperationType::Create => (Method::Post, format!("/{}", collection)),
            OperationType::Update => (Method::Patch, resource()),
            OperationType::Delete => (Method::Delete, resource()),
        };

        Ok(Self {
            method,
            path,
            body: op.change.body()?,
        })
    }
}

impl fmt::Display for RemoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    /// Parsed JSON body, `None` when empty.
    pub body: Option<Value>,
}

/// Transport to the remote API.
///
/// Implementations report HTTP 409 as `Error::RemoteConflict` and every other
/// failure (network, timeout, non-2xx status) as `Error::Transport`.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Transport name for logging.
    fn name(&self) -> &str;

    async fn execute(&self, request: &RemoteRequest) -> Result<RemoteResponse>;
}
