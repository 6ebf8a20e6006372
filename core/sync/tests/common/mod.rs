// Test helpers are shared across multiple test binaries, and not every test
// file uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use limeaura_common::{EntityKind, Error, OperationType, Result};
use limeaura_storage::MemoryStore;
use limeaura_sync::{
    Change, Connectivity, OfflineSync, QueueStatus, RemoteApi, RemoteRequest, RemoteResponse,
    SyncConfig,
};

/// Scripted answer for one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Conflict,
    Fail(&'static str),
}

/// In-process remote that records requests and answers from a script.
///
/// Replies are queued per request line (`"PATCH /tasks/t-1"`); unscripted
/// requests succeed with 200. With a gate installed, each request waits for
/// a permit before answering.
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<RemoteRequest>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    pub started: Notify,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, request_line: &str, reply: Reply) {
        self.script
            .lock()
            .unwrap()
            .entry(request_line.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Hold every request until a permit is added to the returned semaphore.
    pub fn install_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Request lines in the order they were sent.
    pub fn request_lines(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: &RemoteRequest) -> Result<RemoteResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.started.notify_one();

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?
                .forget();
        }

        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(&request.to_string())
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Status(200));

        match reply {
            Reply::Status(status @ 200..=299) => Ok(RemoteResponse { status, body: None }),
            Reply::Status(status) => Err(Error::Transport(format!("{}: HTTP {}", request, status))),
            Reply::Conflict => Err(Error::RemoteConflict(format!("{}: HTTP 409", request))),
            Reply::Fail(reason) => Err(Error::Transport(format!("{}: {}", request, reason))),
        }
    }
}

pub fn create_task(project_id: &str, title: &str) -> Change {
    Change::from_parts(
        EntityKind::Task,
        OperationType::Create,
        Some(json!({ "project_id": project_id, "title": title })),
    )
    .unwrap()
}

pub fn update_task(title: &str) -> Change {
    Change::from_parts(
        EntityKind::Task,
        OperationType::Update,
        Some(json!({ "title": title })),
    )
    .unwrap()
}

pub async fn start_service(
    store: Arc<MemoryStore>,
    remote: Arc<ScriptedRemote>,
    connectivity: Connectivity,
) -> OfflineSync<MemoryStore, ScriptedRemote> {
    OfflineSync::start(store, remote, connectivity, &SyncConfig::default())
        .await
        .unwrap()
}

/// Poll the queue until `done` holds or a few seconds pass.
pub async fn wait_for_status(
    sync: &OfflineSync<MemoryStore, ScriptedRemote>,
    done: impl Fn(&QueueStatus) -> bool,
) -> QueueStatus {
    for _ in 0..300 {
        let status = sync.status().await.unwrap();
        if done(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue did not reach the expected state");
}
