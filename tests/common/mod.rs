//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use logresponder::action::ActionName;
use logresponder::executor::{ExecutionResult, Executor, ExecutorError};
use logresponder::gate::ApprovalStore;
use logresponder::incident::{Incident, IncidentId, IncidentUpdate, PipelineState};
use logresponder::pipeline::Orchestrator;
use logresponder::storage::{IncidentStore, MemoryStore, StoreError};
use logresponder::summarize::{BackendError, SummarizerClient, SummaryBackend};

pub const PORT_80_LINE: &str = "ERROR: Apache failed to start. Port 80 is in use.";
pub const DB_TIMEOUT_LINE: &str = "CRITICAL: Database connection timeout after 30 seconds";

// ---------------------------------------------------------------------------
// Summarizer backend
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum Behavior {
    Reply(String),
    Unavailable,
    Hang,
}

/// Scripted model. Records every context it was asked about.
pub struct FakeBackend {
    behavior: Behavior,
    pub contexts: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn reply(content: &str) -> Arc<Self> {
        Self::with(Behavior::Reply(content.to_string()))
    }

    pub fn unavailable() -> Arc<Self> {
        Self::with(Behavior::Unavailable)
    }

    pub fn hang() -> Arc<Self> {
        Self::with(Behavior::Hang)
    }

    fn with(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl SummaryBackend for FakeBackend {
    async fn complete(&self, context: &str) -> Result<String, BackendError> {
        self.contexts.lock().unwrap().push(context.to_string());
        match &self.behavior {
            Behavior::Reply(content) => Ok(content.clone()),
            Behavior::Unavailable => Err(BackendError::Transport("connection refused".into())),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(BackendError::Transport("unreachable".into()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct RecordingExecutor {
    pub calls: Mutex<Vec<ActionName>>,
    exit_code: i32,
    spawn_fails: bool,
    delay: Duration,
}

impl RecordingExecutor {
    pub fn succeeding() -> Arc<Self> {
        Self::exiting(0)
    }

    pub fn exiting(exit_code: i32) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            exit_code,
            spawn_fails: false,
            delay: Duration::ZERO,
        })
    }

    /// Succeeds after `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            exit_code: 0,
            spawn_fails: false,
            delay,
        })
    }

    pub fn unspawnable() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            exit_code: 0,
            spawn_fails: true,
            delay: Duration::ZERO,
        })
    }

    pub fn calls(&self) -> Vec<ActionName> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Executor for RecordingExecutor {
    async fn run(&self, action: ActionName) -> Result<ExecutionResult, ExecutorError> {
        self.calls.lock().unwrap().push(action);
        if self.spawn_fails {
            return Err(ExecutorError::Spawn {
                program: "./actions.sh".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        tokio::time::sleep(self.delay).await;
        Ok(ExecutionResult {
            exit_code: self.exit_code,
            stdout_tail: format!("ran {action}\n"),
            duration_ms: 3 + self.delay.as_millis() as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Delegates to a `MemoryStore`, failing the first `fail_writes` writes and
/// recording the state carried by every successful write.
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_writes: AtomicUsize,
    always_fail: bool,
    pub written_states: Mutex<Vec<PipelineState>>,
}

impl FlakyStore {
    pub fn reliable() -> Arc<Self> {
        Self::failing_first(0)
    }

    pub fn failing_first(n: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            fail_writes: AtomicUsize::new(n),
            always_fail: false,
            written_states: Mutex::new(Vec::new()),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            fail_writes: AtomicUsize::new(0),
            always_fail: true,
            written_states: Mutex::new(Vec::new()),
        })
    }

    pub fn states(&self) -> Vec<PipelineState> {
        self.written_states.lock().unwrap().clone()
    }

    fn should_fail(&self) -> bool {
        if self.always_fail {
            return true;
        }
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl IncidentStore for FlakyStore {
    async fn put_incident(&self, incident: &Incident) -> Result<IncidentId, StoreError> {
        if self.should_fail() {
            return Err(StoreError::Unavailable("disk on fire".into()));
        }
        self.written_states.lock().unwrap().push(incident.state);
        self.inner.put_incident(incident).await
    }

    async fn update_incident(
        &self,
        id: IncidentId,
        update: &IncidentUpdate,
    ) -> Result<(), StoreError> {
        if self.should_fail() {
            return Err(StoreError::Unavailable("disk on fire".into()));
        }
        self.inner.update_incident(id, update).await?;
        if let Some(state) = update.state {
            self.written_states.lock().unwrap().push(state);
        }
        Ok(())
    }

    async fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
        self.inner.get_incident(id).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Incident>, StoreError> {
        self.inner.list_recent(limit).await
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn orchestrator(
    backend: Arc<FakeBackend>,
    executor: Arc<RecordingExecutor>,
    store: Arc<dyn IncidentStore>,
) -> Orchestrator {
    orchestrator_with_approvals(backend, executor, store, Arc::new(MemoryStore::new()))
}

pub fn orchestrator_with_approvals(
    backend: Arc<FakeBackend>,
    executor: Arc<RecordingExecutor>,
    store: Arc<dyn IncidentStore>,
    approvals: Arc<dyn ApprovalStore>,
) -> Orchestrator {
    Orchestrator::new(SummarizerClient::new(backend, 16 * 1024), executor, store, approvals)
        .with_summarizer_timeout(Duration::from_millis(500))
        .with_persistence(3, Duration::from_millis(5))
}
