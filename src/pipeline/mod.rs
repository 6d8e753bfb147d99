//! Pipeline orchestrator -- drives one anomalous line to a terminal outcome.
//!
//! Detector, summarizer, fallback rules, gate and executor run in that order
//! for every flagged line. Each state transition is written to the incident
//! store; a store failure never stops the incident, it only delays the write.

pub mod watch;

use crate::action::ActionName;
use crate::audit::{AuditEntry, AuditEventType, AuditLog};
use crate::config::ResponderConfig;
use crate::detect::{Detector, LogLine};
use crate::executor::{ExecutionResult, Executor, ProcessExecutor, NO_EXIT_CODE};
use crate::gate::{self, ApprovalStore, Decision, GateDecision, Policy};
use crate::incident::{Incident, IncidentId, IncidentReport, IncidentUpdate, PipelineState, TransitionError};
use crate::storage::{IncidentStore, StoreError};
use crate::summarize::openrouter::ChatCompletionsBackend;
use crate::summarize::{resolve_fallback, SummarizerClient, SummaryResult};
use anyhow::Context;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use watch::{watch, LogSource, WatchOptions, WatchStats};

const DEFAULT_SUMMARIZER_TIMEOUT: Duration = Duration::from_secs(8);

pub struct Orchestrator {
    detector: Detector,
    summarizer: SummarizerClient,
    summarizer_timeout: Duration,
    policy: Policy,
    executor: Arc<dyn Executor>,
    store: Arc<dyn IncidentStore>,
    approvals: Arc<dyn ApprovalStore>,
    audit: Option<Arc<AuditLog>>,
    abort: CancellationToken,
    persist_retries: u32,
    persist_backoff: Duration,
}

/// Why an incident stopped before reaching a terminal state on its own.
#[derive(Debug)]
enum Halt {
    Aborted,
    Illegal(TransitionError),
}

impl From<TransitionError> for Halt {
    fn from(e: TransitionError) -> Self {
        Halt::Illegal(e)
    }
}

impl Orchestrator {
    /// Defaults: keyword detector, dry-run policy, 8s summarizer timeout,
    /// 3 persistence attempts 200ms apart, no audit file.
    pub fn new(
        summarizer: SummarizerClient,
        executor: Arc<dyn Executor>,
        store: Arc<dyn IncidentStore>,
        approvals: Arc<dyn ApprovalStore>,
    ) -> Self {
        Self {
            detector: Detector::default(),
            summarizer,
            summarizer_timeout: DEFAULT_SUMMARIZER_TIMEOUT,
            policy: Policy::default(),
            executor,
            store,
            approvals,
            audit: None,
            abort: CancellationToken::new(),
            persist_retries: 3,
            persist_backoff: Duration::from_millis(200),
        }
    }

    /// Wire the production collaborators from configuration.
    pub async fn from_config<S>(cfg: &ResponderConfig, store: Arc<S>) -> anyhow::Result<Self>
    where
        S: IncidentStore + ApprovalStore + 'static,
    {
        let backend = ChatCompletionsBackend::from_config(&cfg.summarizer)
            .context("failed to build summarizer backend")?;
        let summarizer =
            SummarizerClient::new(Arc::new(backend), cfg.summarizer.max_context_bytes);
        let executor = Arc::new(ProcessExecutor::from_config(&cfg.executor));
        let audit = AuditLog::new(cfg.storage.audit_log_path.clone()).await?;

        Ok(Self::new(summarizer, executor, store.clone(), store)
            .with_detector(Detector::new(&cfg.detector.keywords))
            .with_policy(cfg.policy.clone())
            .with_summarizer_timeout(cfg.summarizer.timeout())
            .with_persistence(
                cfg.storage.persist_retries,
                Duration::from_millis(cfg.storage.persist_backoff_ms),
            )
            .with_audit(Arc::new(audit)))
    }

    pub fn with_detector(mut self, detector: Detector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_summarizer_timeout(mut self, timeout: Duration) -> Self {
        self.summarizer_timeout = timeout;
        self
    }

    pub fn with_persistence(mut self, retries: u32, backoff: Duration) -> Self {
        self.persist_retries = retries;
        self.persist_backoff = backoff;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Token that, once cancelled, escalates every in-flight incident whose
    /// remediation has not started yet.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Run one line through the pipeline. `None` when the line is not an
    /// anomaly. `context` is what the summarizer sees; an empty context
    /// falls back to the line itself.
    pub async fn process_line(&self, line: LogLine, context: &str) -> Option<IncidentReport> {
        let keyword = self.detector.matched(&line.text)?.to_string();
        let incident = Incident::detected(&line);
        info!(incident_id = %incident.id, %keyword, "anomaly detected");

        let context = if context.trim().is_empty() {
            line.text.as_str()
        } else {
            context
        };
        Some(self.handle_incident(incident, context).await)
    }

    async fn handle_incident(&self, mut incident: Incident, context: &str) -> IncidentReport {
        let mut persist = Persister::new(
            self.store.clone(),
            incident.id,
            self.persist_retries,
            self.persist_backoff,
        );
        persist.record(Write::Put(Box::new(incident.clone()))).await;

        match self.drive(&mut incident, &mut persist, context).await {
            Ok(()) => {}
            Err(Halt::Aborted) => self.abort_incident(&mut incident, &mut persist).await,
            Err(Halt::Illegal(e)) => {
                error!(incident_id = %incident.id, error = %e, "illegal pipeline transition");
                self.abort_incident(&mut incident, &mut persist).await;
            }
        }

        persist.finish(&incident).await;

        let report = incident.report();
        info!(
            incident_id = %report.id,
            summary = %report.summary,
            action = ?report.action,
            outcome = %report.outcome,
            "incident resolved"
        );
        report
    }

    async fn drive(
        &self,
        incident: &mut Incident,
        persist: &mut Persister,
        context: &str,
    ) -> Result<(), Halt> {
        incident.advance(PipelineState::Summarizing)?;
        persist
            .record(Write::Update(IncidentUpdate::state(PipelineState::Summarizing)))
            .await;

        let summarization = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Err(Halt::Aborted),
            s = self.summarizer.summarize(context, self.summarizer_timeout) => s,
        };
        let latency_ms = summarization.latency.as_millis() as u64;
        incident.summary_latency_ms = Some(latency_ms);

        let update = match summarization.result {
            SummaryResult::Ok { summary, action } => {
                if let Some(raw) = &action.raw {
                    warn!(
                        incident_id = %incident.id,
                        proposed = %raw,
                        "model proposed an unknown action, normalized to ESCALATE"
                    );
                }
                incident.advance(PipelineState::Summarized)?;
                incident.summary = Some(summary.clone());
                incident.action = Some(action.clone());
                IncidentUpdate {
                    summary: Some(summary),
                    action: Some(action),
                    summary_latency_ms: Some(latency_ms),
                    ..IncidentUpdate::state(PipelineState::Summarized)
                }
            }
            SummaryResult::Malformed { reason } => {
                fall_back(incident, format!("malformed: {reason}"), latency_ms)?
            }
            SummaryResult::Unavailable { reason } => {
                fall_back(incident, format!("unavailable: {reason}"), latency_ms)?
            }
        };
        persist.record(Write::Update(update)).await;

        if self.abort.is_cancelled() {
            return Err(Halt::Aborted);
        }

        let Some(proposal) = incident.action.clone() else {
            return Err(Halt::Aborted);
        };
        let approval = self.find_approval(incident.id, proposal.name).await;
        let decision = gate::route(&proposal, &self.policy, approval.as_ref());
        info!(
            incident_id = %incident.id,
            action = %proposal.name,
            source = %proposal.source,
            decision = %decision.decision,
            reason = %decision.reason,
            "gate decided"
        );
        incident.advance(PipelineState::Gated)?;
        incident.decision = Some(decision.clone());
        persist
            .record(Write::Update(IncidentUpdate {
                decision: Some(decision.clone()),
                ..IncidentUpdate::state(PipelineState::Gated)
            }))
            .await;
        self.audit(
            AuditEntry::new(AuditEventType::GateDecided, incident.id)
                .with_action(proposal.name)
                .with_decision(decision.decision.as_str())
                .with_reason(decision.reason.clone()),
        )
        .await;

        let terminal = match decision.decision {
            Decision::Execute => {
                if self.abort.is_cancelled() {
                    return Err(Halt::Aborted);
                }
                // A started procedure always runs to completion, shutdown included.
                let result = self.execute(incident.id, proposal.name).await;
                let next = if result.succeeded() {
                    PipelineState::Executed
                } else {
                    PipelineState::Failed
                };
                incident.execution = Some(result);
                next
            }
            Decision::DryRunSkip => PipelineState::Skipped,
            Decision::Denied | Decision::Escalated => PipelineState::Escalated,
        };

        incident.advance(terminal)?;
        persist
            .record(Write::Update(IncidentUpdate::terminal(incident)))
            .await;
        Ok(())
    }

    /// Approvals are only consulted when the policy asks for one. A lookup
    /// failure counts as "no approval".
    async fn find_approval(
        &self,
        id: IncidentId,
        action: ActionName,
    ) -> Option<gate::ApprovalToken> {
        if !self.policy.needs_approval(action) {
            return None;
        }
        match self.approvals.lookup(action, Utc::now()).await {
            Ok(token) => token,
            Err(e) => {
                warn!(incident_id = %id, %action, error = %e, "approval lookup failed");
                None
            }
        }
    }

    async fn execute(&self, id: IncidentId, action: ActionName) -> ExecutionResult {
        let start = Instant::now();
        let result = match self.executor.run(action).await {
            Ok(r) => r,
            Err(e) => {
                warn!(incident_id = %id, %action, error = %e, "remediation could not run");
                ExecutionResult {
                    exit_code: NO_EXIT_CODE,
                    stdout_tail: e.to_string(),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
        };

        let event = if result.succeeded() {
            AuditEventType::ActionExecuted
        } else {
            AuditEventType::ActionFailed
        };
        self.audit(
            AuditEntry::new(event, id)
                .with_action(action)
                .with_exit_code(result.exit_code)
                .with_duration_ms(result.duration_ms),
        )
        .await;
        result
    }

    /// Abort edge: escalate whatever state the incident is in.
    async fn abort_incident(&self, incident: &mut Incident, persist: &mut Persister) {
        if incident.is_finished() {
            return;
        }
        if let Err(e) = incident.advance(PipelineState::Escalated) {
            error!(incident_id = %incident.id, error = %e, "could not escalate incident");
            return;
        }
        if incident.decision.is_none() {
            incident.decision = Some(GateDecision::interrupted());
        }
        warn!(incident_id = %incident.id, "incident interrupted by shutdown, escalated");

        persist
            .record(Write::Update(IncidentUpdate {
                decision: incident.decision.clone(),
                ..IncidentUpdate::terminal(incident)
            }))
            .await;
        let decision = incident
            .decision
            .as_ref()
            .map_or(Decision::Escalated, |d| d.decision);
        self.audit(
            AuditEntry::new(AuditEventType::IncidentAborted, incident.id)
                .with_decision(decision.as_str())
                .with_reason(gate::REASON_INTERRUPTED),
        )
        .await;
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Some(log) = &self.audit {
            if let Err(e) = log.log(entry).await {
                warn!(error = %e, "failed to write audit entry");
            }
        }
    }
}

/// Apply the deterministic rules after a failed summarization.
fn fall_back(
    incident: &mut Incident,
    reason: String,
    latency_ms: u64,
) -> Result<IncidentUpdate, TransitionError> {
    warn!(
        incident_id = %incident.id,
        %reason,
        latency_ms,
        "summarizer failed, using fallback rules"
    );
    let (summary, action) = resolve_fallback(&incident.log_line);
    incident.advance(PipelineState::Fallback)?;
    incident.summary = Some(summary.clone());
    incident.action = Some(action.clone());
    incident.fallback_reason = Some(reason.clone());
    Ok(IncidentUpdate {
        summary: Some(summary),
        action: Some(action),
        fallback_reason: Some(reason),
        summary_latency_ms: Some(latency_ms),
        ..IncidentUpdate::state(PipelineState::Fallback)
    })
}

// ---------------------------------------------------------------------------
// Ordered, best-effort persistence
// ---------------------------------------------------------------------------

enum Write {
    Put(Box<Incident>),
    Update(IncidentUpdate),
}

/// Per-incident write queue. Writes are applied strictly in order; a failed
/// write stays at the head and is retried on the next transition.
struct Persister {
    store: Arc<dyn IncidentStore>,
    id: IncidentId,
    queue: VecDeque<Write>,
    retries: u32,
    backoff: Duration,
}

impl Persister {
    fn new(store: Arc<dyn IncidentStore>, id: IncidentId, retries: u32, backoff: Duration) -> Self {
        Self {
            store,
            id,
            queue: VecDeque::new(),
            retries,
            backoff,
        }
    }

    async fn record(&mut self, write: Write) {
        self.queue.push_back(write);
        if let Err(e) = self.flush().await {
            warn!(
                incident_id = %self.id,
                queued = self.queue.len(),
                error = %e,
                "incident write failed, will retry"
            );
        }
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        while let Some(write) = self.queue.front() {
            match write {
                Write::Put(incident) => {
                    self.store.put_incident(incident).await?;
                }
                Write::Update(update) => {
                    self.store.update_incident(self.id, update).await?;
                }
            }
            self.queue.pop_front();
        }
        Ok(())
    }

    /// Final flush for a terminal incident. After the first failed attempt
    /// the backlog is replaced by one full snapshot, which supersedes it.
    async fn finish(&mut self, incident: &Incident) {
        let attempts = self.retries.max(1);
        for attempt in 1..=attempts {
            match self.flush().await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        incident_id = %self.id,
                        attempt,
                        attempts,
                        error = %e,
                        "failed to persist finished incident"
                    );
                    self.queue.clear();
                    self.queue.push_back(Write::Put(Box::new(incident.clone())));
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }

        match serde_json::to_string(incident) {
            Ok(json) => error!(
                incident_id = %self.id,
                incident = %json,
                "incident could not be persisted, record kept in log only"
            ),
            Err(e) => error!(
                incident_id = %self.id,
                error = %e,
                "incident could not be persisted or serialized"
            ),
        }
        debug!(incident_id = %self.id, "dropping unpersisted writes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionName;
    use crate::executor::ExecutorError;
    use crate::incident::Outcome;
    use crate::storage::MemoryStore;
    use crate::summarize::{BackendError, SummaryBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Reply(&'static str);

    #[async_trait::async_trait]
    impl SummaryBackend for Reply {
        async fn complete(&self, _context: &str) -> Result<String, BackendError> {
            Ok(self.0.to_string())
        }
    }

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Executor for CountingExecutor {
        async fn run(&self, _action: ActionName) -> Result<ExecutionResult, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResult {
                exit_code: 0,
                stdout_tail: String::new(),
                duration_ms: 1,
            })
        }
    }

    fn orchestrator(reply: &'static str, exec: Arc<CountingExecutor>) -> (Orchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let summarizer = SummarizerClient::new(Arc::new(Reply(reply)), 1024);
        let orch = Orchestrator::new(summarizer, exec, store.clone(), store.clone());
        (orch, store)
    }

    #[tokio::test]
    async fn test_quiet_line_creates_nothing() {
        let exec = Arc::new(CountingExecutor::default());
        let (orch, store) = orchestrator("{}", exec.clone());
        assert!(orch.process_line(LogLine::new("INFO all good"), "").await.is_none());
        assert!(store.is_empty().await);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_default_policy_is_dry_run() {
        let exec = Arc::new(CountingExecutor::default());
        let (orch, store) = orchestrator(
            r#"{"summary":"cache full","action":"CLEAR_TEMP_CACHE"}"#,
            exec.clone(),
        );
        let report = orch
            .process_line(LogLine::new("ERROR tmp is full"), "")
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::Skipped);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);

        let stored = store.get_incident(report.id).await.unwrap().unwrap();
        assert_eq!(stored.state, PipelineState::Skipped);
        assert_eq!(stored.summary.as_deref(), Some("cache full"));
        assert!(stored.summary_latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_live_policy_executes() {
        let exec = Arc::new(CountingExecutor::default());
        let (orch, _store) = orchestrator(
            r#"{"summary":"cache full","action":"CLEAR_TEMP_CACHE"}"#,
            exec.clone(),
        );
        let orch = orch.with_policy(Policy {
            dry_run: false,
            ..Policy::default()
        });
        let report = orch
            .process_line(LogLine::new("ERROR tmp is full"), "")
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::Executed);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_escalates_before_summary() {
        let exec = Arc::new(CountingExecutor::default());
        let (orch, store) = orchestrator(
            r#"{"summary":"s","action":"RESTART_APACHE"}"#,
            exec.clone(),
        );
        orch.abort_token().cancel();

        let report = orch.process_line(LogLine::new("ERROR x"), "").await.unwrap();
        assert_eq!(report.outcome, Outcome::Escalated);
        let decision = report.decision.unwrap();
        assert_eq!(decision.reason, gate::REASON_INTERRUPTED);

        let stored = store.get_incident(report.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Escalated);
        assert!(stored.finished_at.is_some());
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }
}
