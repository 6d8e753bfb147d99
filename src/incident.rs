//! The incident record and its state machine.

use crate::action::ActionProposal;
use crate::detect::LogLine;
use crate::executor::ExecutionResult;
use crate::gate::GateDecision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub type IncidentId = Uuid;

/// Pipeline position of one incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Detected,
    Summarizing,
    Summarized,
    Fallback,
    Gated,
    Executed,
    Skipped,
    Escalated,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Executed
                | PipelineState::Skipped
                | PipelineState::Escalated
                | PipelineState::Failed
        )
    }

    /// Edges of the state graph. Any non-terminal state may also jump to
    /// `Escalated` when the process is shutting down.
    pub fn can_advance_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (*self, next) {
            (Detected, Summarizing) => true,
            (Summarizing, Summarized) | (Summarizing, Fallback) => true,
            (Summarized, Gated) | (Fallback, Gated) => true,
            (Gated, Executed) | (Gated, Skipped) | (Gated, Escalated) | (Gated, Failed) => true,
            (from, Escalated) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Detected => "detected",
            PipelineState::Summarizing => "summarizing",
            PipelineState::Summarized => "summarized",
            PipelineState::Fallback => "fallback",
            PipelineState::Gated => "gated",
            PipelineState::Executed => "executed",
            PipelineState::Skipped => "skipped",
            PipelineState::Escalated => "escalated",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use PipelineState::*;
        [
            Detected, Summarizing, Summarized, Fallback, Gated, Executed, Skipped, Escalated,
            Failed,
        ]
        .into_iter()
        .find(|st| st.as_str() == s)
        .ok_or_else(|| ParseEnumError(s.to_string()))
    }
}

/// Final disposition of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Executed,
    Skipped,
    Escalated,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Executed => "executed",
            Outcome::Skipped => "skipped",
            Outcome::Escalated => "escalated",
            Outcome::Failed => "failed",
        }
    }
}

impl From<PipelineState> for Outcome {
    fn from(state: PipelineState) -> Self {
        match state {
            PipelineState::Executed => Outcome::Executed,
            PipelineState::Skipped => Outcome::Skipped,
            PipelineState::Escalated => Outcome::Escalated,
            PipelineState::Failed => Outcome::Failed,
            _ => Outcome::Pending,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Outcome::Pending),
            "executed" => Ok(Outcome::Executed),
            "skipped" => Ok(Outcome::Skipped),
            "escalated" => Ok(Outcome::Escalated),
            "failed" => Ok(Outcome::Failed),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized value: {0}")]
pub struct ParseEnumError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to} for incident {id}")]
pub struct TransitionError {
    pub id: IncidentId,
    pub from: PipelineState,
    pub to: PipelineState,
}

/// Durable record of one anomaly's journey through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub log_line: String,
    pub line_received_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub state: PipelineState,
    pub summary: Option<String>,
    pub action: Option<ActionProposal>,
    pub fallback_reason: Option<String>,
    pub summary_latency_ms: Option<u64>,
    pub decision: Option<GateDecision>,
    pub execution: Option<ExecutionResult>,
    pub outcome: Outcome,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn detected(line: &LogLine) -> Self {
        Self {
            id: Uuid::new_v4(),
            log_line: line.text.clone(),
            line_received_at: line.received_at,
            detected_at: Utc::now(),
            state: PipelineState::Detected,
            summary: None,
            action: None,
            fallback_reason: None,
            summary_latency_ms: None,
            decision: None,
            execution: None,
            outcome: Outcome::Pending,
            finished_at: None,
        }
    }

    /// Move along the state graph. The outcome is derived from the state, so
    /// once terminal it can never change again.
    pub fn advance(&mut self, next: PipelineState) -> Result<(), TransitionError> {
        if !self.state.can_advance_to(next) {
            return Err(TransitionError {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.outcome = Outcome::from(next);
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Seconds between receiving the line and detecting it.
    pub fn time_to_detect_secs(&self) -> f64 {
        (self.detected_at - self.line_received_at).num_milliseconds() as f64 / 1000.0
    }

    /// Seconds between detection and the terminal transition.
    pub fn time_to_resolve_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|f| (f - self.detected_at).num_milliseconds() as f64 / 1000.0)
    }

    pub fn report(&self) -> IncidentReport {
        IncidentReport {
            id: self.id,
            log_line: self.log_line.clone(),
            summary: self.summary.clone().unwrap_or_default(),
            action: self.action.as_ref().map(|a| a.name),
            action_source: self.action.as_ref().map(|a| a.source),
            decision: self.decision.clone(),
            outcome: self.outcome,
            exit_code: self.execution.as_ref().map(|e| e.exit_code),
            summary_latency_ms: self.summary_latency_ms,
        }
    }
}

/// Partial update written at each transition. `None` leaves a column as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IncidentUpdate {
    pub state: Option<PipelineState>,
    pub summary: Option<String>,
    pub action: Option<ActionProposal>,
    pub fallback_reason: Option<String>,
    pub summary_latency_ms: Option<u64>,
    pub decision: Option<GateDecision>,
    pub execution: Option<ExecutionResult>,
    pub outcome: Option<Outcome>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IncidentUpdate {
    pub fn state(state: PipelineState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    /// Fields a terminal transition sets.
    pub fn terminal(incident: &Incident) -> Self {
        Self {
            state: Some(incident.state),
            outcome: Some(incident.outcome),
            execution: incident.execution.clone(),
            finished_at: incident.finished_at,
            ..Default::default()
        }
    }

    /// Every mutable field of `incident`.
    pub fn snapshot(incident: &Incident) -> Self {
        Self {
            state: Some(incident.state),
            summary: incident.summary.clone(),
            action: incident.action.clone(),
            fallback_reason: incident.fallback_reason.clone(),
            summary_latency_ms: incident.summary_latency_ms,
            decision: incident.decision.clone(),
            execution: incident.execution.clone(),
            outcome: Some(incident.outcome),
            finished_at: incident.finished_at,
        }
    }

    /// Apply onto an in-memory record.
    pub fn apply_to(&self, incident: &mut Incident) {
        if let Some(s) = self.state {
            incident.state = s;
        }
        if let Some(s) = &self.summary {
            incident.summary = Some(s.clone());
        }
        if let Some(a) = &self.action {
            incident.action = Some(a.clone());
        }
        if let Some(r) = &self.fallback_reason {
            incident.fallback_reason = Some(r.clone());
        }
        if let Some(l) = self.summary_latency_ms {
            incident.summary_latency_ms = Some(l);
        }
        if let Some(d) = &self.decision {
            incident.decision = Some(d.clone());
        }
        if let Some(e) = &self.execution {
            incident.execution = Some(e.clone());
        }
        if let Some(o) = self.outcome {
            incident.outcome = o;
        }
        if let Some(f) = self.finished_at {
            incident.finished_at = Some(f);
        }
    }
}

/// What gets reported for every terminal incident.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentReport {
    pub id: IncidentId,
    pub log_line: String,
    pub summary: String,
    pub action: Option<crate::action::ActionName>,
    pub action_source: Option<crate::action::ProposalSource>,
    pub decision: Option<GateDecision>,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub summary_latency_ms: Option<u64>,
}
