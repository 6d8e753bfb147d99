//! Action router -- decides whether a proposed remediation may run.
//!
//! Checks run in a fixed order: allow-list, then approval, then dry-run.
//! Dry-run is a hard ceiling: with it on, nothing is ever executed, whatever
//! the approval state.

pub mod approvals;

use crate::action::{registry, ActionName, ActionProposal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub use approvals::{ApprovalStore, ApprovalToken};

/// Safety policy consulted for every proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Record decisions but never execute.
    pub dry_run: bool,
    /// Actions that may run at all.
    pub allowed_actions: BTreeSet<ActionName>,
    /// Require an operator approval for every action.
    pub require_approval: bool,
    /// Actions that need approval even when `require_approval` is off.
    /// Defaults to the actions the registry marks as approval-recommended.
    pub approval_actions: BTreeSet<ActionName>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            dry_run: true,
            allowed_actions: ActionName::ALL.into_iter().collect(),
            require_approval: false,
            approval_actions: registry()
                .into_iter()
                .filter(|spec| spec.approval_recommended)
                .map(|spec| spec.name)
                .collect(),
        }
    }
}

impl Policy {
    pub fn needs_approval(&self, action: ActionName) -> bool {
        self.require_approval || self.approval_actions.contains(&action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Execute,
    DryRunSkip,
    Denied,
    Escalated,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Execute => "EXECUTE",
            Decision::DryRunSkip => "DRY_RUN_SKIP",
            Decision::Denied => "DENIED",
            Decision::Escalated => "ESCALATED",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Decision {
    type Err = crate::incident::ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXECUTE" => Ok(Decision::Execute),
            "DRY_RUN_SKIP" => Ok(Decision::DryRunSkip),
            "DENIED" => Ok(Decision::Denied),
            "ESCALATED" => Ok(Decision::Escalated),
            other => Err(crate::incident::ParseEnumError(other.to_string())),
        }
    }
}

pub const REASON_NOT_ALLOWED: &str = "not allow-listed";
pub const REASON_AWAITING_APPROVAL: &str = "awaiting approval";
pub const REASON_DRY_RUN: &str = "dry-run mode";
pub const REASON_INTERRUPTED: &str = "interrupted by shutdown";

/// Outcome of routing one proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub decision: Decision,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

impl GateDecision {
    fn new(decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: reason.into(),
            decided_at: Utc::now(),
        }
    }

    /// Recorded when shutdown cuts an incident off before it was gated.
    pub fn interrupted() -> Self {
        Self::new(Decision::Escalated, REASON_INTERRUPTED)
    }

    pub fn permits_execution(&self) -> bool {
        self.decision == Decision::Execute
    }
}

/// Route a proposal through the policy. Total: always returns a decision.
///
/// `approval` is the operator grant found for this action, if any. A token
/// issued for a different action does not count.
pub fn route(
    proposal: &ActionProposal,
    policy: &Policy,
    approval: Option<&ApprovalToken>,
) -> GateDecision {
    let action = proposal.name;

    if !policy.allowed_actions.contains(&action) {
        return GateDecision::new(Decision::Denied, REASON_NOT_ALLOWED);
    }

    if policy.needs_approval(action) && !approval.is_some_and(|t| t.action == action) {
        return GateDecision::new(Decision::Escalated, REASON_AWAITING_APPROVAL);
    }

    if policy.dry_run {
        return GateDecision::new(Decision::DryRunSkip, REASON_DRY_RUN);
    }

    match approval.filter(|t| t.action == action) {
        Some(token) => GateDecision::new(
            Decision::Execute,
            format!("approved by {}", token.approved_by),
        ),
        None => GateDecision::new(Decision::Execute, "allowed by policy"),
    }
}
