//! Deterministic fallback when the model cannot be used.

use crate::action::{ActionName, ActionProposal};

pub const PORT_CONFLICT_SUMMARY: &str =
    "Apache failed to start because of a port conflict on port 80.";
pub const TIMEOUT_SUMMARY: &str =
    "A service timed out waiting on a dependency; escalating to an operator.";
pub const UNAVAILABLE_SUMMARY: &str =
    "Automated summary unavailable; escalating to an operator for review.";

/// Ordered rules, first match wins. Total: every input gets a result.
pub fn resolve_fallback(line: &str) -> (String, ActionProposal) {
    let (summary, action) = if line.contains("Port 80") {
        (PORT_CONFLICT_SUMMARY, ActionName::RestartApache)
    } else if line.to_ascii_lowercase().contains("timeout") {
        (TIMEOUT_SUMMARY, ActionName::Escalate)
    } else {
        (UNAVAILABLE_SUMMARY, ActionName::Escalate)
    };
    (summary.to_string(), ActionProposal::fallback(action))
}
