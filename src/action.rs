//! Remediation actions -- the closed set of things the responder may do.
//!
//! Model output never reaches the executor as text. It is normalized into an
//! [`ActionName`] first; anything unrecognized becomes [`ActionName::Escalate`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A known remediation capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionName {
    RestartApache,
    ClearTempCache,
    Escalate,
}

impl ActionName {
    pub const ALL: [ActionName; 3] = [
        ActionName::RestartApache,
        ActionName::ClearTempCache,
        ActionName::Escalate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionName::RestartApache => "RESTART_APACHE",
            ActionName::ClearTempCache => "CLEAR_TEMP_CACHE",
            ActionName::Escalate => "ESCALATE",
        }
    }

    /// Map arbitrary text onto the closed set. Unknown names escalate.
    pub fn normalize(raw: &str) -> ActionName {
        raw.parse().unwrap_or(ActionName::Escalate)
    }

    /// Static metadata for this action.
    pub fn spec(&self) -> ActionSpec {
        match self {
            ActionName::RestartApache => ActionSpec {
                name: *self,
                description: "Restart the Apache web server",
                risk: RiskLevel::High,
                approval_recommended: true,
            },
            ActionName::ClearTempCache => ActionSpec {
                name: *self,
                description: "Clear temporary cache directories",
                risk: RiskLevel::Low,
                approval_recommended: false,
            },
            ActionName::Escalate => ActionSpec {
                name: *self,
                description: "Escalate to a human operator",
                risk: RiskLevel::Medium,
                approval_recommended: false,
            },
        }
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for ActionName {
    type Err = UnknownAction;

    /// Case-insensitive after trimming surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        ActionName::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// Where a proposal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalSource {
    Model,
    Fallback,
}

impl fmt::Display for ProposalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalSource::Model => write!(f, "model"),
            ProposalSource::Fallback => write!(f, "fallback"),
        }
    }
}

impl FromStr for ProposalSource {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(ProposalSource::Model),
            "fallback" => Ok(ProposalSource::Fallback),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

/// A proposed remediation, always holding a member of the closed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub name: ActionName,
    pub source: ProposalSource,
    /// The model's original text when it did not name a known action.
    /// Kept for the audit trail only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl ActionProposal {
    pub fn fallback(name: ActionName) -> Self {
        Self {
            name,
            source: ProposalSource::Fallback,
            raw: None,
        }
    }

    /// Build a proposal from model text, normalizing unknown names to ESCALATE.
    pub fn from_model(raw: &str) -> Self {
        match raw.parse::<ActionName>() {
            Ok(name) => Self {
                name,
                source: ProposalSource::Model,
                raw: None,
            },
            Err(_) => Self {
                name: ActionName::Escalate,
                source: ProposalSource::Model,
                raw: Some(raw.to_string()),
            },
        }
    }

    pub fn was_normalized(&self) -> bool {
        self.raw.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Registry entry describing an action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSpec {
    pub name: ActionName,
    pub description: &'static str,
    pub risk: RiskLevel,
    pub approval_recommended: bool,
}

/// All registered actions, in declaration order.
pub fn registry() -> Vec<ActionSpec> {
    ActionName::ALL.iter().map(|a| a.spec()).collect()
}
