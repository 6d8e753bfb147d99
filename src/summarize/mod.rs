//! Summarizer client -- one bounded attempt at an LLM summary per incident.
//!
//! The model sits behind [`SummaryBackend`]. The client truncates the context,
//! enforces the timeout, measures latency and parses the reply strictly.
//! Anything that is not exactly the expected object is `Malformed`.

pub mod fallback;
pub mod openrouter;

use crate::action::ActionProposal;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub use fallback::resolve_fallback;

/// Errors raised by a backend before any content could be parsed.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no API key in environment variable {var}")]
    MissingCredentials { var: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {code}: {detail}")]
    Status { code: u16, detail: String },

    /// The service answered but its envelope did not carry model content.
    #[error("unexpected response envelope: {0}")]
    Envelope(String),
}

/// The external language model, reduced to one call.
#[async_trait::async_trait]
pub trait SummaryBackend: Send + Sync {
    /// Send the log context and return the model's raw reply text.
    async fn complete(&self, context: &str) -> Result<String, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryResult {
    Ok {
        summary: String,
        action: ActionProposal,
    },
    Malformed {
        reason: String,
    },
    Unavailable {
        reason: String,
    },
}

impl SummaryResult {
    pub fn kind(&self) -> &'static str {
        match self {
            SummaryResult::Ok { .. } => "ok",
            SummaryResult::Malformed { .. } => "malformed",
            SummaryResult::Unavailable { .. } => "unavailable",
        }
    }
}

/// Result of one attempt plus how long it took, whatever the outcome.
#[derive(Debug, Clone)]
pub struct Summarization {
    pub result: SummaryResult,
    pub latency: Duration,
}

pub const DEFAULT_MAX_CONTEXT_BYTES: usize = 16 * 1024;

#[derive(Clone)]
pub struct SummarizerClient {
    backend: Arc<dyn SummaryBackend>,
    max_context_bytes: usize,
}

impl SummarizerClient {
    pub fn new(backend: Arc<dyn SummaryBackend>, max_context_bytes: usize) -> Self {
        Self {
            backend,
            max_context_bytes,
        }
    }

    /// Single attempt, no retries.
    pub async fn summarize(&self, context: &str, timeout: Duration) -> Summarization {
        let start = Instant::now();
        let context = truncate_context(context, self.max_context_bytes);

        let result = match tokio::time::timeout(timeout, self.backend.complete(context)).await {
            Err(_) => SummaryResult::Unavailable {
                reason: format!("timed out after {}ms", timeout.as_millis()),
            },
            Ok(Err(BackendError::Envelope(msg))) => SummaryResult::Malformed {
                reason: format!("unexpected response envelope: {msg}"),
            },
            Ok(Err(e)) => SummaryResult::Unavailable {
                reason: e.to_string(),
            },
            Ok(Ok(content)) => parse_model_content(&content),
        };

        let latency = start.elapsed();
        debug!(
            kind = result.kind(),
            latency_ms = latency.as_millis() as u64,
            context_bytes = context.len(),
            "summarizer attempt finished"
        );
        Summarization { result, latency }
    }
}

/// Keep at most `max_bytes` of the most recent context.
///
/// The cut lands on a char boundary and, when the kept tail contains a
/// newline, just after the first one so no partial line is sent.
pub fn truncate_context(context: &str, max_bytes: usize) -> &str {
    if context.len() <= max_bytes {
        return context;
    }
    let mut start = context.len() - max_bytes;
    while !context.is_char_boundary(start) {
        start += 1;
    }
    let tail = &context[start..];
    match tail.find('\n') {
        Some(pos) if pos + 1 < tail.len() => &tail[pos + 1..],
        _ => tail,
    }
}

/// Strictly parse model output into a summary and a proposal.
///
/// The reply must be a JSON object with a non-empty string `summary` and a
/// string `action`. Unknown action names become ESCALATE. Extra keys are
/// ignored.
pub fn parse_model_content(content: &str) -> SummaryResult {
    let malformed = |reason: &str| SummaryResult::Malformed {
        reason: reason.to_string(),
    };

    let value: Value = match serde_json::from_str(content.trim()) {
        Ok(v) => v,
        Err(e) => {
            return SummaryResult::Malformed {
                reason: format!("not valid JSON: {e}"),
            }
        }
    };
    let Some(obj) = value.as_object() else {
        return malformed("reply is not a JSON object");
    };

    let summary = match obj.get("summary") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::String(_)) => return malformed("empty summary"),
        Some(_) => return malformed("summary is not a string"),
        None => return malformed("missing summary"),
    };

    let action = match obj.get("action") {
        Some(Value::String(a)) => ActionProposal::from_model(a),
        Some(_) => return malformed("action is not a string"),
        None => return malformed("missing action"),
    };

    SummaryResult::Ok { summary, action }
}
