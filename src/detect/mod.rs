//! Keyword anomaly detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Keywords flagged when no configuration overrides them.
pub const DEFAULT_KEYWORDS: [&str; 4] = ["ERROR", "CRITICAL", "Failed", "Timeout"];

/// A raw line read from the log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl LogLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// Case-sensitive substring matcher over an ordered keyword list.
#[derive(Debug, Clone)]
pub struct Detector {
    keywords: Vec<String>,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORDS.iter().map(|k| k.to_string()))
    }
}

impl Detector {
    /// Empty keywords are dropped; they would match every line.
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keywords = keywords
            .into_iter()
            .map(Into::into)
            .filter(|k: &String| !k.is_empty())
            .collect();
        Self { keywords }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn detect(&self, line: &str) -> bool {
        self.matched(line).is_some()
    }

    /// The first configured keyword found in `line`, in configuration order.
    pub fn matched(&self, line: &str) -> Option<&str> {
        self.keywords
            .iter()
            .find(|k| line.contains(k.as_str()))
            .map(String::as_str)
    }
}
