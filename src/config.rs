//! TOML configuration for the responder.
//!
//! Every section has defaults, so an empty file (or no file at all) gives a
//! working dry-run setup. The configuration is loaded once at the edge and
//! handed to the pipeline as plain values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::ActionName;
use crate::detect::DEFAULT_KEYWORDS;
use crate::gate::Policy;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "LOGRESPONDER_CONFIG";

/// Looked up in the working directory when nothing else is given.
pub const LOCAL_CONFIG: &str = "logresponder.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponderConfig {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl ResponderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded responder configuration");
        Ok(config)
    }

    /// Resolve configuration in order:
    /// 1. `explicit` (the `--config` flag); a failure here is an error.
    /// 2. The file named by `LOGRESPONDER_CONFIG`.
    /// 3. `./logresponder.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LOGRESPONDER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            return Self::load(local);
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Case-sensitive substrings that mark a line as anomalous.
    pub keywords: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Chat-completions endpoint.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Hard timeout for one summarization attempt.
    pub timeout_secs: u64,
    /// Upper bound on context sent to the model.
    pub max_context_bytes: usize,
    /// Recent lines kept as context by the watcher.
    pub context_lines: usize,
}

impl SummarizerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            model: "openai/gpt-3.5-turbo".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            timeout_secs: 8,
            max_context_bytes: crate::summarize::DEFAULT_MAX_CONTEXT_BYTES,
            context_lines: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Script invoked as `<script> <ACTION_NAME>` for actions without an
    /// explicit command.
    pub script: String,
    /// Per-action argv overrides.
    pub commands: BTreeMap<ActionName, Vec<String>>,
    /// Warn when a procedure runs longer than this.
    pub slow_threshold_secs: u64,
    /// Bytes of stdout kept on the incident.
    pub tail_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            script: "./actions.sh".to_string(),
            commands: BTreeMap::new(),
            slow_threshold_secs: 30,
            tail_bytes: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub audit_log_path: PathBuf,
    /// Attempts to flush queued writes once an incident is terminal.
    pub persist_retries: u32,
    /// Linear backoff step between those attempts.
    pub persist_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/incidents.db"),
            audit_log_path: PathBuf::from("data/audit.jsonl"),
            persist_retries: 3,
            persist_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub max_concurrent_incidents: usize,
    /// How often a followed file is polled at EOF.
    pub poll_interval_ms: u64,
    /// How long in-flight incidents get to finish on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_incidents: 4,
            poll_interval_ms: 250,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8088".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
