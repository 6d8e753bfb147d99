//! Remediation executor -- runs the external procedure for an action.
//!
//! Each [`ActionName`] maps to exactly one argv from trusted configuration.
//! Nothing from model output is ever passed to a process, and no shell is
//! involved.

use crate::action::ActionName;
use crate::config::ExecutorConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit code recorded when the process could not report one.
pub const NO_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no procedure configured for {0}")]
    NoProcedure(ActionName),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, action: ActionName) -> Result<ExecutionResult, ExecutorError>;
}

/// Runs configured commands as child processes.
pub struct ProcessExecutor {
    procedures: BTreeMap<ActionName, Vec<String>>,
    slow_threshold: Duration,
    tail_bytes: usize,
}

impl ProcessExecutor {
    /// Build the closed action table. Actions without an explicit command run
    /// `<script> <ACTION_NAME>`.
    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        let procedures = ActionName::ALL
            .into_iter()
            .map(|action| {
                let argv = cfg
                    .commands
                    .get(&action)
                    .filter(|argv| !argv.is_empty())
                    .cloned()
                    .unwrap_or_else(|| vec![cfg.script.clone(), action.as_str().to_string()]);
                (action, argv)
            })
            .collect();
        Self {
            procedures,
            slow_threshold: Duration::from_secs(cfg.slow_threshold_secs),
            tail_bytes: cfg.tail_bytes,
        }
    }

    pub fn procedure(&self, action: ActionName) -> Option<&[String]> {
        self.procedures.get(&action).map(Vec::as_slice)
    }

    /// Run by name. Unknown names run the escalation procedure.
    pub async fn execute_named(&self, name: &str) -> Result<ExecutionResult, ExecutorError> {
        self.run(ActionName::normalize(name)).await
    }
}

#[async_trait::async_trait]
impl Executor for ProcessExecutor {
    async fn run(&self, action: ActionName) -> Result<ExecutionResult, ExecutorError> {
        let argv = self
            .procedures
            .get(&action)
            .ok_or(ExecutorError::NoProcedure(action))?;
        let (program, args) = argv.split_first().ok_or(ExecutorError::NoProcedure(action))?;

        info!(%action, %program, "running remediation procedure");
        let start = Instant::now();

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let keep = self.tail_bytes;
        let wait = async {
            let (status, out, err) = tokio::join!(
                child.wait(),
                read_tail(stdout, keep),
                read_tail(stderr, keep)
            );
            Ok::<_, std::io::Error>((status?, out?, err?))
        };
        tokio::pin!(wait);

        // No timeout on remediation, only a warning once it runs long.
        let (status, stdout, stderr) = tokio::select! {
            out = &mut wait => out,
            _ = tokio::time::sleep(self.slow_threshold) => {
                warn!(
                    %action,
                    threshold_secs = self.slow_threshold.as_secs(),
                    "remediation procedure is running longer than expected"
                );
                wait.await
            }
        }
        .map_err(|source| ExecutorError::Wait {
            program: program.clone(),
            source,
        })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = status.code().unwrap_or(NO_EXIT_CODE);
        let stdout_tail = tail(&String::from_utf8_lossy(&stdout), self.tail_bytes).to_string();

        if exit_code == 0 {
            debug!(%action, duration_ms, "remediation procedure succeeded");
        } else {
            let stderr = String::from_utf8_lossy(&stderr);
            warn!(
                %action,
                exit_code,
                stderr = %tail(&stderr, self.tail_bytes),
                "remediation procedure failed"
            );
        }

        Ok(ExecutionResult {
            exit_code,
            stdout_tail,
            duration_ms,
        })
    }
}

/// Drain `reader` to EOF, keeping only its last bytes. Memory stays
/// bounded however much the procedure prints.
async fn read_tail<R>(reader: Option<R>, max_bytes: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let Some(mut reader) = reader else {
        return Ok(kept);
    };
    // Slack for a multi-byte char split at the cut.
    let keep = max_bytes + 3;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        kept.extend_from_slice(&chunk[..n]);
        if kept.len() > 2 * keep {
            kept.drain(..kept.len() - keep);
        }
    }
    if kept.len() > keep {
        kept.drain(..kept.len() - keep);
    }
    Ok(kept)
}

/// Last `max_bytes` of `s`, cut on a char boundary.
pub fn tail(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
