//! Log watcher -- feeds lines from a source into the orchestrator.
//!
//! One task reads the source into a channel. The watcher keeps a rolling
//! window of recent lines as summarizer context and spawns one task per
//! anomaly, bounded by a semaphore. On shutdown it stops reading, gives
//! in-flight incidents a grace period, then aborts the rest. Remediation
//! procedures that already started are left to finish.

use super::Orchestrator;
use crate::config::ResponderConfig;
use crate::detect::LogLine;
use crate::incident::IncidentReport;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum LogSource {
    /// A file on disk. With `follow` it is tailed like `tail -F`.
    File {
        path: PathBuf,
        from_start: bool,
        follow: bool,
    },
    Stdin,
    /// `journalctl -f`, optionally restricted to one unit.
    Journald { unit: Option<String> },
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub max_concurrent_incidents: usize,
    pub context_lines: usize,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl WatchOptions {
    pub fn from_config(cfg: &ResponderConfig) -> Self {
        Self {
            max_concurrent_incidents: cfg.watch.max_concurrent_incidents.max(1),
            context_lines: cfg.summarizer.context_lines,
            poll_interval: Duration::from_millis(cfg.watch.poll_interval_ms),
            shutdown_grace: Duration::from_secs(cfg.watch.shutdown_grace_secs),
        }
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from_config(&ResponderConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub lines_read: u64,
    pub incidents: u64,
    /// Incidents that were still running when the grace period ran out.
    pub aborted: u64,
}

/// The last `capacity` lines seen, oldest first.
#[derive(Debug)]
pub struct ContextWindow {
    lines: VecDeque<String>,
    capacity: usize,
}

impl ContextWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Watch `source` until it ends or `shutdown` is cancelled.
pub async fn watch(
    orchestrator: Arc<Orchestrator>,
    source: LogSource,
    opts: WatchOptions,
    shutdown: CancellationToken,
) -> Result<WatchStats> {
    let (tx, mut rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let reader_stop = shutdown.child_token();
    let reader = tokio::spawn(read_source(
        source,
        tx,
        opts.poll_interval,
        reader_stop.clone(),
    ));

    let permits = Arc::new(Semaphore::new(opts.max_concurrent_incidents.max(1)));
    let mut tasks: JoinSet<Option<IncidentReport>> = JoinSet::new();
    let mut window = ContextWindow::new(opts.context_lines);
    let mut stats = WatchStats::default();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested, no longer reading log source");
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_join(joined);
            }
            line = rx.recv() => {
                let Some(text) = line else {
                    debug!("log source ended");
                    break;
                };
                if text.trim().is_empty() {
                    continue;
                }
                stats.lines_read += 1;
                window.push(&text);
                if !orchestrator.detector().detect(&text) {
                    continue;
                }

                // A detected line always becomes an incident. At shutdown it
                // runs without a permit and is escalated with the rest.
                let permit = tokio::select! {
                    p = permits.clone().acquire_owned() => Some(p.context("incident semaphore closed")?),
                    _ = shutdown.cancelled() => None,
                };
                let stopping = permit.is_none();
                stats.incidents += 1;
                let context = window.render();
                let orch = orchestrator.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    orch.process_line(LogLine::new(text), &context).await
                });
                if stopping {
                    info!("shutdown requested while waiting for an incident slot");
                    break;
                }
            }
        }
    }

    reader_stop.cancel();
    drop(rx);
    match reader.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "log source failed"),
        Err(e) => warn!(error = %e, "log source task panicked"),
    }

    stats.aborted = drain(&mut tasks, &orchestrator, &shutdown, opts.shutdown_grace).await;
    info!(
        lines = stats.lines_read,
        incidents = stats.incidents,
        aborted = stats.aborted,
        "watcher stopped"
    );
    Ok(stats)
}

/// Wait for in-flight incidents. Once shutdown is requested they get
/// `grace`, after which the orchestrator's abort token escalates the rest.
/// Returns how many were still running at that point.
async fn drain(
    tasks: &mut JoinSet<Option<IncidentReport>>,
    orchestrator: &Orchestrator,
    shutdown: &CancellationToken,
    grace: Duration,
) -> u64 {
    if tasks.is_empty() {
        return 0;
    }

    tokio::select! {
        _ = join_all(tasks) => return 0,
        _ = shutdown.cancelled() => {}
    }

    info!(
        in_flight = tasks.len(),
        grace_secs = grace.as_secs(),
        "waiting for in-flight incidents"
    );
    if tokio::time::timeout(grace, join_all(tasks)).await.is_ok() {
        return 0;
    }

    let remaining = tasks.len() as u64;
    warn!(remaining, "grace period elapsed, escalating in-flight incidents");
    orchestrator.abort_token().cancel();
    join_all(tasks).await;
    remaining
}

async fn join_all(tasks: &mut JoinSet<Option<IncidentReport>>) {
    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<Option<IncidentReport>, tokio::task::JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "incident task failed");
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

async fn read_source(
    source: LogSource,
    tx: mpsc::Sender<String>,
    poll_interval: Duration,
    stop: CancellationToken,
) -> Result<()> {
    match source {
        LogSource::File {
            path,
            from_start,
            follow,
        } => read_file(&path, from_start, follow, tx, poll_interval, stop).await,
        LogSource::Stdin => {
            let reader = BufReader::new(tokio::io::stdin());
            forward_lines(reader, tx, stop).await
        }
        LogSource::Journald { unit } => {
            let mut cmd = tokio::process::Command::new("journalctl");
            cmd.args(["-f", "--no-pager", "-o", "short"]);
            if let Some(unit) = &unit {
                cmd.arg("-u").arg(unit);
            }
            let mut child = cmd
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .context("failed to start journalctl")?;
            let stdout = child
                .stdout
                .take()
                .context("journalctl stdout was not captured")?;
            info!(?unit, "following journald");
            forward_lines(BufReader::new(stdout), tx, stop).await
        }
    }
}

/// Forward every line until EOF, stop, or the receiver goes away.
async fn forward_lines<R>(mut reader: R, tx: mpsc::Sender<String>, stop: CancellationToken) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = tokio::select! {
            n = reader.read_until(b'\n', &mut buf) => n.context("failed to read log line")?,
            _ = stop.cancelled() => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }
        if tx.send(decode_line(&buf)).await.is_err() {
            return Ok(());
        }
    }
}

/// Tail a file. Creates it if missing and starts over when it shrinks.
async fn read_file(
    path: &Path,
    from_start: bool,
    follow: bool,
    tx: mpsc::Sender<String>,
    poll_interval: Duration,
    stop: CancellationToken,
) -> Result<()> {
    if follow && !path.exists() {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to create log file: {}", path.display()))?;
        info!(path = %path.display(), "created missing log file");
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open log file: {}", path.display()))?;
    let mut pos = if from_start {
        0
    } else {
        file.seek(SeekFrom::End(0)).await?
    };
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    info!(path = %path.display(), from_start, follow, "reading log file");

    loop {
        let n = tokio::select! {
            n = reader.read_until(b'\n', &mut buf) => n
                .with_context(|| format!("failed to read log file: {}", path.display()))?,
            _ = stop.cancelled() => return Ok(()),
        };
        pos += n as u64;

        if buf.ends_with(b"\n") {
            let line = decode_line(&buf);
            buf.clear();
            if tx.send(line).await.is_err() {
                return Ok(());
            }
            continue;
        }

        // EOF, possibly with a partial line buffered.
        if !follow {
            if !buf.is_empty() {
                let _ = tx.send(decode_line(&buf)).await;
            }
            return Ok(());
        }

        let len = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(pos);
        if len < pos {
            info!(path = %path.display(), "log file truncated, reading from the start");
            let file = tokio::fs::File::open(path).await?;
            reader = BufReader::new(file);
            buf.clear();
            pos = 0;
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = stop.cancelled() => return Ok(()),
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_most_recent() {
        let mut w = ContextWindow::new(2);
        w.push("a");
        w.push("b");
        w.push("c");
        assert_eq!(w.len(), 2);
        assert_eq!(w.render(), "b\nc\n");
    }

    #[test]
    fn test_window_zero_capacity_keeps_one() {
        let mut w = ContextWindow::new(0);
        assert!(w.is_empty());
        w.push("only");
        w.push("latest");
        assert_eq!(w.render(), "latest\n");
    }

    #[test]
    fn test_decode_line_strips_endings() {
        assert_eq!(decode_line(b"ERROR x\r\n"), "ERROR x");
        assert_eq!(decode_line(b"\xffERROR"), "\u{FFFD}ERROR");
    }

    #[tokio::test]
    async fn test_read_file_without_follow_sends_all_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\nthree").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        read_file(&path, true, false, tx, Duration::from_millis(10), CancellationToken::new())
            .await
            .unwrap();

        let mut got = Vec::new();
        while let Some(l) = rx.recv().await {
            got.push(l);
        }
        assert_eq!(got, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_follow_picks_up_appended_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("follow.log");
        std::fs::write(&path, "old line\n").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        let task = tokio::spawn({
            let path = path.clone();
            let stop = stop.clone();
            async move { read_file(&path, false, true, tx, Duration::from_millis(10), stop).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "ERROR new line").unwrap();
        }

        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "ERROR new line");

        stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_follow_creates_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs/missing.log");
        let (tx, _rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        stop.cancel();
        read_file(&path, false, true, tx, Duration::from_millis(10), stop)
            .await
            .unwrap();
        assert!(path.exists());
    }
}
