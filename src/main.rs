use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use logresponder::action::{registry, ActionName};
use logresponder::api::state::AppState;
use logresponder::config::{LoggingConfig, ResponderConfig};
use logresponder::detect::LogLine;
use logresponder::gate::{ApprovalStore, ApprovalToken};
use logresponder::incident::IncidentReport;
use logresponder::metrics::{MetricsSummary, METRICS_WINDOW};
use logresponder::pipeline::{watch, LogSource, Orchestrator, WatchOptions};
use logresponder::storage::{IncidentStore, SqliteStore};

#[derive(Parser)]
#[command(
    name = "logresponder",
    about = "Watch logs, summarize anomalies and gate remediation",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a log source and respond to anomalies
    Watch {
        /// Log file to follow
        #[arg(long, conflicts_with_all = ["stdin", "journald"])]
        file: Option<PathBuf>,

        /// Read the existing file contents before following
        #[arg(long, requires = "file")]
        from_start: bool,

        /// Read lines from standard input
        #[arg(long, conflicts_with = "journald")]
        stdin: bool,

        /// Follow the systemd journal
        #[arg(long)]
        journald: bool,

        /// Restrict the journal to one unit
        #[arg(long, requires = "journald")]
        unit: Option<String>,

        /// Also serve the HTTP API on this address
        #[arg(long)]
        api_bind: Option<String>,
    },

    /// Run a single line through the pipeline
    Process {
        /// The log line
        #[arg(long)]
        line: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Process every line of a file once, without following it
    Scan {
        #[arg(long)]
        file: PathBuf,
    },

    /// Inspect recorded incidents
    Incidents {
        #[command(subcommand)]
        action: IncidentsAction,
    },

    /// Record an operator approval for an action
    Approve {
        /// Action name, e.g. RESTART_APACHE
        #[arg(long)]
        action: String,

        /// Who approves
        #[arg(long)]
        by: String,

        /// Approval lifetime in seconds (default: no expiry)
        #[arg(long)]
        ttl_secs: Option<i64>,
    },

    /// Show aggregate incident metrics
    Metrics {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List the known remediation actions
    Actions,

    /// Serve the HTTP API only
    Serve {
        /// Bind address (default from config)
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Subcommand)]
enum IncidentsAction {
    /// List recent incidents
    List {
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show one incident in full
    Show {
        /// Incident id
        id: String,
    },
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(cfg: &ResponderConfig) -> Result<Arc<SqliteStore>> {
    let path = cfg.storage.db_path.to_string_lossy();
    tracing::debug!(db_path = %path, "opening incident store");
    Ok(Arc::new(SqliteStore::open(&path)?))
}

/// Cancel `token` on Ctrl-C / SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        logresponder::shutdown_signal().await;
        token.cancel();
    });
}

fn print_report(report: &IncidentReport) {
    println!("Incident:  {}", report.id);
    println!("Line:      {}", report.log_line);
    println!("Summary:   {}", report.summary);
    match (report.action, report.action_source) {
        (Some(action), Some(source)) => println!("Action:    {action} ({source})"),
        _ => println!("Action:    -"),
    }
    match &report.decision {
        Some(d) => println!("Decision:  {} ({})", d.decision, d.reason),
        None => println!("Decision:  -"),
    }
    println!("Outcome:   {}", report.outcome);
    if let Some(code) = report.exit_code {
        println!("Exit code: {code}");
    }
    if let Some(ms) = report.summary_latency_ms {
        println!("Latency:   {ms} ms");
    }
}

async fn run_watch(
    cfg: &ResponderConfig,
    source: LogSource,
    api_bind: Option<String>,
) -> Result<()> {
    let store = open_store(cfg)?;
    let orchestrator = Arc::new(Orchestrator::from_config(cfg, store.clone()).await?);

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let api = api_bind.map(|bind| {
        let state = AppState::shared(store.clone());
        let token = shutdown.clone();
        tokio::spawn(async move { logresponder::serve(&bind, state, token).await })
    });

    let stats = watch(orchestrator, source, WatchOptions::from_config(cfg), shutdown.clone()).await?;

    shutdown.cancel();
    if let Some(handle) = api {
        handle.await.context("API task panicked")??;
    }

    println!(
        "Read {} lines, {} incidents ({} aborted at shutdown).",
        stats.lines_read, stats.incidents, stats.aborted
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = ResponderConfig::resolve(cli.config.as_deref())?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Watch {
            file,
            from_start,
            stdin,
            journald,
            unit,
            api_bind,
        } => {
            let source = match (file, stdin, journald) {
                (Some(path), _, _) => LogSource::File {
                    path,
                    from_start,
                    follow: true,
                },
                (None, true, _) => LogSource::Stdin,
                (None, false, true) => LogSource::Journald { unit },
                (None, false, false) => {
                    anyhow::bail!("choose a log source: --file <PATH>, --stdin or --journald")
                }
            };
            tracing::info!(?source, dry_run = cfg.policy.dry_run, "starting watcher");
            run_watch(&cfg, source, api_bind).await?;
        }
        Commands::Process { line, json } => {
            let store = open_store(&cfg)?;
            let orchestrator = Orchestrator::from_config(&cfg, store).await?;
            match orchestrator.process_line(LogLine::new(line), "").await {
                None => println!("No anomaly detected."),
                Some(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
                Some(report) => print_report(&report),
            }
        }
        Commands::Scan { file } => {
            let source = LogSource::File {
                path: file,
                from_start: true,
                follow: false,
            };
            run_watch(&cfg, source, None).await?;
        }
        Commands::Incidents { action } => {
            let store = open_store(&cfg)?;
            match action {
                IncidentsAction::List { limit, json } => {
                    let incidents = store.list_recent(limit).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&incidents)?);
                    } else if incidents.is_empty() {
                        println!("No incidents recorded.");
                    } else {
                        println!(
                            "{:<36} | {:<20} | {:<10} | {:<16} | Summary",
                            "Id", "Detected", "Outcome", "Action"
                        );
                        println!("{:-<36}-|-{:-<20}-|-{:-<10}-|-{:-<16}-|-{:-<30}", "", "", "", "", "");
                        for i in incidents {
                            let action = i
                                .action
                                .as_ref()
                                .map(|a| a.name.as_str())
                                .unwrap_or("-");
                            let summary: String =
                                i.summary.as_deref().unwrap_or("").chars().take(60).collect();
                            println!(
                                "{:<36} | {:<20} | {:<10} | {:<16} | {}",
                                i.id,
                                i.detected_at.format("%Y-%m-%d %H:%M:%S"),
                                i.outcome,
                                action,
                                summary
                            );
                        }
                    }
                }
                IncidentsAction::Show { id } => {
                    let id = id.parse().with_context(|| format!("invalid incident id: {id}"))?;
                    match store.get_incident(id).await? {
                        Some(incident) => println!("{}", serde_json::to_string_pretty(&incident)?),
                        None => anyhow::bail!("incident {id} not found"),
                    }
                }
            }
        }
        Commands::Approve {
            action,
            by,
            ttl_secs,
        } => {
            let action: ActionName = action.parse()?;
            if let Some(secs) = ttl_secs.filter(|s| *s <= 0) {
                anyhow::bail!("--ttl-secs must be positive, got {secs}");
            }
            let store = open_store(&cfg)?;
            let token = ApprovalToken::new(action, by, ttl_secs.map(chrono::Duration::seconds));
            store.grant(token.clone()).await?;
            match token.expires_at {
                Some(exp) => println!(
                    "Approved {} by {} until {}.",
                    token.action,
                    token.approved_by,
                    exp.to_rfc3339()
                ),
                None => println!("Approved {} by {}.", token.action, token.approved_by),
            }
        }
        Commands::Metrics { json } => {
            let store = open_store(&cfg)?;
            let incidents = store.list_recent(METRICS_WINDOW + 1).await?;
            let summary = MetricsSummary::over_window(incidents, METRICS_WINDOW);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{summary}");
            }
        }
        Commands::Actions => {
            println!(
                "{:<18} | {:<6} | {:<8} | {:<7} | Description",
                "Action", "Risk", "Approval", "Allowed"
            );
            println!("{:-<18}-|-{:-<6}-|-{:-<8}-|-{:-<7}-|-{:-<40}", "", "", "", "", "");
            for spec in registry() {
                let risk = serde_json::to_value(spec.risk)?;
                println!(
                    "{:<18} | {:<6} | {:<8} | {:<7} | {}",
                    spec.name.as_str(),
                    risk.as_str().unwrap_or("?"),
                    if cfg.policy.needs_approval(spec.name) { "required" } else { "no" },
                    if cfg.policy.allowed_actions.contains(&spec.name) { "yes" } else { "no" },
                    spec.description
                );
            }
            if cfg.policy.dry_run {
                println!("\nDry-run mode is on: no action will be executed.");
            }
        }
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| cfg.api.bind.clone());
            let store = open_store(&cfg)?;
            let shutdown = CancellationToken::new();
            cancel_on_signal(shutdown.clone());
            logresponder::serve(&bind, AppState::shared(store), shutdown).await?;
        }
    }

    Ok(())
}
