//! logresponder -- log-driven incident response with a safety gate.
//!
//! This crate watches log streams for anomalies, has a language model
//! summarize each one and propose a remediation, and routes that proposal
//! through an allow-list / approval / dry-run gate before anything runs.
//! Every anomaly ends as a persisted incident with an explicit outcome.

pub mod action;
pub mod api;
pub mod audit;
pub mod config;
pub mod detect;
pub mod executor;
pub mod gate;
pub mod incident;
pub mod metrics;
pub mod pipeline;
pub mod storage;
pub mod summarize;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

/// Serve the HTTP API until `shutdown` is cancelled.
pub async fn serve(bind: &str, state: api::state::AppState, shutdown: CancellationToken) -> Result<()> {
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address: {bind}"))?;
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "logresponder API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
