//! smokewatch -- smoke tests with memory for a locally developed web app.
//!
//! This crate provides the probe set, the persisted health memory, the
//! cycle runner, the file-change watcher and the recovery advisor.

pub mod config;
pub mod memory;
pub mod probes;
pub mod recovery;
pub mod runner;
pub mod watcher;

use anyhow::Result;

use crate::config::SmokeConfig;
use crate::runner::Runner;
use crate::watcher::{WatchStats, Watcher};

/// Watch the project until ctrl-c / SIGTERM, then persist memory.
pub async fn watch(config: SmokeConfig) -> Result<WatchStats> {
    let runner = Runner::from_config(config)?;
    let mut watcher = Watcher::new(runner)?;
    watcher.init()?;

    let token = watcher.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    let stats = watcher.run().await;
    watcher.shutdown()?;
    stats
}

/// Resolves on ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
