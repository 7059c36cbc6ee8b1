//! Atomata - fetch the current folding trajectory from a local agent.
//!
//! Connects to the agent named in the configuration, collects the first
//! usable slot's trajectory and writes it to stdout as JSON. Falls back to
//! the bundled demo protein when the agent is unreachable.

use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atomata::config::ClientConfig;
use atomata::session::{DataSource, Session};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the trajectory JSON
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "atomata=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    tracing::info!("Starting Atomata v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env()?;
    let mut session = Session::tcp(config);

    let interrupted = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let trajectories = match session.retrieve_until(interrupted).await {
        Ok(trajectories) => trajectories,
        Err(e) => {
            tracing::error!("{}", e);
            return Err(e.into());
        }
    };

    let source = match session.source() {
        Some(DataSource::Remote) => "agent",
        _ => "demo data",
    };
    for trajectory in &trajectories {
        tracing::info!(
            "Slot {} from {}: {} snapshot(s), {} atoms, {} bonds",
            trajectory.slot_id,
            source,
            trajectory.len(),
            trajectory.topology().atom_count(),
            trajectory.topology().bonds.len()
        );
    }

    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &trajectories)
        .context("Failed to write trajectories")?;
    writeln!(stdout)?;
    Ok(())
}
