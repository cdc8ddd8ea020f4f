//! mission-sync-replay
//!
//! Replays an NDJSON notification log through the reconciler and prints the
//! resulting missions and statistics.

use anyhow::Context;
use mission_sync::{replay, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the report.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mission_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = SyncConfig::from_env()?;
    info!(
        local_id_prefix = %config.local_id_prefix,
        timeout_secs = config.command_timeout.as_secs(),
        list_limit = config.list_limit,
        "Loaded configuration"
    );

    let path = std::env::args()
        .nth(1)
        .context("usage: mission-sync-replay <events.ndjson>")?;

    let report = replay::replay_file(&path).await?;
    info!(
        path = %path,
        applied = report.counts.applied,
        unchanged = report.counts.unchanged,
        discarded = report.counts.discarded,
        "Replay finished"
    );
    for rejected in &report.rejected {
        warn!("line {}: {}", rejected.line, rejected.reason);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
