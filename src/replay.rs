//! Replays a recorded notification stream into a fresh registry.
//!
//! The input is NDJSON: one `{"event": ..., "payload": ...}` object per line.
//! Blank lines and lines starting with `#` are skipped.

use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::RawNotification;
use crate::mission::Mission;
use crate::reconciler::{EventReconciler, ReconcileOutcome};
use crate::registry::MissionRegistry;
use crate::views::MissionStats;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A line that could not be applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedLine {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayCounts {
    pub applied: usize,
    pub unchanged: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub counts: ReplayCounts,
    pub rejected: Vec<RejectedLine>,
    pub stats: MissionStats,
    pub missions: Vec<Mission>,
}

/// Parse NDJSON text. Returns the decoded notifications with their 1-based
/// line numbers, plus the lines that were not valid notifications.
pub fn parse_lines(text: &str) -> (Vec<(usize, RawNotification)>, Vec<RejectedLine>) {
    let mut notifications = Vec::new();
    let mut rejected = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<RawNotification>(trimmed) {
            Ok(raw) => notifications.push((index + 1, raw)),
            Err(e) => rejected.push(RejectedLine {
                line: index + 1,
                reason: e.to_string(),
            }),
        }
    }
    (notifications, rejected)
}

/// Replay NDJSON text into a new registry.
pub fn replay_str(text: &str) -> ReplayReport {
    let registry = MissionRegistry::new();
    let reconciler = EventReconciler::new(registry.clone());
    let (notifications, mut rejected) = parse_lines(text);
    let mut counts = ReplayCounts::default();

    for (line, raw) in notifications {
        match reconciler.handle_raw(&raw) {
            Ok(ReconcileOutcome::Applied) => counts.applied += 1,
            Ok(ReconcileOutcome::Unchanged) => counts.unchanged += 1,
            Ok(ReconcileOutcome::Discarded(reason)) => {
                debug!(line, ?reason, "Discarded replayed notification");
                counts.discarded += 1;
            }
            Err(err) => {
                warn!(line, error = %err, "Rejected replayed notification");
                rejected.push(RejectedLine {
                    line,
                    reason: err.to_string(),
                });
            }
        }
    }
    rejected.sort_by_key(|r| r.line);

    let snapshot = registry.snapshot();
    ReplayReport {
        counts,
        rejected,
        stats: MissionStats::compute(&snapshot),
        missions: snapshot.all().iter().map(|m| (**m).clone()).collect(),
    }
}

pub async fn replay_file(path: impl AsRef<Path>) -> Result<ReplayReport, ReplayError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ReplayError::Io {
            path: path.display().to_string(),
            source,
        })?;
    Ok(replay_str(&text))
}
