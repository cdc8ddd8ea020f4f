//! Folds backend-pushed notifications into the registry.
//!
//! Every notification is applied idempotently: delivering the same one twice
//! leaves the registry exactly as a single delivery did. Notifications for a
//! mission with a delete in flight are dropped so the mission does not
//! reappear before the delete resolves.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{MissionNotification, RawNotification};
use crate::error::ReconcileError;
use crate::mission::{MissionId, MissionState};
use crate::registry::{MissionRegistry, PendingKind};

/// Why a notification was dropped without touching the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// The notification targets a mission the registry does not hold.
    UnknownMission,
    /// A local delete for the mission is in flight.
    PendingDelete,
    Stale(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// The notification matched the current state.
    Unchanged,
    Discarded(DiscardReason),
}

impl ReconcileOutcome {
    fn from_change(changed: Option<bool>) -> Self {
        match changed {
            Some(true) => Self::Applied,
            Some(false) => Self::Unchanged,
            None => Self::Discarded(DiscardReason::UnknownMission),
        }
    }
}

#[derive(Clone)]
pub struct EventReconciler {
    registry: MissionRegistry,
}

impl EventReconciler {
    pub fn new(registry: MissionRegistry) -> Self {
        Self { registry }
    }

    /// Decode and apply a wire notification.
    ///
    /// # Errors
    ///
    /// Unknown or malformed notifications are rejected before touching the
    /// registry. Callers log and drop them.
    pub fn handle_raw(&self, raw: &RawNotification) -> Result<ReconcileOutcome, ReconcileError> {
        let notification = MissionNotification::decode(raw)?;
        Ok(self.apply(&notification))
    }

    pub fn apply(&self, notification: &MissionNotification) -> ReconcileOutcome {
        let id = notification.mission_id();
        if self.registry.has_pending(id, PendingKind::Delete) {
            debug!(
                mission_id = %id,
                event = notification.event_name(),
                "Dropping notification for mission with pending delete"
            );
            return ReconcileOutcome::Discarded(DiscardReason::PendingDelete);
        }

        let outcome = match notification {
            MissionNotification::Created { mission } => {
                if self.registry.upsert_record(mission.clone()) {
                    ReconcileOutcome::Applied
                } else {
                    ReconcileOutcome::Unchanged
                }
            }
            MissionNotification::Updated { mission_id, patch } => ReconcileOutcome::from_change(
                self.registry.update_with(mission_id, |m| m.apply_patch(patch)),
            ),
            MissionNotification::Deleted { mission_id } => match self.registry.remove(mission_id) {
                Some(_) => {
                    let dropped = self.registry.forget_pending(mission_id);
                    if dropped > 0 {
                        debug!(mission_id = %mission_id, dropped, "Forgot pending operations of deleted mission");
                    }
                    ReconcileOutcome::Applied
                }
                None => ReconcileOutcome::Discarded(DiscardReason::UnknownMission),
            },
            MissionNotification::StateChanged {
                mission_id,
                previous_state,
                new_state,
                timestamp,
                error,
            } => {
                let outcome = ReconcileOutcome::from_change(self.registry.update_with(mission_id, |m| {
                    if let Some(previous) = previous_state {
                        if *previous != m.state() && m.state() != *new_state {
                            debug!(
                                mission_id = %mission_id,
                                reported = %previous,
                                local = %m.state(),
                                "Backend previous state differs from local"
                            );
                        }
                    }
                    m.apply_backend_state(*new_state, *timestamp, error.clone())
                }));
                if outcome != ReconcileOutcome::Discarded(DiscardReason::UnknownMission) {
                    self.supersede(mission_id, *new_state);
                }
                outcome
            }
            MissionNotification::Progress {
                mission_id,
                progress,
            } => ReconcileOutcome::from_change(
                self.registry.update_with(mission_id, |m| m.progress.merge(progress)),
            ),
            MissionNotification::Checkpoint {
                mission_id,
                checkpoint,
            } => ReconcileOutcome::from_change(
                self.registry.update_with(mission_id, |m| m.append_checkpoint(checkpoint)),
            ),
            MissionNotification::CostUpdated { mission_id, cost } => {
                let Some(current) = self.registry.get(mission_id) else {
                    return ReconcileOutcome::Discarded(DiscardReason::UnknownMission);
                };
                if current.state() == MissionState::Running && cost.total_cost < current.cost.total_cost {
                    let err = ReconcileError::Stale {
                        event: notification.event_name().to_string(),
                        id: mission_id.clone(),
                        reason: format!(
                            "total cost went from {} to {} while running",
                            current.cost.total_cost, cost.total_cost
                        ),
                    };
                    warn!(error = %err, "Discarding notification");
                    return ReconcileOutcome::Discarded(DiscardReason::Stale(err.to_string()));
                }
                ReconcileOutcome::from_change(self.registry.update_with(mission_id, |m| {
                    if m.cost == *cost {
                        false
                    } else {
                        m.cost = cost.clone();
                        true
                    }
                }))
            }
        };

        if outcome == ReconcileOutcome::Discarded(DiscardReason::UnknownMission) {
            debug!(
                mission_id = %id,
                event = notification.event_name(),
                "Notification for unknown mission"
            );
        }
        outcome
    }

    fn supersede(&self, id: &MissionId, observed: MissionState) {
        for kind in self.registry.supersede_controls(id, observed) {
            info!(mission_id = %id, %kind, %observed, "In-flight control superseded by backend state");
        }
    }

    /// Consume notifications until cancelled or the channel closes.
    ///
    /// Returns how many notifications were applied.
    pub async fn run(
        &self,
        mut receiver: broadcast::Receiver<RawNotification>,
        cancel: CancellationToken,
    ) -> usize {
        let mut applied = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Reconciler cancelled");
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(raw) => match self.handle_raw(&raw) {
                        Ok(ReconcileOutcome::Applied) => applied += 1,
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "Dropping notification"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reconciler lagged behind the event channel; refresh to resync");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event channel closed");
                        break;
                    }
                },
            }
        }
        applied
    }
}
