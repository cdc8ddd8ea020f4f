//! Backend-pushed mission notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReconcileError;
use crate::mission::{
    Checkpoint, MissionCost, MissionError, MissionId, MissionPatch, MissionRecord, MissionState,
    ProgressPatch,
};

/// Notification as it arrives on the wire: a string discriminator plus an
/// untyped payload. Decoded once by [`MissionNotification::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNotification {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl RawNotification {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Typed mission notification.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionNotification {
    Created {
        mission: MissionRecord,
    },
    Updated {
        mission_id: MissionId,
        patch: MissionPatch,
    },
    Deleted {
        mission_id: MissionId,
    },
    StateChanged {
        mission_id: MissionId,
        previous_state: Option<MissionState>,
        new_state: MissionState,
        timestamp: DateTime<Utc>,
        error: Option<MissionError>,
    },
    Progress {
        mission_id: MissionId,
        progress: ProgressPatch,
    },
    Checkpoint {
        mission_id: MissionId,
        checkpoint: Checkpoint,
    },
    CostUpdated {
        mission_id: MissionId,
        cost: MissionCost,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedPayload {
    mission_id: MissionId,
    mission: MissionRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatedPayload {
    mission_id: MissionId,
    #[serde(default)]
    mission: MissionPatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletedPayload {
    mission_id: MissionId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateChangedPayload {
    mission_id: MissionId,
    #[serde(default)]
    previous_state: Option<MissionState>,
    new_state: MissionState,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    error: Option<MissionError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressPayload {
    mission_id: MissionId,
    progress: ProgressPatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointPayload {
    mission_id: MissionId,
    checkpoint: Checkpoint,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CostPayload {
    mission_id: MissionId,
    cost: MissionCost,
}

fn payload<T: serde::de::DeserializeOwned>(raw: &RawNotification) -> Result<T, ReconcileError> {
    serde_json::from_value(raw.payload.clone()).map_err(|e| ReconcileError::Malformed {
        event: raw.event.clone(),
        message: e.to_string(),
    })
}

impl MissionNotification {
    /// Decode a raw notification. Unknown discriminants are rejected.
    pub fn decode(raw: &RawNotification) -> Result<Self, ReconcileError> {
        let decoded = match raw.event.as_str() {
            "mission.created" => {
                let p: CreatedPayload = payload(raw)?;
                if p.mission.id != p.mission_id {
                    return Err(ReconcileError::Malformed {
                        event: raw.event.clone(),
                        message: format!(
                            "missionId {} does not match mission.id {}",
                            p.mission_id, p.mission.id
                        ),
                    });
                }
                Self::Created { mission: p.mission }
            }
            "mission.updated" => {
                let p: UpdatedPayload = payload(raw)?;
                Self::Updated {
                    mission_id: p.mission_id,
                    patch: p.mission,
                }
            }
            "mission.deleted" => {
                let p: DeletedPayload = payload(raw)?;
                Self::Deleted {
                    mission_id: p.mission_id,
                }
            }
            "mission.state-changed" => {
                let p: StateChangedPayload = payload(raw)?;
                Self::StateChanged {
                    mission_id: p.mission_id,
                    previous_state: p.previous_state,
                    new_state: p.new_state,
                    timestamp: p.timestamp,
                    error: p.error,
                }
            }
            "mission.progress" => {
                let p: ProgressPayload = payload(raw)?;
                Self::Progress {
                    mission_id: p.mission_id,
                    progress: p.progress,
                }
            }
            "mission.checkpoint" => {
                let p: CheckpointPayload = payload(raw)?;
                Self::Checkpoint {
                    mission_id: p.mission_id,
                    checkpoint: p.checkpoint,
                }
            }
            "mission.cost-updated" => {
                let p: CostPayload = payload(raw)?;
                Self::CostUpdated {
                    mission_id: p.mission_id,
                    cost: p.cost,
                }
            }
            other => return Err(ReconcileError::UnknownEvent(other.to_string())),
        };
        Ok(decoded)
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "mission.created",
            Self::Updated { .. } => "mission.updated",
            Self::Deleted { .. } => "mission.deleted",
            Self::StateChanged { .. } => "mission.state-changed",
            Self::Progress { .. } => "mission.progress",
            Self::Checkpoint { .. } => "mission.checkpoint",
            Self::CostUpdated { .. } => "mission.cost-updated",
        }
    }

    pub fn mission_id(&self) -> &MissionId {
        match self {
            Self::Created { mission } => &mission.id,
            Self::Updated { mission_id, .. } => mission_id,
            Self::Deleted { mission_id } => mission_id,
            Self::StateChanged { mission_id, .. } => mission_id,
            Self::Progress { mission_id, .. } => mission_id,
            Self::Checkpoint { mission_id, .. } => mission_id,
            Self::CostUpdated { mission_id, .. } => mission_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_partial_progress() {
        let raw = RawNotification::new(
            "mission.progress",
            json!({ "missionId": "m1", "progress": { "percentage": 40 } }),
        );
        let decoded = MissionNotification::decode(&raw).unwrap();
        assert_eq!(
            decoded,
            MissionNotification::Progress {
                mission_id: MissionId::new("m1"),
                progress: ProgressPatch {
                    percentage: Some(40.0),
                    ..Default::default()
                },
            }
        );
        assert_eq!(decoded.event_name(), "mission.progress");
    }

    #[test]
    fn decodes_state_change() {
        let raw = RawNotification::new(
            "mission.state-changed",
            json!({
                "missionId": "m1",
                "previousState": "running",
                "newState": "redlined",
                "timestamp": "2026-03-01T10:00:00Z"
            }),
        );
        match MissionNotification::decode(&raw).unwrap() {
            MissionNotification::StateChanged {
                previous_state,
                new_state,
                ..
            } => {
                assert_eq!(previous_state, Some(MissionState::Running));
                assert_eq!(new_state, MissionState::Redlined);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_discriminant() {
        let raw = RawNotification::new("mission.teleported", json!({ "missionId": "m1" }));
        assert_eq!(
            MissionNotification::decode(&raw),
            Err(ReconcileError::UnknownEvent("mission.teleported".to_string()))
        );
    }

    #[test]
    fn rejects_created_with_mismatched_ids() {
        let raw = RawNotification::new(
            "mission.created",
            json!({ "missionId": "m1", "mission": { "id": "m2", "state": "idle" } }),
        );
        assert!(matches!(
            MissionNotification::decode(&raw),
            Err(ReconcileError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_payload_without_mission_id() {
        let raw = RawNotification::new("mission.deleted", json!({}));
        assert!(matches!(
            MissionNotification::decode(&raw),
            Err(ReconcileError::Malformed { .. })
        ));
    }
}
