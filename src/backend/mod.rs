//! Boundary to the backend event channel.
//!
//! The channel carries request/response commands (`mission.create`, ...) and
//! a stream of backend-pushed notifications. The transport itself lives
//! outside this crate; tests supply a scripted in-process channel.

pub mod events;
#[cfg(test)]
pub(crate) mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::BackendError;
use crate::mission::{MissionId, MissionInput, MissionPatch, MissionState};
pub use events::{MissionNotification, RawNotification};

/// Bidirectional command/notification transport to the backend.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Send a command and wait for its result.
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, BackendError>;

    /// Receive backend-pushed notifications from now on.
    fn subscribe(&self) -> broadcast::Receiver<RawNotification>;
}

/// Options for `mission.list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<MissionState>,
}

/// Commands issued by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionCommand {
    List(ListOptions),
    Create(MissionInput),
    Update { id: MissionId, input: MissionPatch },
    Delete(MissionId),
    Start(MissionId),
    Pause(MissionId),
    Resume(MissionId),
    Abort(MissionId),
}

impl MissionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::List(_) => "mission.list",
            Self::Create(_) => "mission.create",
            Self::Update { .. } => "mission.update",
            Self::Delete(_) => "mission.delete",
            Self::Start(_) => "mission.start",
            Self::Pause(_) => "mission.pause",
            Self::Resume(_) => "mission.resume",
            Self::Abort(_) => "mission.abort",
        }
    }

    /// Mission the command targets, if any.
    pub fn target(&self) -> Option<&MissionId> {
        match self {
            Self::List(_) | Self::Create(_) => None,
            Self::Update { id, .. }
            | Self::Delete(id)
            | Self::Start(id)
            | Self::Pause(id)
            | Self::Resume(id)
            | Self::Abort(id) => Some(id),
        }
    }

    pub fn args(&self) -> Result<Value, BackendError> {
        let encode = |err: serde_json::Error| BackendError::Decode {
            command: self.name().to_string(),
            message: format!("failed to encode arguments: {}", err),
        };
        match self {
            Self::List(options) => serde_json::to_value(options).map_err(encode),
            Self::Create(input) => serde_json::to_value(input).map_err(encode),
            Self::Update { id, input } => Ok(json!({
                "id": id,
                "input": serde_json::to_value(input).map_err(encode)?,
            })),
            Self::Delete(id) | Self::Start(id) | Self::Pause(id) | Self::Resume(id) | Self::Abort(id) => {
                Ok(json!({ "id": id }))
            }
        }
    }
}
