//! Mission state machine.
//!
//! Local control actions may only follow the edges below. Backend-pushed
//! state changes bypass the table: the backend is authoritative.
//!
//! ```text
//! idle ──start──▶ running ──pause──▶ paused
//!                  │  ▲                │
//!                  │  └────resume──────┘
//!                  ├──▶ complete | error | redlined
//! paused ──abort──▶ error
//! ```

use serde::{Deserialize, Serialize};

/// Mission execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionState {
    /// Created, never started
    Idle,
    Running,
    Paused,
    Complete,
    Error,
    /// Context budget exhausted
    Redlined,
}

impl MissionState {
    pub const ALL: [MissionState; 6] = [
        MissionState::Idle,
        MissionState::Running,
        MissionState::Paused,
        MissionState::Complete,
        MissionState::Error,
        MissionState::Redlined,
    ];

    /// Terminal for this execution; only a restart (a new mission) continues it.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Redlined)
    }

    /// Running or paused.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: MissionState) -> bool {
        use MissionState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Paused)
                | (Running, Complete)
                | (Running, Error)
                | (Running, Redlined)
                | (Paused, Running)
                | (Paused, Error)
        )
    }
}

impl std::fmt::Display for MissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
            Self::Redlined => write!(f, "redlined"),
        }
    }
}

/// User-facing control action on a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Pause,
    Resume,
    Abort,
}

impl ControlAction {
    /// Target state of the action when applied from `from`, if the edge exists.
    pub fn target(self, from: MissionState) -> Option<MissionState> {
        let next = match self {
            Self::Start => MissionState::Running,
            Self::Pause => MissionState::Paused,
            Self::Resume => MissionState::Running,
            Self::Abort => MissionState::Error,
        };
        let allowed = match self {
            Self::Start => from == MissionState::Idle,
            Self::Pause => from == MissionState::Running,
            Self::Resume => from == MissionState::Paused,
            Self::Abort => from.is_active(),
        };
        (allowed && from.can_transition_to(next)).then_some(next)
    }

    /// State the backend is expected to report once the action took effect.
    pub fn expected_state(self) -> MissionState {
        match self {
            Self::Start | Self::Resume => MissionState::Running,
            Self::Pause => MissionState::Paused,
            Self::Abort => MissionState::Error,
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Pause => write!(f, "pause"),
            Self::Resume => write!(f, "resume"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Which control actions the UI may offer for a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlState {
    pub can_start: bool,
    pub can_pause: bool,
    pub can_resume: bool,
    pub can_abort: bool,
    pub can_restart: bool,
}

impl ControlState {
    pub fn for_state(state: MissionState) -> Self {
        Self {
            can_start: ControlAction::Start.target(state).is_some(),
            can_pause: ControlAction::Pause.target(state).is_some(),
            can_resume: ControlAction::Resume.target(state).is_some(),
            can_abort: ControlAction::Abort.target(state).is_some(),
            can_restart: state.is_terminal(),
        }
    }

    pub fn permits(&self, action: ControlAction) -> bool {
        match action {
            ControlAction::Start => self.can_start,
            ControlAction::Pause => self.can_pause,
            ControlAction::Resume => self.can_resume,
            ControlAction::Abort => self.can_abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in MissionState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in MissionState::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn abort_is_allowed_from_running_and_paused_only() {
        assert_eq!(
            ControlAction::Abort.target(MissionState::Running),
            Some(MissionState::Error)
        );
        assert_eq!(
            ControlAction::Abort.target(MissionState::Paused),
            Some(MissionState::Error)
        );
        assert_eq!(ControlAction::Abort.target(MissionState::Idle), None);
        assert_eq!(ControlAction::Abort.target(MissionState::Complete), None);
    }

    #[test]
    fn control_state_tracks_state_machine() {
        let idle = ControlState::for_state(MissionState::Idle);
        assert!(idle.can_start);
        assert!(!idle.can_pause && !idle.can_resume && !idle.can_abort && !idle.can_restart);

        let paused = ControlState::for_state(MissionState::Paused);
        assert!(paused.can_resume && paused.can_abort);
        assert!(!paused.can_start && !paused.can_pause);

        let redlined = ControlState::for_state(MissionState::Redlined);
        assert!(redlined.can_restart);
        assert!(!redlined.permits(ControlAction::Resume));
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&MissionState::Redlined).unwrap();
        assert_eq!(json, "\"redlined\"");
        let parsed: MissionState = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(parsed, MissionState::Paused);
    }
}
