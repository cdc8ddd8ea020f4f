//! Pending operation ledger.
//!
//! One record per in-flight optimistic mutation, keyed by (mission id, kind).
//! A record is `InFlight` until its command resolves, or `Superseded` when a
//! backend state change made the pending control action moot. Resolution
//! removes the record either way.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::mission::{ControlAction, MissionId, MissionState};

/// Kind of optimistic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Create,
    Update,
    Delete,
    Start,
    Pause,
    Resume,
    Abort,
}

impl PendingKind {
    pub fn control_action(self) -> Option<ControlAction> {
        match self {
            Self::Start => Some(ControlAction::Start),
            Self::Pause => Some(ControlAction::Pause),
            Self::Resume => Some(ControlAction::Resume),
            Self::Abort => Some(ControlAction::Abort),
            Self::Create | Self::Update | Self::Delete => None,
        }
    }
}

impl From<ControlAction> for PendingKind {
    fn from(action: ControlAction) -> Self {
        match action {
            ControlAction::Start => Self::Start,
            ControlAction::Pause => Self::Pause,
            ControlAction::Resume => Self::Resume,
            ControlAction::Abort => Self::Abort,
        }
    }
}

impl std::fmt::Display for PendingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Start => write!(f, "start"),
            Self::Pause => write!(f, "pause"),
            Self::Resume => write!(f, "resume"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PendingState {
    InFlight,
    /// The backend moved the mission to `observed` while the command was in flight.
    Superseded { observed: MissionState },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub target_id: MissionId,
    pub kind: PendingKind,
    pub issued_at: DateTime<Utc>,
    pub state: PendingState,
}

impl PendingOperation {
    pub fn is_superseded(&self) -> bool {
        matches!(self.state, PendingState::Superseded { .. })
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingLedger {
    ops: HashMap<(MissionId, PendingKind), PendingOperation>,
}

impl PendingLedger {
    /// Record a new in-flight operation. Returns false if one of the same
    /// kind is already recorded for the mission.
    pub fn track(&mut self, id: &MissionId, kind: PendingKind, now: DateTime<Utc>) -> bool {
        let key = (id.clone(), kind);
        if self.ops.contains_key(&key) {
            return false;
        }
        self.ops.insert(
            key,
            PendingOperation {
                target_id: id.clone(),
                kind,
                issued_at: now,
                state: PendingState::InFlight,
            },
        );
        true
    }

    pub fn clear(&mut self, id: &MissionId, kind: PendingKind) -> Option<PendingOperation> {
        self.ops.remove(&(id.clone(), kind))
    }

    pub fn get(&self, id: &MissionId, kind: PendingKind) -> Option<&PendingOperation> {
        self.ops.get(&(id.clone(), kind))
    }

    pub fn for_mission(&self, id: &MissionId) -> Vec<PendingOperation> {
        let mut ops: Vec<PendingOperation> = self
            .ops
            .values()
            .filter(|op| &op.target_id == id)
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.issued_at);
        ops
    }

    /// Mark in-flight control operations whose expected outcome differs from
    /// the state the backend just reported. Returns the kinds marked.
    pub fn supersede_controls(&mut self, id: &MissionId, observed: MissionState) -> Vec<PendingKind> {
        let mut marked = Vec::new();
        for op in self.ops.values_mut() {
            if &op.target_id != id || op.is_superseded() {
                continue;
            }
            let Some(action) = op.kind.control_action() else {
                continue;
            };
            if action.expected_state() != observed {
                op.state = PendingState::Superseded { observed };
                marked.push(op.kind);
            }
        }
        marked
    }

    /// Move every record for `old` onto `new`. Records already held by `new`
    /// win over the moved ones.
    pub fn rekey(&mut self, old: &MissionId, new: &MissionId) {
        let moved: Vec<(MissionId, PendingKind)> = self
            .ops
            .keys()
            .filter(|(id, _)| id == old)
            .cloned()
            .collect();
        for key in moved {
            if let Some(mut op) = self.ops.remove(&key) {
                op.target_id = new.clone();
                self.ops.entry((new.clone(), key.1)).or_insert(op);
            }
        }
    }

    /// Drop every record for a mission the backend deleted.
    pub fn forget(&mut self, id: &MissionId) -> usize {
        let before = self.ops.len();
        self.ops.retain(|(target, _), _| target != id);
        before - self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_rejects_duplicate_kind_but_allows_other_kinds() {
        let mut ledger = PendingLedger::default();
        let id = MissionId::new("m1");
        let now = Utc::now();
        assert!(ledger.track(&id, PendingKind::Update, now));
        assert!(!ledger.track(&id, PendingKind::Update, now));
        assert!(ledger.track(&id, PendingKind::Start, now));
        assert_eq!(ledger.for_mission(&id).len(), 2);
        assert!(ledger.clear(&id, PendingKind::Update).is_some());
        assert!(ledger.track(&id, PendingKind::Update, now));
    }

    #[test]
    fn supersede_only_marks_contradicted_controls() {
        let mut ledger = PendingLedger::default();
        let id = MissionId::new("m1");
        let now = Utc::now();
        ledger.track(&id, PendingKind::Start, now);
        ledger.track(&id, PendingKind::Update, now);

        assert!(ledger.supersede_controls(&id, MissionState::Running).is_empty());
        assert_eq!(
            ledger.supersede_controls(&id, MissionState::Complete),
            vec![PendingKind::Start]
        );
        assert!(ledger.get(&id, PendingKind::Start).unwrap().is_superseded());
        assert!(!ledger.get(&id, PendingKind::Update).unwrap().is_superseded());
    }

    #[test]
    fn rekey_moves_records_to_server_id() {
        let mut ledger = PendingLedger::default();
        let local = MissionId::new("local-1");
        let server = MissionId::new("srv-1");
        ledger.track(&local, PendingKind::Create, Utc::now());
        ledger.rekey(&local, &server);
        assert!(ledger.get(&local, PendingKind::Create).is_none());
        assert_eq!(
            ledger.get(&server, PendingKind::Create).map(|op| &op.target_id),
            Some(&server)
        );
    }
}
