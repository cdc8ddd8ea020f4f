//! Mission entity model.
//!
//! A `Mission` is the UI-side mirror of one backend mission. Its `state` is
//! private: it only changes through [`Mission::apply_action`] (local edges of
//! the state machine) or [`Mission::apply_backend_state`] (authoritative).

mod state;

pub use state::{ControlAction, ControlState, MissionState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Error code recorded when a mission is aborted by the user.
pub const ABORTED_ERROR_CODE: &str = "aborted";

/// Mission identifier. Local (unconfirmed) ids carry a reserved prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MissionId(String);

impl MissionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh temporary id for an optimistic create.
    pub fn local(prefix: &str) -> Self {
        Self(format!("{}{}", prefix, Uuid::new_v4()))
    }

    pub fn is_local(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MissionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Execution mode of a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionMode {
    #[default]
    Agentic,
    Interactive,
}

/// Execution progress of a mission.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MissionProgress {
    pub current_step: u32,
    pub total_steps: u32,
    pub current_action: Option<String>,
    /// 0..=100
    pub percentage: f64,
    /// Fraction of the context budget in use, 0..=1
    pub context_usage: f64,
}

/// Partial progress update; absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressPatch {
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub current_action: Option<String>,
    pub percentage: Option<f64>,
    pub context_usage: Option<f64>,
}

impl MissionProgress {
    /// Merge a partial update. Returns whether anything changed.
    pub fn merge(&mut self, patch: &ProgressPatch) -> bool {
        let before = self.clone();
        if let Some(step) = patch.current_step {
            self.current_step = step;
        }
        if let Some(total) = patch.total_steps {
            self.total_steps = total;
        }
        if let Some(action) = &patch.current_action {
            self.current_action = Some(action.clone());
        }
        if let Some(percentage) = patch.percentage {
            self.percentage = percentage.clamp(0.0, 100.0);
        }
        if let Some(usage) = patch.context_usage {
            self.context_usage = usage.max(0.0);
        }
        *self != before
    }
}

/// Accumulated spend of a mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionCost {
    #[serde(default)]
    pub input_cost: f64,
    #[serde(default)]
    pub output_cost: f64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl MissionCost {
    pub fn zero(currency: &str) -> Self {
        Self {
            input_cost: 0.0,
            output_cost: 0.0,
            total_cost: 0.0,
            currency: currency.to_string(),
        }
    }
}

impl Default for MissionCost {
    fn default() -> Self {
        Self::zero(&default_currency())
    }
}

/// Immutable named snapshot of mission progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Failure details; only present while the mission is in `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionError {
    pub code: String,
    pub message: String,
}

impl MissionError {
    pub fn aborted() -> Self {
        Self {
            code: ABORTED_ERROR_CODE.to_string(),
            message: "Mission aborted by user".to_string(),
        }
    }
}

/// Input for `mission.create`; also the configuration reused by a restart.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MissionInput {
    pub title: String,
    pub prompt: String,
    pub spec_ids: Vec<String>,
    pub backend_id: String,
    pub mode: MissionMode,
    pub tags: BTreeSet<String>,
}

/// Partial update of a mission's user-editable fields.
///
/// Used both as the `mission.update` input and as the payload of
/// `mission.updated` notifications. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MissionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<MissionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
}

impl MissionPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.prompt.is_none()
            && self.spec_ids.is_none()
            && self.backend_id.is_none()
            && self.mode.is_none()
            && self.tags.is_none()
    }
}

/// UI-side mirror of a backend mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mission {
    pub id: MissionId,
    state: MissionState,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub spec_ids: Vec<String>,
    #[serde(default)]
    pub backend_id: String,
    #[serde(default)]
    pub mode: MissionMode,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub progress: MissionProgress,
    #[serde(default)]
    pub cost: MissionCost,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MissionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Mission {
    /// Speculative mission shown while a create is in flight.
    pub fn optimistic(id: MissionId, input: &MissionInput, currency: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: MissionState::Idle,
            title: input.title.clone(),
            prompt: input.prompt.clone(),
            spec_ids: input.spec_ids.clone(),
            backend_id: input.backend_id.clone(),
            mode: input.mode,
            tags: input.tags.clone(),
            progress: MissionProgress::default(),
            cost: MissionCost::zero(currency),
            checkpoints: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn state(&self) -> MissionState {
        self.state
    }

    pub fn control_state(&self) -> ControlState {
        ControlState::for_state(self.state)
    }

    /// Configuration a restart re-submits as a new mission.
    pub fn restart_input(&self) -> MissionInput {
        MissionInput {
            title: self.title.clone(),
            prompt: self.prompt.clone(),
            spec_ids: self.spec_ids.clone(),
            backend_id: self.backend_id.clone(),
            mode: self.mode,
            tags: self.tags.clone(),
        }
    }

    /// Advance `updated_at` to the later of its current value and `at`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }

    /// Apply a local control action. Rejects edges outside the state machine.
    pub fn apply_action(
        &mut self,
        action: ControlAction,
        now: DateTime<Utc>,
    ) -> Result<MissionState, MissionState> {
        let next = action.target(self.state).ok_or(self.state)?;
        let error = (action == ControlAction::Abort).then(MissionError::aborted);
        self.enter_state(next, now, error);
        Ok(next)
    }

    /// Apply a backend-reported state. Any edge is accepted.
    ///
    /// Returns whether the mission changed.
    pub fn apply_backend_state(
        &mut self,
        next: MissionState,
        at: DateTime<Utc>,
        error: Option<MissionError>,
    ) -> bool {
        let error = match next {
            MissionState::Error => error.or_else(|| self.error.clone()),
            _ => None,
        };
        if self.state == next && self.error == error {
            return false;
        }
        self.enter_state(next, at, error);
        true
    }

    fn enter_state(&mut self, next: MissionState, at: DateTime<Utc>, error: Option<MissionError>) {
        if next == MissionState::Running && self.started_at.is_none() {
            self.started_at = Some(at);
        }
        if next.is_terminal() {
            if self.completed_at.is_none() {
                self.completed_at = Some(at);
            }
        } else {
            self.completed_at = None;
        }
        self.state = next;
        self.error = if next == MissionState::Error { error } else { None };
    }

    /// Merge a partial update of the user-editable fields.
    ///
    /// Returns whether anything changed. Does not touch `updated_at`.
    pub fn apply_patch(&mut self, patch: &MissionPatch) -> bool {
        let mut changed = false;
        if let Some(title) = &patch.title {
            changed |= replace_if_different(&mut self.title, title);
        }
        if let Some(prompt) = &patch.prompt {
            changed |= replace_if_different(&mut self.prompt, prompt);
        }
        if let Some(spec_ids) = &patch.spec_ids {
            changed |= replace_if_different(&mut self.spec_ids, spec_ids);
        }
        if let Some(backend_id) = &patch.backend_id {
            changed |= replace_if_different(&mut self.backend_id, backend_id);
        }
        if let Some(mode) = &patch.mode {
            changed |= replace_if_different(&mut self.mode, mode);
        }
        if let Some(tags) = &patch.tags {
            changed |= replace_if_different(&mut self.tags, tags);
        }
        changed
    }

    /// Append a checkpoint unless one with the same id is already recorded.
    pub fn append_checkpoint(&mut self, checkpoint: &Checkpoint) -> bool {
        if self.checkpoints.iter().any(|c| c.id == checkpoint.id) {
            return false;
        }
        self.checkpoints.push(checkpoint.clone());
        true
    }

    /// Merge a full authoritative copy of this mission.
    pub fn merge_authoritative(&mut self, incoming: &Mission) -> bool {
        self.merge_record(&MissionRecord::from(incoming.clone()))
    }

    /// Merge a backend record. Only the fields present in `record` are
    /// applied: `checkpoints` only grow and `updated_at` never moves
    /// backwards. Returns whether anything changed.
    pub fn merge_record(&mut self, record: &MissionRecord) -> bool {
        let before = self.clone();
        self.apply_patch(&record.fields);
        if let Some(state) = record.state {
            self.state = state;
        }
        if let Some(progress) = &record.progress {
            self.progress.merge(progress);
        }
        if let Some(cost) = &record.cost {
            replace_if_different(&mut self.cost, cost);
        }
        for checkpoint in record.checkpoints.iter().flatten() {
            self.append_checkpoint(checkpoint);
        }
        if let Some(at) = record.created_at {
            self.created_at = at;
        }
        if let Some(at) = record.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = record.completed_at {
            self.completed_at = Some(at);
        }
        if !self.state.is_terminal() {
            self.completed_at = None;
        }
        if self.state == MissionState::Error {
            if let Some(error) = &record.error {
                self.error = Some(error.clone());
            }
        } else {
            self.error = None;
        }
        if let Some(at) = record.updated_at {
            self.touch(at);
        }
        *self != before
    }
}

/// Mission as reported by the backend: the `mission.create` response,
/// `mission.list` entries, `mission.created` payloads and command echoes.
///
/// Everything but `id` is optional so that a sparse payload never wipes
/// local data and decoding the same payload twice yields the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionRecord {
    pub id: MissionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<MissionState>,
    #[serde(flatten)]
    pub fields: MissionPatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<MissionCost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoints: Option<Vec<Checkpoint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MissionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl MissionRecord {
    /// Build a new entity from a record. Missing timestamps fall back to `now`.
    pub fn into_mission(self, now: DateTime<Utc>) -> Mission {
        let created_at = self.created_at.or(self.updated_at).unwrap_or(now);
        let mut mission = Mission::optimistic(
            self.id.clone(),
            &MissionInput::default(),
            &MissionCost::default().currency,
            created_at,
        );
        mission.merge_record(&self);
        mission
    }
}

impl From<Mission> for MissionRecord {
    fn from(mission: Mission) -> Self {
        Self {
            id: mission.id,
            state: Some(mission.state),
            fields: MissionPatch {
                title: Some(mission.title),
                prompt: Some(mission.prompt),
                spec_ids: Some(mission.spec_ids),
                backend_id: Some(mission.backend_id),
                mode: Some(mission.mode),
                tags: Some(mission.tags),
            },
            progress: Some(ProgressPatch {
                current_step: Some(mission.progress.current_step),
                total_steps: Some(mission.progress.total_steps),
                current_action: mission.progress.current_action,
                percentage: Some(mission.progress.percentage),
                context_usage: Some(mission.progress.context_usage),
            }),
            cost: Some(mission.cost),
            checkpoints: Some(mission.checkpoints),
            error: mission.error,
            created_at: Some(mission.created_at),
            updated_at: Some(mission.updated_at),
            started_at: mission.started_at,
            completed_at: mission.completed_at,
        }
    }
}

fn replace_if_different<T: PartialEq + Clone>(slot: &mut T, value: &T) -> bool {
    if slot == value {
        return false;
    }
    *slot = value.clone();
    true
}


#[cfg(test)]
mod tests {
    use super::fixtures::mission;
    use super::*;

    #[test]
    fn local_ids_are_recognized_by_prefix() {
        let id = MissionId::local("local-");
        assert!(id.is_local("local-"));
        assert!(!MissionId::new("srv-1").is_local("local-"));
    }

    #[test]
    fn abort_records_aborted_error_and_restart_clears_it() {
        let mut m = mission("m1", MissionState::Running);
        let now = Utc::now();
        assert_eq!(m.apply_action(ControlAction::Abort, now), Ok(MissionState::Error));
        assert_eq!(m.error.as_ref().map(|e| e.code.as_str()), Some(ABORTED_ERROR_CODE));
        assert!(m.completed_at.is_some());

        assert!(m.apply_backend_state(MissionState::Running, now, None));
        assert!(m.error.is_none());
        assert!(m.completed_at.is_none());
    }

    #[test]
    fn rejected_action_leaves_mission_untouched() {
        let mut m = mission("m1", MissionState::Complete);
        let before = m.clone();
        assert_eq!(
            m.apply_action(ControlAction::Pause, Utc::now()),
            Err(MissionState::Complete)
        );
        assert_eq!(m, before);
    }

    #[test]
    fn backend_state_is_idempotent() {
        let mut m = mission("m1", MissionState::Running);
        let at = Utc::now();
        assert!(m.apply_backend_state(MissionState::Redlined, at, None));
        let after_first = m.clone();
        assert!(!m.apply_backend_state(MissionState::Redlined, at, None));
        assert_eq!(m, after_first);
    }

    #[test]
    fn progress_merge_only_touches_given_fields() {
        let mut progress = MissionProgress {
            current_step: 3,
            total_steps: 10,
            current_action: Some("Reading".to_string()),
            percentage: 30.0,
            context_usage: 0.2,
        };
        let changed = progress.merge(&ProgressPatch {
            percentage: Some(40.0),
            ..Default::default()
        });
        assert!(changed);
        assert_eq!(progress.percentage, 40.0);
        assert_eq!(progress.current_step, 3);
        assert_eq!(progress.current_action.as_deref(), Some("Reading"));
    }

    #[test]
    fn authoritative_merge_keeps_checkpoints_append_only() {
        let at = Utc::now();
        let mut local = mission("m1", MissionState::Running);
        local.append_checkpoint(&Checkpoint {
            id: "c1".to_string(),
            name: "first".to_string(),
            description: None,
            step: Some(1),
            created_at: at,
        });
        let mut incoming = mission("m1", MissionState::Running);
        incoming.title = "Renamed".to_string();
        incoming.updated_at = at;

        assert!(local.merge_authoritative(&incoming));
        assert_eq!(local.title, "Renamed");
        assert_eq!(local.checkpoints.len(), 1);
        assert!(!local.merge_authoritative(&incoming));
    }

    #[test]
    fn sparse_record_builds_mission_with_defaults() {
        let record: MissionRecord =
            serde_json::from_str(r#"{"id":"srv-1","state":"idle","title":"T"}"#).unwrap();
        assert!(record.created_at.is_none());
        assert!(record.cost.is_none());

        let now = Utc::now();
        let m = record.into_mission(now);
        assert_eq!(m.id.as_str(), "srv-1");
        assert_eq!(m.title, "T");
        assert_eq!(m.state(), MissionState::Idle);
        assert_eq!(m.cost.total_cost, 0.0);
        assert_eq!(m.created_at, now);
        assert_eq!(m.updated_at, now);
        assert!(m.checkpoints.is_empty());
    }

    #[test]
    fn sparse_record_leaves_absent_fields_alone() {
        let mut m = mission("m1", MissionState::Running);
        m.cost.total_cost = 2.0;
        m.progress.percentage = 40.0;
        let before = m.clone();

        let record: MissionRecord =
            serde_json::from_str(r#"{"id":"m1","state":"running"}"#).unwrap();
        assert!(!m.merge_record(&record));
        assert_eq!(m, before);

        let renamed: MissionRecord =
            serde_json::from_str(r#"{"id":"m1","title":"Renamed","progress":{"currentStep":4}}"#)
                .unwrap();
        assert!(m.merge_record(&renamed));
        assert_eq!(m.title, "Renamed");
        assert_eq!(m.prompt, before.prompt);
        assert_eq!(m.cost, before.cost);
        assert_eq!(m.progress.percentage, 40.0);
        assert_eq!(m.progress.current_step, 4);
        assert_eq!(m.updated_at, before.updated_at);
        assert!(!m.merge_record(&renamed));
    }

    #[test]
    fn record_of_full_mission_round_trips() {
        let mut m = mission("m1", MissionState::Error);
        m.error = Some(MissionError::aborted());
        m.completed_at = Some(m.created_at);
        let rebuilt = MissionRecord::from(m.clone()).into_mission(Utc::now());
        assert_eq!(rebuilt, m);
    }
}
