//! Command executor.
//!
//! Every user-facing mission action goes through here. Each one validates
//! local preconditions, applies its optimistic effect to the registry, sends
//! the backend command, and then confirms or rolls back. Control actions
//! (start/pause/resume/abort) have no optimistic effect; they only record a
//! pending operation so a contradicting backend state change can supersede
//! them while they are in flight.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{EventChannel, ListOptions, MissionCommand};
use crate::config::SyncConfig;
use crate::error::{BackendError, Result, SyncError};
use crate::mission::{
    ControlAction, Mission, MissionId, MissionInput, MissionPatch, MissionRecord, MissionState,
};
use crate::registry::{MissionRegistry, Notice, NoticeLevel, PendingKind, PendingState};

/// Result of a control action that reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The backend accepted the action and the local state follows it.
    Accepted,
    /// A backend state change overtook the action while it was in flight.
    Superseded { observed: MissionState },
}

pub struct CommandExecutor {
    registry: MissionRegistry,
    channel: Arc<dyn EventChannel>,
    config: SyncConfig,
}

impl CommandExecutor {
    pub fn new(registry: MissionRegistry, channel: Arc<dyn EventChannel>, config: SyncConfig) -> Self {
        Self {
            registry,
            channel,
            config,
        }
    }

    pub fn registry(&self) -> &MissionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ==================== Mutations ====================

    /// Create a mission. It appears in the registry immediately under a local
    /// id, which is swapped for the server id once the backend confirms.
    pub async fn create(&self, input: MissionInput) -> Result<Mission> {
        validate_input(&input)?;

        let local_id = MissionId::local(&self.config.local_id_prefix);
        let optimistic = Mission::optimistic(local_id.clone(), &input, &self.config.currency, Utc::now());
        self.registry.track_pending(&local_id, PendingKind::Create)?;
        self.registry.upsert(optimistic);
        info!(mission_id = %local_id, title = %input.title, "Creating mission");

        let command = MissionCommand::Create(input);
        let response = self
            .call(&command)
            .await
            .and_then(|value| decode::<MissionRecord>(command.name(), value))
            .and_then(|record| {
                if record.id.is_local(&self.config.local_id_prefix) {
                    Err(BackendError::Decode {
                        command: command.name().to_string(),
                        message: format!("backend returned reserved local id {}", record.id),
                    })
                } else {
                    Ok(record)
                }
            });

        match response {
            Ok(confirmed) => {
                let server_id = confirmed.id.clone();
                self.registry.replace_id(&local_id, confirmed.clone());
                self.registry.clear_pending(&server_id, PendingKind::Create);
                self.registry.clear_pending(&local_id, PendingKind::Create);
                info!(local_id = %local_id, mission_id = %server_id, "Mission confirmed");
                self.succeeded();
                Ok(self
                    .registry
                    .get(&server_id)
                    .map(|m| (*m).clone())
                    .unwrap_or_else(|| confirmed.into_mission(Utc::now())))
            }
            Err(err) => {
                self.registry.remove(&local_id);
                self.registry.clear_pending(&local_id, PendingKind::Create);
                warn!(mission_id = %local_id, "Rolled back optimistic create");
                Err(self.fail(None, err))
            }
        }
    }

    /// Update user-editable fields. Applied optimistically; on failure every
    /// patched field the backend has not overwritten meanwhile is reverted.
    pub async fn update(&self, id: &MissionId, patch: MissionPatch) -> Result<()> {
        if patch.is_empty() {
            return Err(SyncError::precondition("update has no changes"));
        }
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(SyncError::precondition("title must not be empty"));
            }
        }
        let previous = self.confirmed(id)?;
        self.registry.track_pending(id, PendingKind::Update)?;
        self.registry.update_with(id, |m| m.apply_patch(&patch));
        let optimistic = self.registry.get(id);
        debug!(mission_id = %id, "Applied optimistic update");

        let result = self
            .call(&MissionCommand::Update {
                id: id.clone(),
                input: patch.clone(),
            })
            .await;

        match result {
            Ok(value) => {
                self.registry.clear_pending(id, PendingKind::Update);
                if let Some(echo) = optional_record(value, id) {
                    if self.registry.merge_existing(&echo).is_none() {
                        debug!(mission_id = %id, "Mission gone before update echo, ignoring it");
                    }
                }
                self.succeeded();
                Ok(())
            }
            Err(err) => {
                self.rollback_update(id, &previous, optimistic.as_deref(), &patch);
                self.registry.clear_pending(id, PendingKind::Update);
                Err(self.fail(Some(id), err))
            }
        }
    }

    fn rollback_update(
        &self,
        id: &MissionId,
        previous: &Mission,
        optimistic: Option<&Mission>,
        patch: &MissionPatch,
    ) {
        let outcome = self.registry.rewrite(id, |current| {
            if Some(&*current) == optimistic {
                *current = previous.clone();
                return true;
            }
            let Some(optimistic) = optimistic else {
                return false;
            };
            let reverted = revert_patched_fields(current, previous, optimistic, patch);
            if reverted {
                current.touch(Utc::now());
            }
            reverted
        });
        match outcome {
            Some(true) => warn!(mission_id = %id, "Rolled back optimistic update"),
            Some(false) => debug!(mission_id = %id, "Update rollback found nothing to revert"),
            None => debug!(mission_id = %id, "Mission gone before update rollback"),
        }
    }

    /// Delete a mission. It disappears immediately and is restored at its
    /// original position if the backend refuses.
    pub async fn delete(&self, id: &MissionId) -> Result<()> {
        self.confirmed(id)?;
        self.registry.track_pending(id, PendingKind::Delete)?;
        let removed = self.registry.remove(id);
        debug!(mission_id = %id, "Applied optimistic delete");

        match self.call(&MissionCommand::Delete(id.clone())).await {
            Ok(_) => {
                self.registry.clear_pending(id, PendingKind::Delete);
                info!(mission_id = %id, "Mission deleted");
                self.succeeded();
                Ok(())
            }
            Err(err) => {
                if let Some(removed) = removed {
                    self.registry.restore(removed);
                }
                self.registry.clear_pending(id, PendingKind::Delete);
                warn!(mission_id = %id, "Rolled back optimistic delete");
                Err(self.fail(Some(id), err))
            }
        }
    }

    /// Restart a finished mission by creating a new one with its configuration.
    /// The old mission is left as it is.
    pub async fn restart(&self, id: &MissionId) -> Result<Mission> {
        let mission = self
            .registry
            .get(id)
            .ok_or_else(|| SyncError::precondition(format!("mission {} not found", id)))?;
        if !mission.control_state().can_restart {
            return Err(SyncError::precondition(format!(
                "cannot restart mission {} in state {}",
                id,
                mission.state()
            )));
        }
        info!(mission_id = %id, "Restarting mission as a new mission");
        self.create(mission.restart_input()).await
    }

    /// Load the authoritative mission list into the registry.
    ///
    /// Returns how many registry entries changed.
    pub async fn refresh(&self, mut options: ListOptions) -> Result<usize> {
        if options.limit.is_none() {
            options.limit = Some(self.config.list_limit);
        }
        let command = MissionCommand::List(options);
        let records = match self
            .call(&command)
            .await
            .and_then(|value| decode::<Vec<MissionRecord>>(command.name(), value))
        {
            Ok(records) => records,
            Err(err) => return Err(self.fail(None, err)),
        };

        let mut changed = 0;
        for record in records {
            if self.registry.has_pending(&record.id, PendingKind::Delete) {
                debug!(mission_id = %record.id, "Skipping listed mission with pending delete");
                continue;
            }
            if self.registry.upsert_record(record) {
                changed += 1;
            }
        }
        info!(changed, "Refreshed mission list");
        self.succeeded();
        Ok(changed)
    }

    // ==================== Control ====================

    pub async fn start(&self, id: &MissionId) -> Result<ControlOutcome> {
        self.control(id, ControlAction::Start).await
    }

    pub async fn pause(&self, id: &MissionId) -> Result<ControlOutcome> {
        self.control(id, ControlAction::Pause).await
    }

    pub async fn resume(&self, id: &MissionId) -> Result<ControlOutcome> {
        self.control(id, ControlAction::Resume).await
    }

    pub async fn abort(&self, id: &MissionId) -> Result<ControlOutcome> {
        self.control(id, ControlAction::Abort).await
    }

    async fn control(&self, id: &MissionId, action: ControlAction) -> Result<ControlOutcome> {
        let mission = self.confirmed(id)?;
        if !mission.control_state().permits(action) {
            return Err(SyncError::precondition(format!(
                "cannot {} mission {} in state {}",
                action,
                id,
                mission.state()
            )));
        }
        let kind = PendingKind::from(action);
        self.registry.track_pending(id, kind)?;

        let command = match action {
            ControlAction::Start => MissionCommand::Start(id.clone()),
            ControlAction::Pause => MissionCommand::Pause(id.clone()),
            ControlAction::Resume => MissionCommand::Resume(id.clone()),
            ControlAction::Abort => MissionCommand::Abort(id.clone()),
        };
        let result = self.call(&command).await;
        let pending = self.registry.clear_pending(id, kind);

        if let Some(PendingState::Superseded { observed }) = pending.map(|op| op.state) {
            info!(mission_id = %id, %action, %observed, "Control action superseded by backend");
            self.registry.set_notice(Notice::info(
                format!(
                    "{} of mission {} was superseded: backend reports {}",
                    action, id, observed
                ),
                Some(id.clone()),
            ));
            return Ok(ControlOutcome::Superseded { observed });
        }

        match result {
            Ok(value) => {
                self.succeeded();
                match optional_record(value, id) {
                    Some(echo) => {
                        if self.registry.merge_existing(&echo).is_none() {
                            debug!(mission_id = %id, %action, "Mission gone before control echo, ignoring it");
                        }
                    }
                    None => {
                        let now = Utc::now();
                        self.registry.update_with(id, |m| match m.apply_action(action, now) {
                            Ok(_) => true,
                            Err(state) => {
                                debug!(mission_id = %id, %action, %state, "Edge no longer permitted, keeping backend state");
                                false
                            }
                        });
                    }
                }
                info!(mission_id = %id, %action, "Control action accepted");
                Ok(ControlOutcome::Accepted)
            }
            Err(err) => Err(self.fail(Some(id), err)),
        }
    }

    // ==================== Helpers ====================

    async fn call(&self, command: &MissionCommand) -> std::result::Result<Value, BackendError> {
        let args = command.args()?;
        debug!(
            command = command.name(),
            mission_id = ?command.target().map(MissionId::as_str),
            "Sending command"
        );
        match tokio::time::timeout(self.config.command_timeout, self.channel.invoke(command.name(), args)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.config.command_timeout)),
        }
    }

    /// Fetch a mission that exists and carries a server-issued id.
    fn confirmed(&self, id: &MissionId) -> Result<Mission> {
        if id.is_local(&self.config.local_id_prefix) {
            return Err(SyncError::precondition(format!(
                "mission {} is not confirmed by the backend yet",
                id
            )));
        }
        self.registry
            .get(id)
            .map(|m| (*m).clone())
            .ok_or_else(|| SyncError::precondition(format!("mission {} not found", id)))
    }

    fn fail(&self, id: Option<&MissionId>, err: BackendError) -> SyncError {
        warn!(mission_id = ?id.map(|i| i.as_str()), error = %err, "Backend command failed");
        self.registry
            .set_notice(Notice::error(err.to_string(), id.cloned()));
        SyncError::Backend(err)
    }

    fn succeeded(&self) {
        if !self.config.clear_error_on_success {
            return;
        }
        let has_error = self
            .registry
            .snapshot()
            .notice()
            .is_some_and(|n| n.level == NoticeLevel::Error);
        if has_error {
            self.registry.dismiss_notice();
        }
    }
}

fn validate_input(input: &MissionInput) -> Result<()> {
    if input.title.trim().is_empty() {
        return Err(SyncError::precondition("title must not be empty"));
    }
    if input.prompt.trim().is_empty() {
        return Err(SyncError::precondition("prompt must not be empty"));
    }
    if input.backend_id.trim().is_empty() {
        return Err(SyncError::precondition("backendId must not be empty"));
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(command: &str, value: Value) -> std::result::Result<T, BackendError> {
    serde_json::from_value(value).map_err(|e| BackendError::Decode {
        command: command.to_string(),
        message: e.to_string(),
    })
}

/// Commands documented as returning nothing may still echo the mission back.
/// The echo only refreshes a mission that is still present.
fn optional_record(value: Value, id: &MissionId) -> Option<MissionRecord> {
    if !value.is_object() {
        return None;
    }
    serde_json::from_value::<MissionRecord>(value)
        .ok()
        .filter(|r| &r.id == id)
}

/// Put back the pre-update value of each patched field that still holds the
/// optimistic value. Fields the backend overwrote in the meantime stay.
fn revert_patched_fields(
    current: &mut Mission,
    previous: &Mission,
    optimistic: &Mission,
    patch: &MissionPatch,
) -> bool {
    fn revert<T: PartialEq + Clone>(slot: &mut T, previous: &T, optimistic: &T) -> bool {
        if slot == optimistic && slot != previous {
            *slot = previous.clone();
            true
        } else {
            false
        }
    }

    let mut changed = false;
    if patch.title.is_some() {
        changed |= revert(&mut current.title, &previous.title, &optimistic.title);
    }
    if patch.prompt.is_some() {
        changed |= revert(&mut current.prompt, &previous.prompt, &optimistic.prompt);
    }
    if patch.spec_ids.is_some() {
        changed |= revert(&mut current.spec_ids, &previous.spec_ids, &optimistic.spec_ids);
    }
    if patch.backend_id.is_some() {
        changed |= revert(&mut current.backend_id, &previous.backend_id, &optimistic.backend_id);
    }
    if patch.mode.is_some() {
        changed |= revert(&mut current.mode, &previous.mode, &optimistic.mode);
    }
    if patch.tags.is_some() {
        changed |= revert(&mut current.tags, &previous.tags, &optimistic.tags);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedChannel;
    use crate::backend::RawNotification;
    use crate::mission::fixtures::{input, mission};
    use crate::mission::ABORTED_ERROR_CODE;
    use crate::reconciler::EventReconciler;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn setup() -> (Arc<CommandExecutor>, Arc<ScriptedChannel>, MissionRegistry) {
        let registry = MissionRegistry::new();
        let channel = Arc::new(ScriptedChannel::new());
        let executor = Arc::new(CommandExecutor::new(
            registry.clone(),
            channel.clone(),
            SyncConfig::default(),
        ));
        (executor, channel, registry)
    }

    /// Wait until the registry publishes a snapshot satisfying `pred`.
    async fn wait_for(registry: &MissionRegistry, pred: impl Fn(&crate::registry::RegistrySnapshot) -> bool) {
        let mut rx = registry.subscribe();
        loop {
            if pred(&*registry.snapshot()) {
                return;
            }
            rx.changed().await.unwrap();
        }
    }

    fn backend_error() -> BackendError {
        BackendError::Rejected {
            command: "test".to_string(),
            message: "nope".to_string(),
        }
    }

    #[tokio::test]
    async fn create_is_optimistic_then_swaps_to_server_id() {
        let (executor, channel, registry) = setup();
        channel
            .respond_ok(
                "mission.create",
                json!({ "id": "srv-1", "state": "idle", "title": "T", "prompt": "P", "backendId": "b1", "mode": "agentic" }),
            )
            .await;
        let gate = channel.hold("mission.create").await;

        let exec = Arc::clone(&executor);
        let task = tokio::spawn(async move {
            exec.create(MissionInput {
                title: "T".to_string(),
                prompt: "P".to_string(),
                backend_id: "b1".to_string(),
                ..Default::default()
            })
            .await
        });

        wait_for(&registry, |s| s.len() == 1).await;
        let all = registry.all();
        assert_eq!(all.len(), 1);
        let optimistic = &all[0];
        assert!(optimistic.id.is_local("local-"));
        assert_eq!(optimistic.state(), MissionState::Idle);
        assert_eq!(optimistic.cost.total_cost, 0.0);
        let local_id = optimistic.id.clone();

        gate.send(()).unwrap();
        let created = task.await.unwrap().unwrap();
        assert_eq!(created.id.as_str(), "srv-1");
        assert!(registry.get(&MissionId::new("srv-1")).is_some());
        assert!(registry.get(&local_id).is_none());
        assert_eq!(registry.all().len(), 1);
        assert!(registry.pending_for(&MissionId::new("srv-1")).is_empty());
    }

    #[tokio::test]
    async fn failed_create_leaves_no_trace_and_sets_error_notice() {
        let (executor, channel, registry) = setup();
        channel.respond_err("mission.create", backend_error()).await;

        let err = executor.create(input("T")).await.unwrap_err();
        assert!(err.is_backend());
        assert!(registry.all().is_empty());
        assert!(registry.get(&MissionId::new("srv-1")).is_none());
        let snap = registry.snapshot();
        assert_eq!(snap.notice().map(|n| n.level), Some(NoticeLevel::Error));
    }

    #[tokio::test]
    async fn create_rejects_blank_input_without_round_trip() {
        let (executor, channel, registry) = setup();
        let mut blank = input("T");
        blank.prompt = "   ".to_string();
        let err = executor.create(blank).await.unwrap_err();
        assert!(matches!(err, SyncError::Precondition(_)));
        assert_eq!(channel.call_count("mission.create").await, 0);
        assert!(registry.all().is_empty());
    }

    #[tokio::test]
    async fn created_event_racing_the_response_yields_one_entity() {
        let (executor, channel, registry) = setup();
        let reconciler = EventReconciler::new(registry.clone());
        channel
            .respond_ok("mission.create", json!({ "id": "srv-1", "state": "idle", "title": "T" }))
            .await;
        let gate = channel.hold("mission.create").await;

        let exec = Arc::clone(&executor);
        let task = tokio::spawn(async move { exec.create(input("T")).await });
        wait_for(&registry, |s| s.len() == 1).await;

        reconciler
            .handle_raw(&RawNotification::new(
                "mission.created",
                json!({ "missionId": "srv-1", "mission": { "id": "srv-1", "state": "idle", "title": "T" } }),
            ))
            .unwrap();
        assert_eq!(registry.all().len(), 2);

        gate.send(()).unwrap();
        assert_ok!(task.await.unwrap());
        let all = registry.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id.as_str(), "srv-1");
    }

    #[tokio::test]
    async fn failed_update_restores_exact_snapshot() {
        let (executor, channel, registry) = setup();
        let m = mission("m1", MissionState::Running);
        registry.upsert(m.clone());
        let before = registry.get(&m.id).unwrap();
        channel.respond_err("mission.update", backend_error()).await;

        let patch = MissionPatch {
            title: Some("Renamed".to_string()),
            tags: Some(["urgent".to_string()].into_iter().collect()),
            ..Default::default()
        };
        assert_err!(executor.update(&m.id, patch).await);
        assert_eq!(registry.get(&m.id).unwrap(), before);
        assert!(!registry.has_pending(&m.id, PendingKind::Update));
    }

    #[tokio::test]
    async fn update_rollback_keeps_fields_the_backend_overwrote() {
        let (executor, channel, registry) = setup();
        let reconciler = EventReconciler::new(registry.clone());
        let m = mission("m1", MissionState::Running);
        registry.upsert(m.clone());
        channel.respond_err("mission.update", backend_error()).await;
        let gate = channel.hold("mission.update").await;

        let exec = Arc::clone(&executor);
        let id = m.id.clone();
        let task = tokio::spawn(async move {
            exec.update(
                &id,
                MissionPatch {
                    title: Some("Local title".to_string()),
                    prompt: Some("Local prompt".to_string()),
                    ..Default::default()
                },
            )
            .await
        });
        wait_for(&registry, |s| {
            s.get(&MissionId::new("m1")).is_some_and(|m| m.title == "Local title")
        })
        .await;

        reconciler
            .handle_raw(&RawNotification::new(
                "mission.updated",
                json!({ "missionId": "m1", "mission": { "title": "Backend title" } }),
            ))
            .unwrap();

        gate.send(()).unwrap();
        assert_err!(task.await.unwrap());

        let stored = registry.get(&m.id).unwrap();
        assert_eq!(stored.title, "Backend title");
        assert_eq!(stored.prompt, m.prompt);
    }

    #[tokio::test]
    async fn rollback_never_touches_unrelated_missions() {
        let (executor, channel, registry) = setup();
        registry.upsert(mission("a", MissionState::Running));
        registry.upsert(mission("b", MissionState::Paused));
        let b_before = registry.get(&MissionId::new("b")).unwrap();
        channel.respond_err("mission.update", backend_error()).await;
        channel.respond_err("mission.delete", backend_error()).await;

        let a = MissionId::new("a");
        assert_err!(
            executor
                .update(
                    &a,
                    MissionPatch {
                        title: Some("X".to_string()),
                        ..Default::default()
                    }
                )
                .await
        );
        assert_err!(executor.delete(&a).await);
        assert_eq!(registry.get(&MissionId::new("b")).unwrap(), b_before);
    }

    #[tokio::test]
    async fn failed_delete_restores_position_and_selection() {
        let (executor, channel, registry) = setup();
        for id in ["a", "b", "c"] {
            registry.upsert(mission(id, MissionState::Idle));
        }
        let b = MissionId::new("b");
        registry.select(&b).unwrap();
        channel.respond_err("mission.delete", backend_error()).await;

        assert_err!(executor.delete(&b).await);
        let ids: Vec<String> = registry.all().iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(registry.snapshot().selected_id(), Some(&b));
    }

    #[tokio::test]
    async fn successful_delete_clears_selection() {
        let (executor, _channel, registry) = setup();
        registry.upsert(mission("a", MissionState::Idle));
        let a = MissionId::new("a");
        registry.select(&a).unwrap();

        assert_ok!(executor.delete(&a).await);
        assert!(registry.get(&a).is_none());
        assert!(registry.snapshot().selected_id().is_none());
        assert!(!registry.has_pending(&a, PendingKind::Delete));
    }

    #[tokio::test]
    async fn second_update_while_pending_is_a_conflict() {
        let (executor, channel, registry) = setup();
        registry.upsert(mission("m1", MissionState::Idle));
        let gate = channel.hold("mission.update").await;

        let exec = Arc::clone(&executor);
        let task = tokio::spawn(async move {
            exec.update(
                &MissionId::new("m1"),
                MissionPatch {
                    title: Some("First".to_string()),
                    ..Default::default()
                },
            )
            .await
        });
        wait_for(&registry, |s| {
            s.get(&MissionId::new("m1")).is_some_and(|m| m.title == "First")
        })
        .await;

        let err = executor
            .update(
                &MissionId::new("m1"),
                MissionPatch {
                    title: Some("Second".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { kind: PendingKind::Update, .. }));

        gate.send(()).unwrap();
        assert_ok!(task.await.unwrap());
        assert_eq!(registry.get(&MissionId::new("m1")).unwrap().title, "First");
        assert_eq!(channel.call_count("mission.update").await, 1);
    }

    #[tokio::test]
    async fn start_on_finished_mission_fails_without_round_trip() {
        let (executor, channel, registry) = setup();
        registry.upsert(mission("m1", MissionState::Complete));

        let err = executor.start(&MissionId::new("m1")).await.unwrap_err();
        assert!(matches!(err, SyncError::Precondition(_)));
        assert!(channel.calls().await.is_empty());
    }

    #[tokio::test]
    async fn operations_on_local_ids_are_rejected() {
        let (executor, channel, registry) = setup();
        registry.upsert(mission("local-123", MissionState::Idle));
        let id = MissionId::new("local-123");

        assert!(matches!(executor.start(&id).await, Err(SyncError::Precondition(_))));
        assert!(matches!(executor.delete(&id).await, Err(SyncError::Precondition(_))));
        assert!(channel.calls().await.is_empty());
    }

    #[tokio::test]
    async fn failed_control_leaves_state_untouched() {
        let (executor, channel, registry) = setup();
        registry.upsert(mission("m1", MissionState::Running));
        channel.respond_err("mission.pause", backend_error()).await;

        let err = executor.pause(&MissionId::new("m1")).await.unwrap_err();
        assert!(err.is_backend());
        let stored = registry.get(&MissionId::new("m1")).unwrap();
        assert_eq!(stored.state(), MissionState::Running);
        assert_eq!(
            registry.snapshot().notice().map(|n| n.level),
            Some(NoticeLevel::Error)
        );
    }

    #[tokio::test]
    async fn successful_command_clears_error_notice() {
        let (executor, channel, registry) = setup();
        registry.upsert(mission("m1", MissionState::Running));
        channel.respond_err("mission.pause", backend_error()).await;
        assert_err!(executor.pause(&MissionId::new("m1")).await);
        assert!(registry.snapshot().notice().is_some());

        assert_eq!(
            executor.pause(&MissionId::new("m1")).await,
            Ok(ControlOutcome::Accepted)
        );
        assert!(registry.snapshot().notice().is_none());
        assert_eq!(
            registry.get(&MissionId::new("m1")).unwrap().state(),
            MissionState::Paused
        );
    }

    #[tokio::test]
    async fn late_backend_state_wins_over_confirmed_abort() {
        let (executor, _channel, registry) = setup();
        let reconciler = EventReconciler::new(registry.clone());
        registry.upsert(mission("m1", MissionState::Running));
        let id = MissionId::new("m1");

        assert_eq!(executor.abort(&id).await, Ok(ControlOutcome::Accepted));
        let aborted = registry.get(&id).unwrap();
        assert_eq!(aborted.state(), MissionState::Error);
        assert_eq!(
            aborted.error.as_ref().map(|e| e.code.as_str()),
            Some(ABORTED_ERROR_CODE)
        );

        reconciler
            .handle_raw(&RawNotification::new(
                "mission.state-changed",
                json!({ "missionId": "m1", "previousState": "running", "newState": "complete", "timestamp": "2026-05-01T12:00:00Z" }),
            ))
            .unwrap();
        let finished = registry.get(&id).unwrap();
        assert_eq!(finished.state(), MissionState::Complete);
        assert!(finished.error.is_none());
    }

    #[tokio::test]
    async fn backend_state_change_supersedes_in_flight_control() {
        let (executor, channel, registry) = setup();
        let reconciler = EventReconciler::new(registry.clone());
        registry.upsert(mission("m1", MissionState::Running));
        let gate = channel.hold("mission.abort").await;

        let exec = Arc::clone(&executor);
        let task = tokio::spawn(async move { exec.abort(&MissionId::new("m1")).await });
        let id = MissionId::new("m1");
        while !registry.has_pending(&id, PendingKind::Abort) {
            tokio::task::yield_now().await;
        }

        reconciler
            .handle_raw(&RawNotification::new(
                "mission.state-changed",
                json!({ "missionId": "m1", "newState": "complete" }),
            ))
            .unwrap();
        gate.send(()).unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ControlOutcome::Superseded {
                observed: MissionState::Complete
            }
        );
        assert_eq!(registry.get(&id).unwrap().state(), MissionState::Complete);
        assert_eq!(
            registry.snapshot().notice().map(|n| n.level),
            Some(NoticeLevel::Info)
        );
    }

    #[tokio::test]
    async fn timeout_is_a_backend_error_and_rolls_back() {
        let registry = MissionRegistry::new();
        let channel = Arc::new(ScriptedChannel::new());
        let config = SyncConfig {
            command_timeout: Duration::from_millis(20),
            ..SyncConfig::default()
        };
        let executor = CommandExecutor::new(registry.clone(), channel.clone(), config);
        let _gate = channel.hold("mission.create").await;

        let err = executor.create(input("T")).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::Backend(BackendError::Timeout(Duration::from_millis(20)))
        );
        assert!(registry.all().is_empty());
    }

    #[tokio::test]
    async fn restart_creates_new_mission_from_old_configuration() {
        let (executor, channel, registry) = setup();
        let mut old = mission("m1", MissionState::Error);
        old.tags.insert("nightly".to_string());
        registry.upsert(old.clone());
        channel
            .respond_ok("mission.create", json!({ "id": "m2", "state": "idle" }))
            .await;

        let restarted = executor.restart(&old.id).await.unwrap();
        assert_eq!(restarted.id.as_str(), "m2");
        assert_eq!(registry.all().len(), 2);
        assert_eq!(
            registry.get(&old.id).unwrap().state(),
            MissionState::Error
        );

        let calls = channel.calls().await;
        let (_, args) = calls
            .iter()
            .find(|(name, _)| name == "mission.create")
            .unwrap();
        assert_eq!(args["title"], json!(old.title));
        assert_eq!(args["tags"], json!(["nightly"]));
    }

    #[tokio::test]
    async fn restart_requires_terminal_state() {
        let (executor, _channel, registry) = setup();
        registry.upsert(mission("m1", MissionState::Running));
        assert!(matches!(
            executor.restart(&MissionId::new("m1")).await,
            Err(SyncError::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn refresh_hydrates_registry_and_applies_default_limit() {
        let (executor, channel, registry) = setup();
        channel
            .respond_ok(
                "mission.list",
                json!([
                    { "id": "m1", "state": "running", "title": "One" },
                    { "id": "m2", "state": "complete", "title": "Two" }
                ]),
            )
            .await;

        assert_eq!(executor.refresh(ListOptions::default()).await, Ok(2));
        assert_eq!(registry.all().len(), 2);
        let calls = channel.calls().await;
        assert_eq!(calls[0].1["limit"], json!(200));
    }

    #[tokio::test]
    async fn control_echo_does_not_resurrect_deleted_mission() {
        let (executor, channel, registry) = setup();
        let reconciler = EventReconciler::new(registry.clone());
        registry.upsert(mission("m1", MissionState::Running));
        channel
            .respond_ok("mission.pause", json!({ "id": "m1", "state": "paused", "title": "m1" }))
            .await;
        let gate = channel.hold("mission.pause").await;

        let exec = Arc::clone(&executor);
        let task = tokio::spawn(async move { exec.pause(&MissionId::new("m1")).await });
        let id = MissionId::new("m1");
        while !registry.has_pending(&id, PendingKind::Pause) {
            tokio::task::yield_now().await;
        }

        reconciler
            .handle_raw(&RawNotification::new("mission.deleted", json!({ "missionId": "m1" })))
            .unwrap();
        gate.send(()).unwrap();

        assert_ok!(task.await.unwrap());
        assert!(registry.get(&id).is_none());
        assert!(registry.all().is_empty());
    }

    #[tokio::test]
    async fn update_echo_does_not_resurrect_deleted_mission() {
        let (executor, channel, registry) = setup();
        let reconciler = EventReconciler::new(registry.clone());
        registry.upsert(mission("m1", MissionState::Idle));
        channel
            .respond_ok("mission.update", json!({ "id": "m1", "title": "Renamed" }))
            .await;
        let gate = channel.hold("mission.update").await;

        let exec = Arc::clone(&executor);
        let task = tokio::spawn(async move {
            exec.update(
                &MissionId::new("m1"),
                MissionPatch {
                    title: Some("Renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
        });
        let id = MissionId::new("m1");
        while !registry.has_pending(&id, PendingKind::Update) {
            tokio::task::yield_now().await;
        }

        reconciler
            .handle_raw(&RawNotification::new("mission.deleted", json!({ "missionId": "m1" })))
            .unwrap();
        gate.send(()).unwrap();

        assert_ok!(task.await.unwrap());
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn sparse_list_entries_keep_known_fields_and_repeat_as_no_op() {
        let (executor, channel, registry) = setup();
        let mut known = mission("m1", MissionState::Running);
        known.cost.total_cost = 2.0;
        known.progress.percentage = 40.0;
        registry.upsert(known.clone());
        let listing = json!([
            { "id": "m1", "state": "running" },
            { "id": "m2", "state": "idle", "title": "Two" }
        ]);
        channel.respond_ok("mission.list", listing.clone()).await;
        channel.respond_ok("mission.list", listing).await;

        assert_eq!(executor.refresh(ListOptions::default()).await, Ok(1));
        assert_eq!(*registry.get(&known.id).unwrap(), known);

        let version = registry.snapshot().version();
        assert_eq!(executor.refresh(ListOptions::default()).await, Ok(0));
        assert_eq!(registry.snapshot().version(), version);
    }

    #[tokio::test]
    async fn sparse_create_response_keeps_optimistic_fields() {
        let (executor, channel, registry) = setup();
        channel
            .respond_ok("mission.create", json!({ "id": "srv-9", "state": "idle" }))
            .await;

        let created = executor.create(input("Nightly")).await.unwrap();
        assert_eq!(created.id.as_str(), "srv-9");
        assert_eq!(created.title, "Nightly");
        assert_eq!(created.prompt, "Nightly prompt");
        assert_eq!(created.spec_ids, vec!["spec-1".to_string()]);
        assert_eq!(*registry.get(&created.id).unwrap(), created);
    }
}
