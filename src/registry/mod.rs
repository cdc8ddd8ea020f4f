//! Mission registry: the single source of truth for the UI.
//!
//! State lives in an immutable [`RegistrySnapshot`] behind an `Arc`. Each
//! effective mutation builds the next snapshot, bumps its version, and
//! publishes it on a `watch` channel before returning, so subscribers never
//! see a half-applied change and handed-out snapshots never change under them.

mod pending;

pub use pending::{PendingKind, PendingOperation, PendingState};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::error::SyncError;
use crate::mission::{Mission, MissionId, MissionRecord, MissionState};
use pending::PendingLedger;

/// Severity of the transient notice shown by the notification UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Process-wide transient notice (at most one at a time).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<MissionId>,
    pub at: DateTime<Utc>,
}

impl Notice {
    pub fn error(message: impl Into<String>, mission_id: Option<MissionId>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
            mission_id,
            at: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>, mission_id: Option<MissionId>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
            mission_id,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    mission: Arc<Mission>,
}

/// Immutable view of the registry at one version.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    registry_id: u64,
    version: u64,
    next_seq: u64,
    entries: HashMap<MissionId, Entry>,
    selected: Option<MissionId>,
    notice: Option<Notice>,
}

impl RegistrySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Identity of the registry that published this snapshot. Versions are
    /// only comparable between snapshots with the same registry id.
    pub fn registry_id(&self) -> u64 {
        self.registry_id
    }

    pub fn get(&self, id: &MissionId) -> Option<Arc<Mission>> {
        self.entries.get(id).map(|e| Arc::clone(&e.mission))
    }

    pub fn contains(&self, id: &MissionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Missions in insertion order.
    pub fn all(&self) -> Vec<Arc<Mission>> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| Arc::clone(&e.mission)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn selected_id(&self) -> Option<&MissionId> {
        self.selected.as_ref()
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    /// Insertion position, used as the stable sort tie-break.
    pub fn position(&self, id: &MissionId) -> Option<u64> {
        self.entries.get(id).map(|e| e.seq)
    }

    fn insert_new(&mut self, mission: Mission) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            mission.id.clone(),
            Entry {
                seq,
                mission: Arc::new(mission),
            },
        );
    }
}

/// Merge a backend record into a stored entry. A record without its own
/// `updatedAt` advances the entry to `now` when it changes anything.
fn merge_into(entry: &mut Entry, record: &MissionRecord, now: DateTime<Utc>) -> bool {
    let mut merged = (*entry.mission).clone();
    if !merged.merge_record(record) {
        return false;
    }
    if record.updated_at.is_none() {
        merged.touch(now);
    }
    entry.mission = Arc::new(merged);
    true
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// A mission taken out by [`MissionRegistry::remove`], with enough context to put it back.
#[derive(Debug, Clone)]
pub struct RemovedMission {
    pub mission: Arc<Mission>,
    position: u64,
    was_selected: bool,
}

struct RegistryState {
    snapshot: Arc<RegistrySnapshot>,
    pending: PendingLedger,
}

/// Shared handle to the registry. Clones refer to the same registry.
#[derive(Clone)]
pub struct MissionRegistry {
    state: Arc<RwLock<RegistryState>>,
    snapshots: Arc<watch::Sender<Arc<RegistrySnapshot>>>,
}

impl MissionRegistry {
    pub fn new() -> Self {
        let snapshot = Arc::new(RegistrySnapshot {
            registry_id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            ..RegistrySnapshot::default()
        });
        let (tx, _rx) = watch::channel(Arc::clone(&snapshot));
        Self {
            state: Arc::new(RwLock::new(RegistryState {
                snapshot,
                pending: PendingLedger::default(),
            })),
            snapshots: Arc::new(tx),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&state.snapshot)
    }

    /// Receive every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn get(&self, id: &MissionId) -> Option<Arc<Mission>> {
        self.snapshot().get(id)
    }

    pub fn all(&self) -> Vec<Arc<Mission>> {
        self.snapshot().all()
    }

    /// Run `op` against a draft of the next snapshot. The draft is published
    /// only if `op` reports a change.
    fn mutate<R>(
        &self,
        op: impl FnOnce(&mut RegistrySnapshot, &mut PendingLedger) -> (R, bool),
    ) -> R {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut draft = (*state.snapshot).clone();
        let (result, changed) = op(&mut draft, &mut state.pending);
        if changed {
            draft.version += 1;
            let next = Arc::new(draft);
            state.snapshot = Arc::clone(&next);
            self.snapshots.send_replace(next);
        }
        result
    }

    fn pending<R>(&self, op: impl FnOnce(&mut PendingLedger) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        op(&mut state.pending)
    }

    /// Insert a mission, or merge it into the existing entry with the same id.
    ///
    /// Merging keeps checkpoints append-only and `updated_at` monotonic.
    /// Returns whether the registry changed.
    pub fn upsert(&self, mission: Mission) -> bool {
        self.mutate(|snap, _| {
            let changed = match snap.entries.get_mut(&mission.id) {
                Some(entry) => {
                    let mut merged = (*entry.mission).clone();
                    let changed = merged.merge_authoritative(&mission);
                    if changed {
                        entry.mission = Arc::new(merged);
                    }
                    changed
                }
                None => {
                    snap.insert_new(mission);
                    true
                }
            };
            (changed, changed)
        })
    }

    /// Insert or merge a backend record. Fields absent from the record keep
    /// their stored values, so redelivering a record changes nothing.
    pub fn upsert_record(&self, record: MissionRecord) -> bool {
        self.mutate(|snap, _| {
            let now = Utc::now();
            let changed = match snap.entries.get_mut(&record.id) {
                Some(entry) => merge_into(entry, &record, now),
                None => {
                    snap.insert_new(record.into_mission(now));
                    true
                }
            };
            (changed, changed)
        })
    }

    /// Merge a backend record only if the mission is still present.
    ///
    /// Returns `None` if the mission is absent; nothing is inserted.
    pub fn merge_existing(&self, record: &MissionRecord) -> Option<bool> {
        self.mutate(|snap, _| match snap.entries.get_mut(&record.id) {
            Some(entry) => {
                let changed = merge_into(entry, record, Utc::now());
                (Some(changed), changed)
            }
            None => (None, false),
        })
    }

    /// Mutate a mission in place. `op` returns whether it changed anything;
    /// if so `updated_at` advances to now.
    ///
    /// Returns `None` if the mission is absent.
    pub fn update_with(&self, id: &MissionId, op: impl FnOnce(&mut Mission) -> bool) -> Option<bool> {
        self.rewrite(id, |mission| {
            let changed = op(mission);
            if changed {
                mission.touch(Utc::now());
            }
            changed
        })
    }

    /// Like [`Self::update_with`] but leaves `updated_at` to `op`. Used to
    /// restore an exact pre-mutation snapshot on rollback.
    pub(crate) fn rewrite(&self, id: &MissionId, op: impl FnOnce(&mut Mission) -> bool) -> Option<bool> {
        self.mutate(|snap, _| {
            let Some(entry) = snap.entries.get_mut(id) else {
                return (None, false);
            };
            let mut next = (*entry.mission).clone();
            let changed = op(&mut next);
            if changed {
                next.id = id.clone();
                entry.mission = Arc::new(next);
            }
            (Some(changed), changed)
        })
    }

    /// Remove a mission. Clears the selection if it pointed at it.
    pub fn remove(&self, id: &MissionId) -> Option<RemovedMission> {
        self.mutate(|snap, _| {
            let Some(entry) = snap.entries.remove(id) else {
                return (None, false);
            };
            let was_selected = snap.selected.as_ref() == Some(id);
            if was_selected {
                snap.selected = None;
            }
            let removed = RemovedMission {
                mission: entry.mission,
                position: entry.seq,
                was_selected,
            };
            (Some(removed), true)
        })
    }

    /// Put a removed mission back at its original position.
    ///
    /// If the id reappeared meanwhile, the restored copy is merged into it.
    pub fn restore(&self, removed: RemovedMission) {
        self.mutate(|snap, _| {
            let id = removed.mission.id.clone();
            match snap.entries.get_mut(&id) {
                Some(entry) => {
                    let mut merged = (*entry.mission).clone();
                    merged.merge_authoritative(&removed.mission);
                    entry.mission = Arc::new(merged);
                    entry.seq = entry.seq.min(removed.position);
                }
                None => {
                    snap.entries.insert(
                        id.clone(),
                        Entry {
                            seq: removed.position,
                            mission: removed.mission,
                        },
                    );
                }
            }
            if removed.was_selected && snap.selected.is_none() {
                snap.selected = Some(id);
            }
            ((), true)
        })
    }

    /// Atomically swap a local id for the server-issued identity.
    ///
    /// The confirmed entry takes the local entry's position and keeps its
    /// optimistic values for fields the record does not carry. Selection and
    /// pending records follow the new id. If the server id is already present
    /// the two entries collapse into one.
    pub fn replace_id(&self, old: &MissionId, confirmed: MissionRecord) -> bool {
        self.mutate(|snap, pending| {
            let now = Utc::now();
            let new_id = confirmed.id.clone();
            pending.rekey(old, &new_id);
            let Some(old_entry) = snap.entries.remove(old) else {
                debug!(old = %old, new = %new_id, "local mission vanished before confirmation");
                let changed = match snap.entries.get_mut(&new_id) {
                    Some(existing) => merge_into(existing, &confirmed, now),
                    None => {
                        snap.insert_new(confirmed.into_mission(now));
                        true
                    }
                };
                return (false, changed);
            };
            match snap.entries.get_mut(&new_id) {
                Some(existing) => {
                    merge_into(existing, &confirmed, now);
                    existing.seq = existing.seq.min(old_entry.seq);
                }
                None => {
                    let mut mission = (*old_entry.mission).clone();
                    mission.id = new_id.clone();
                    mission.merge_record(&confirmed);
                    snap.entries.insert(
                        new_id.clone(),
                        Entry {
                            seq: old_entry.seq,
                            mission: Arc::new(mission),
                        },
                    );
                }
            }
            if snap.selected.as_ref() == Some(old) {
                snap.selected = Some(new_id.clone());
            }
            (true, true)
        })
    }

    pub fn select(&self, id: &MissionId) -> Result<(), SyncError> {
        self.mutate(|snap, _| {
            if !snap.entries.contains_key(id) {
                return (
                    Err(SyncError::precondition(format!("mission {} not found", id))),
                    false,
                );
            }
            if snap.selected.as_ref() == Some(id) {
                return (Ok(()), false);
            }
            snap.selected = Some(id.clone());
            (Ok(()), true)
        })
    }

    pub fn clear_selection(&self) {
        self.mutate(|snap, _| ((), snap.selected.take().is_some()))
    }

    pub fn set_notice(&self, notice: Notice) {
        self.mutate(|snap, _| {
            snap.notice = Some(notice);
            ((), true)
        })
    }

    /// Clear the transient notice. Returns whether one was present.
    pub fn dismiss_notice(&self) -> bool {
        self.mutate(|snap, _| {
            let had = snap.notice.take().is_some();
            (had, had)
        })
    }

    /// Record an in-flight optimistic operation.
    ///
    /// # Errors
    ///
    /// `SyncError::Conflict` if the same kind is already in flight for `id`.
    pub fn track_pending(&self, id: &MissionId, kind: PendingKind) -> Result<(), SyncError> {
        if self.pending(|ledger| ledger.track(id, kind, Utc::now())) {
            Ok(())
        } else {
            Err(SyncError::Conflict {
                id: id.clone(),
                kind,
            })
        }
    }

    pub fn clear_pending(&self, id: &MissionId, kind: PendingKind) -> Option<PendingOperation> {
        self.pending(|ledger| ledger.clear(id, kind))
    }

    pub fn pending_op(&self, id: &MissionId, kind: PendingKind) -> Option<PendingOperation> {
        self.pending(|ledger| ledger.get(id, kind).cloned())
    }

    pub fn has_pending(&self, id: &MissionId, kind: PendingKind) -> bool {
        self.pending(|ledger| ledger.get(id, kind).is_some())
    }

    /// All in-flight operations targeting `id`, oldest first.
    pub fn pending_for(&self, id: &MissionId) -> Vec<PendingOperation> {
        self.pending(|ledger| ledger.for_mission(id))
    }

    pub(crate) fn supersede_controls(&self, id: &MissionId, observed: MissionState) -> Vec<PendingKind> {
        self.pending(|ledger| ledger.supersede_controls(id, observed))
    }

    pub(crate) fn forget_pending(&self, id: &MissionId) -> usize {
        self.pending(|ledger| ledger.forget(id))
    }
}

impl Default for MissionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
