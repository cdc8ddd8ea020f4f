//! Read-only projections over registry snapshots.
//!
//! Nothing here mutates the registry. [`MissionListView`] caches its output
//! and recomputes only when its own parameters change or it is handed a
//! snapshot with another version or from another registry.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::mission::{Mission, MissionState};
use crate::registry::RegistrySnapshot;

/// Filter predicate. Empty or absent criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MissionFilter {
    pub states: BTreeSet<MissionState>,
    /// Matches missions sharing at least one tag.
    pub tags: BTreeSet<String>,
    /// Case-insensitive substring of title or prompt.
    pub text: Option<String>,
    pub backend_id: Option<String>,
}

impl MissionFilter {
    pub fn matches(&self, mission: &Mission) -> bool {
        if !self.states.is_empty() && !self.states.contains(&mission.state()) {
            return false;
        }
        if !self.tags.is_empty() && self.tags.is_disjoint(&mission.tags) {
            return false;
        }
        if let Some(backend_id) = &self.backend_id {
            if &mission.backend_id != backend_id {
                return false;
            }
        }
        if let Some(text) = self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let needle = text.to_lowercase();
            if !mission.title.to_lowercase().contains(&needle)
                && !mission.prompt.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    UpdatedAt,
    Title,
    State,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl SortOrder {
    pub fn new(key: SortKey, direction: SortDirection) -> Self {
        Self { key, direction }
    }

    fn compare(&self, a: &Mission, b: &Mission) -> Ordering {
        let ordering = match self.key {
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
            SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortKey::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
            SortKey::State => a.state().cmp(&b.state()),
        };
        match self.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

/// Filter and sort the missions of a snapshot. Equal keys keep insertion order
/// regardless of direction.
pub fn filter_missions(
    snapshot: &RegistrySnapshot,
    filter: &MissionFilter,
    order: SortOrder,
) -> Vec<Arc<Mission>> {
    // `all()` is already in insertion order and `sort_by` is stable.
    let mut missions: Vec<Arc<Mission>> = snapshot
        .all()
        .into_iter()
        .filter(|m| filter.matches(m))
        .collect();
    missions.sort_by(|a, b| order.compare(a, b));
    missions
}

/// Aggregate figures over every mission in the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionStats {
    pub counts: BTreeMap<MissionState, usize>,
    pub total_cost: f64,
    /// Running plus paused.
    pub active_count: usize,
    pub total: usize,
}

impl MissionStats {
    pub fn compute(snapshot: &RegistrySnapshot) -> Self {
        let mut counts: BTreeMap<MissionState, usize> =
            MissionState::ALL.iter().map(|s| (*s, 0)).collect();
        let mut total_cost = 0.0;
        let mut active_count = 0;
        let missions = snapshot.all();
        for mission in &missions {
            *counts.entry(mission.state()).or_default() += 1;
            total_cost += mission.cost.total_cost;
            if mission.state().is_active() {
                active_count += 1;
            }
        }
        Self {
            counts,
            total_cost,
            active_count,
            total: missions.len(),
        }
    }

    pub fn count(&self, state: MissionState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

/// The selected mission, if the selection resolves to a present entity.
pub fn selected_mission(snapshot: &RegistrySnapshot) -> Option<Arc<Mission>> {
    snapshot.selected_id().and_then(|id| snapshot.get(id))
}

struct Computed {
    registry_id: u64,
    version: u64,
    missions: Vec<Arc<Mission>>,
    stats: MissionStats,
}

/// Cached list projection for one presentation component.
#[derive(Default)]
pub struct MissionListView {
    filter: MissionFilter,
    order: SortOrder,
    computed: Option<Computed>,
    recomputations: u64,
}

impl MissionListView {
    pub fn new(filter: MissionFilter, order: SortOrder) -> Self {
        Self {
            filter,
            order,
            computed: None,
            recomputations: 0,
        }
    }

    pub fn filter(&self) -> &MissionFilter {
        &self.filter
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    pub fn set_filter(&mut self, filter: MissionFilter) {
        if filter != self.filter {
            self.filter = filter;
            self.computed = None;
        }
    }

    pub fn set_order(&mut self, order: SortOrder) {
        if order != self.order {
            self.order = order;
            self.computed = None;
        }
    }

    pub fn missions(&mut self, snapshot: &RegistrySnapshot) -> &[Arc<Mission>] {
        &self.refresh(snapshot).missions
    }

    pub fn stats(&mut self, snapshot: &RegistrySnapshot) -> &MissionStats {
        &self.refresh(snapshot).stats
    }

    /// How many times the projection was rebuilt.
    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }

    fn refresh(&mut self, snapshot: &RegistrySnapshot) -> &Computed {
        if self
            .computed
            .as_ref()
            .is_some_and(|c| {
                c.registry_id != snapshot.registry_id() || c.version != snapshot.version()
            })
        {
            self.computed = None;
        }
        let filter = &self.filter;
        let order = self.order;
        let recomputations = &mut self.recomputations;
        self.computed.get_or_insert_with(|| {
            *recomputations += 1;
            Computed {
                registry_id: snapshot.registry_id(),
                version: snapshot.version(),
                missions: filter_missions(snapshot, filter, order),
                stats: MissionStats::compute(snapshot),
            }
        })
    }
}
