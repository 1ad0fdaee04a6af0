use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::group::GroupSnapshot;

/// Processing counters, updated by the engine task
#[derive(Default)]
pub struct Metrics {
    pub events: AtomicU64,
    pub timer_fires: AtomicU64,
    /// Fires dropped because their timer was cancelled or re-armed meanwhile
    pub stale_timer_fires: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events: u64,
    pub timer_fires: u64,
    pub stale_timer_fires: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            timer_fires: self.timer_fires.load(Ordering::Relaxed),
            stale_timer_fires: self.stale_timer_fires.load(Ordering::Relaxed),
        }
    }
}

/// Latest snapshot of every group. Written only by the engine, read by the API.
#[derive(Default)]
pub struct GroupStates {
    groups: DashMap<String, GroupSnapshot>,
    pub metrics: Metrics,
}

impl GroupStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// All group snapshots, ordered by id
    pub fn get_all(&self) -> Vec<GroupSnapshot> {
        let mut all: Vec<GroupSnapshot> = self
            .groups
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn get(&self, group_id: &str) -> Option<GroupSnapshot> {
        self.groups.get(group_id).map(|entry| entry.value().clone())
    }

    pub fn set(&self, snapshot: GroupSnapshot) {
        self.groups.insert(snapshot.id.clone(), snapshot);
    }

    /// Number of groups currently tracked
    pub fn len(&self) -> usize {
        self.groups.len()
    }
}
