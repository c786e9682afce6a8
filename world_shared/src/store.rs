//! Entity state store.
//!
//! The single source of truth for live remote entities on each side:
//! authoritative on the server, replicated on each client. Keyed by session
//! id, so there is structurally at most one live entity per id. All mutation
//! happens on the owning event loop; no locking.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::net::{EntityRecord, SessionId};

/// A remote player as currently known to the observer.
#[derive(Debug, Clone)]
pub struct LiveEntity {
    pub record: EntityRecord,
    /// Last time any snapshot, sync, or update mentioned this id.
    pub last_update: Instant,
}

/// Monotonic counters exposed through the diagnostics interface.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct StoreCounters {
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    pub evicted_stale: u64,
    pub duplicates_suppressed: u64,
    pub remnants_destroyed: u64,
    pub unknown_updates_ignored: u64,
    pub creations_timed_out: u64,
}

/// Point-in-time view of one entity for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EntityDiag {
    pub record: EntityRecord,
    pub age_ms: u64,
}

/// Point-in-time view of the whole store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub entities: Vec<EntityDiag>,
    pub counters: StoreCounters,
}

/// Table of live entities keyed by session id.
#[derive(Default)]
pub struct EntityStore {
    entities: HashMap<SessionId, LiveEntity>,
    pub counters: StoreCounters,
}

impl EntityStore {
    pub fn contains(&self, id: SessionId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&LiveEntity> {
        self.entities.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.entities.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &LiveEntity)> {
        self.entities.iter()
    }

    /// Inserts a new entity. Returns false (and counts a suppressed
    /// duplicate) if the id is already live.
    pub fn insert(&mut self, record: EntityRecord, now: Instant) -> bool {
        let id = record.id;
        if self.entities.contains_key(&id) {
            self.counters.duplicates_suppressed += 1;
            return false;
        }
        self.entities.insert(
            id,
            LiveEntity {
                record,
                last_update: now,
            },
        );
        self.counters.added += 1;
        true
    }

    /// Overwrites an existing entity's fields and refreshes its timestamp.
    /// Returns false if the id is not live.
    pub fn update(&mut self, record: &EntityRecord, now: Instant) -> bool {
        match self.entities.get_mut(&record.id) {
            Some(ent) => {
                ent.record = record.clone();
                ent.last_update = now;
                self.counters.updated += 1;
                true
            }
            None => false,
        }
    }

    /// Refreshes an entity's last-seen timestamp without changing fields.
    pub fn touch(&mut self, id: SessionId, now: Instant) {
        if let Some(ent) = self.entities.get_mut(&id) {
            ent.last_update = now;
        }
    }

    pub fn remove(&mut self, id: SessionId) -> Option<LiveEntity> {
        let removed = self.entities.remove(&id);
        if removed.is_some() {
            self.counters.removed += 1;
        }
        removed
    }

    /// Removes every entity whose last update is older than `threshold` and
    /// returns the evicted ids.
    pub fn sweep_stale(&mut self, now: Instant, threshold: Duration) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .entities
            .iter()
            .filter(|(_, ent)| now.duration_since(ent.last_update) > threshold)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.entities.remove(id);
            self.counters.evicted_stale += 1;
        }
        stale
    }

    /// Removes everything. Returns the ids that were live.
    pub fn purge(&mut self) -> Vec<SessionId> {
        let ids: Vec<SessionId> = self.entities.keys().copied().collect();
        self.counters.removed += ids.len() as u64;
        self.entities.clear();
        ids
    }

    pub fn snapshot(&self, now: Instant) -> StoreSnapshot {
        let mut entities: Vec<EntityDiag> = self
            .entities
            .values()
            .map(|ent| EntityDiag {
                record: ent.record.clone(),
                age_ms: now.duration_since(ent.last_update).as_millis() as u64,
            })
            .collect();
        entities.sort_by_key(|d| d.record.id.0);
        StoreSnapshot {
            entities,
            counters: self.counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: u32) -> EntityRecord {
        EntityRecord::initial(SessionId(id))
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let mut store = EntityStore::default();
        let now = Instant::now();
        assert!(store.insert(rec(1), now));
        assert!(!store.insert(rec(1), now));
        assert_eq!(store.len(), 1);
        assert_eq!(store.counters.duplicates_suppressed, 1);
    }

    #[test]
    fn sweep_evicts_only_stale() {
        let mut store = EntityStore::default();
        let now = Instant::now();
        store.insert(rec(1), now);
        store.insert(rec(2), now);
        store.touch(SessionId(2), now + Duration::from_secs(4));

        let evicted = store.sweep_stale(now + Duration::from_secs(5), Duration::from_secs(3));
        assert_eq!(evicted, vec![SessionId(1)]);
        assert!(store.contains(SessionId(2)));
        assert_eq!(store.counters.evicted_stale, 1);
    }

    #[test]
    fn purge_empties_store() {
        let mut store = EntityStore::default();
        let now = Instant::now();
        store.insert(rec(1), now);
        store.insert(rec(2), now);
        let mut ids = store.purge();
        ids.sort_by_key(|id| id.0);
        assert_eq!(ids, vec![SessionId(1), SessionId(2)]);
        assert!(store.is_empty());
    }
}
