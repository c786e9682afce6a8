//! Entity reconciliation.
//!
//! Consumes raw entity snapshots and deltas from the transport and applies
//! add/update/remove transitions to the entity state store. The invariants
//! it defends:
//! - at most one live entity per id, never one for the observer's own id;
//! - applying the same list twice leaves the store unchanged;
//! - an entity missed by a removal notification is still evicted once its
//!   last update ages past the staleness threshold.
//!
//! Creation can suspend (fetching a visual representation), so an id is
//! marked pending while its spawn is in flight; the pending mark doubles as
//! the cooperative cancellation token for that spawn.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use async_trait::async_trait;
use world_shared::config::EngineConfig;
use world_shared::event::{EntityEvent, EventBus};
use world_shared::net::{EntityRecord, SessionId};
use world_shared::store::{EntityStore, StoreSnapshot};

/// Where an entity list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListSource {
    /// Full authoritative snapshot.
    Snapshot,
    /// Periodic corrective sync. Applied identically; kept for logging.
    Sync,
}

/// Render-layer probe used for duplicate suppression. Before creating an
/// entity, the engine asks whether a stale visual for that id is still in
/// the scene (a creation racing ahead of a removal) and destroys it first.
pub trait ScenePort {
    fn has_remnant(&self, id: SessionId) -> bool;
    fn destroy_remnant(&mut self, id: SessionId);
}

/// Headless scene: nothing to probe, nothing to destroy.
#[derive(Debug, Default)]
pub struct NoScene;

impl ScenePort for NoScene {
    fn has_remnant(&self, _id: SessionId) -> bool {
        false
    }
    fn destroy_remnant(&mut self, _id: SessionId) {}
}

/// Loader for a new entity's visual representation. Loading may suspend;
/// a failure falls back to a placeholder visual rather than blocking the
/// entity from existing.
#[async_trait]
pub trait AvatarSource: Send + Sync {
    async fn load(&self, record: &EntityRecord) -> anyhow::Result<()>;
}

/// An in-flight entity creation.
struct PendingSpawn {
    record: EntityRecord,
    deadline: Instant,
}

/// Diagnostics view over the reconciler, queryable from a console or test
/// harness.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcilerDiagnostics {
    pub store: StoreSnapshot,
    pub pending: Vec<SessionId>,
}

/// The reconciliation engine. Owns the replicated entity state store; the
/// only writer to it on the client side.
pub struct Reconciler {
    own_id: SessionId,
    store: EntityStore,
    pending: HashMap<SessionId, PendingSpawn>,
    /// Spawns registered since the last drain; the owner drives their loads.
    fresh_spawns: Vec<EntityRecord>,
    /// When false, creations complete inline (no visual fetch involved).
    deferred_spawn: bool,
    update_window: Duration,
    stale_after: Duration,
    creation_timeout: Duration,
}

impl Reconciler {
    pub fn new(own_id: SessionId, cfg: &EngineConfig) -> Self {
        Self {
            own_id,
            store: EntityStore::default(),
            pending: HashMap::new(),
            fresh_spawns: Vec::new(),
            deferred_spawn: false,
            update_window: Duration::from_millis(cfg.update_stale_ms),
            stale_after: Duration::from_secs_f32(cfg.entity_stale_secs),
            creation_timeout: Duration::from_secs(cfg.creation_timeout_secs),
        }
    }

    /// Defers creations behind an async visual load. The owner must drain
    /// [`Self::drain_pending_spawns`] and call [`Self::finish_creation`].
    pub fn with_deferred_spawn(mut self) -> Self {
        self.deferred_spawn = true;
        self
    }

    pub fn own_id(&self) -> SessionId {
        self.own_id
    }

    /// Rebinds the observer's own id (a reconnect gets a fresh session).
    /// Call only on an empty store, i.e. after a purge.
    pub fn set_own_id(&mut self, id: SessionId) {
        self.own_id = id;
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Adjusts the staleness threshold the next sweep uses.
    pub fn set_stale_after(&mut self, threshold: Duration) {
        self.stale_after = threshold;
    }

    /// Applies a full authoritative entity list: upserts every listed id,
    /// removes every stored id the list no longer mentions, and cancels
    /// pending spawns for vanished ids.
    pub fn apply_entity_list(
        &mut self,
        list: &[EntityRecord],
        source: ListSource,
        scene: &mut dyn ScenePort,
        bus: &mut EventBus,
        now: Instant,
    ) {
        let incoming: HashSet<SessionId> = list.iter().map(|r| r.id).collect();

        for record in list {
            if record.id == self.own_id {
                continue;
            }
            self.upsert(record, scene, bus, now);
        }

        for id in self.store.ids() {
            if !incoming.contains(&id) {
                if self.store.remove(id).is_some() {
                    debug!(?id, ?source, "absent from authoritative list, removed");
                    bus.push(EntityEvent::Removed(id));
                }
            }
        }

        let before = self.pending.len();
        self.pending.retain(|id, _| incoming.contains(id));
        if self.pending.len() != before {
            debug!(
                canceled = before - self.pending.len(),
                "pending creations canceled by authoritative list"
            );
        }
    }

    /// Applies a single forwarded update. A wholly unknown id (neither live
    /// nor being created) is logged and ignored: a partial update carries no
    /// identity/display data to create from, and the next snapshot will.
    pub fn apply_single_update(&mut self, record: &EntityRecord, bus: &mut EventBus, now: Instant) {
        if record.id == self.own_id {
            return;
        }
        if let Some(pending) = self.pending.get_mut(&record.id) {
            pending.record = record.clone();
            return;
        }
        if self.store.contains(record.id) {
            self.update_existing(record, bus, now);
        } else {
            debug!(id = ?record.id, "update for unknown entity ignored");
            self.store.counters.unknown_updates_ignored += 1;
        }
    }

    fn upsert(
        &mut self,
        record: &EntityRecord,
        scene: &mut dyn ScenePort,
        bus: &mut EventBus,
        now: Instant,
    ) {
        // Creation in flight: refresh what we know, touch nothing else.
        if let Some(pending) = self.pending.get_mut(&record.id) {
            pending.record = record.clone();
            return;
        }

        if self.store.contains(record.id) {
            self.update_existing(record, bus, now);
            return;
        }

        // Creation path. Three signals must all be clear: store membership
        // (checked above), the pending set (checked above), and a visible
        // remnant in the scene.
        if scene.has_remnant(record.id) {
            warn!(id = ?record.id, "remnant visual for unknown entity, destroying before create");
            scene.destroy_remnant(record.id);
            self.store.counters.remnants_destroyed += 1;
        }

        if self.deferred_spawn {
            self.pending.insert(
                record.id,
                PendingSpawn {
                    record: record.clone(),
                    deadline: now + self.creation_timeout,
                },
            );
            self.fresh_spawns.push(record.clone());
        } else if self.store.insert(record.clone(), now) {
            info!(id = ?record.id, "entity added");
            bus.push(EntityEvent::Added(record.clone()));
        }
    }

    fn update_existing(&mut self, record: &EntityRecord, bus: &mut EventBus, now: Instant) {
        let stale = self
            .store
            .get(record.id)
            .map(|ent| now.duration_since(ent.last_update) > self.update_window)
            .unwrap_or(false);
        let changed = self
            .store
            .get(record.id)
            .map(|ent| ent.record.differs_from(record))
            .unwrap_or(false);

        if changed || stale {
            self.store.update(record, now);
            bus.push(EntityEvent::Updated(record.clone()));
        } else {
            // Mention alone keeps the entity alive.
            self.store.touch(record.id, now);
        }
    }

    /// Spawns registered since the last call. The owner starts one visual
    /// load per record and reports back via `finish_creation`.
    pub fn drain_pending_spawns(&mut self) -> Vec<EntityRecord> {
        std::mem::take(&mut self.fresh_spawns)
    }

    /// Completes an in-flight creation. Returns false when the pending mark
    /// was already cleared (canceled or timed out) — the late completion is
    /// a no-op, which is what makes the mark a cancellation token.
    pub fn finish_creation(&mut self, id: SessionId, bus: &mut EventBus, now: Instant) -> bool {
        let Some(pending) = self.pending.remove(&id) else {
            debug!(?id, "creation finished after cancellation, ignored");
            return false;
        };
        if self.store.insert(pending.record.clone(), now) {
            info!(?id, "entity added");
            bus.push(EntityEvent::Added(pending.record));
            true
        } else {
            false
        }
    }

    /// Abandons an in-flight creation and clears any partial visual, so a
    /// later snapshot can retry cleanly.
    pub fn abort_creation(&mut self, id: SessionId, scene: &mut dyn ScenePort) {
        if self.pending.remove(&id).is_some() {
            warn!(?id, "creation aborted");
        }
        if scene.has_remnant(id) {
            scene.destroy_remnant(id);
            self.store.counters.remnants_destroyed += 1;
        }
    }

    /// Background sweep: expires overdue creations and evicts entities whose
    /// last update aged past the staleness threshold. Bounds how long a
    /// ghost survives a missed removal notification.
    pub fn sweep(&mut self, scene: &mut dyn ScenePort, bus: &mut EventBus, now: Instant) {
        let overdue: Vec<SessionId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in overdue {
            self.pending.remove(&id);
            self.store.counters.creations_timed_out += 1;
            warn!(?id, "creation timed out, clearing for retry");
            if scene.has_remnant(id) {
                scene.destroy_remnant(id);
                self.store.counters.remnants_destroyed += 1;
            }
        }

        for id in self.store.sweep_stale(now, self.stale_after) {
            info!(?id, "stale entity evicted");
            bus.push(EntityEvent::Removed(id));
        }
    }

    /// Removes every live entity and pending creation. Fail-safe on
    /// disconnection so no ghost outlives a dead session.
    pub fn purge(&mut self, bus: &mut EventBus) {
        self.pending.clear();
        self.fresh_spawns.clear();
        for id in self.store.purge() {
            bus.push(EntityEvent::Removed(id));
        }
    }

    pub fn diagnostics(&self, now: Instant) -> ReconcilerDiagnostics {
        let mut pending: Vec<SessionId> = self.pending.keys().copied().collect();
        pending.sort_by_key(|id| id.0);
        ReconcilerDiagnostics {
            store: self.store.snapshot(now),
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use world_shared::math::Vec3;

    const SELF_ID: SessionId = SessionId(1);

    fn reconciler() -> Reconciler {
        Reconciler::new(SELF_ID, &EngineConfig::default())
    }

    fn rec(id: u32) -> EntityRecord {
        EntityRecord::initial(SessionId(id))
    }

    fn rec_at(id: u32, x: f32) -> EntityRecord {
        let mut r = rec(id);
        r.position = Vec3::new(x, 0.0, 0.0);
        r
    }

    /// Scene mock tracking remnants and destructions.
    #[derive(Default)]
    struct MockScene {
        remnants: HashSet<SessionId>,
        destroyed: Vec<SessionId>,
    }

    impl ScenePort for MockScene {
        fn has_remnant(&self, id: SessionId) -> bool {
            self.remnants.contains(&id)
        }
        fn destroy_remnant(&mut self, id: SessionId) {
            self.remnants.remove(&id);
            self.destroyed.push(id);
        }
    }

    #[test]
    fn repeated_list_is_idempotent() {
        let mut rc = reconciler();
        let mut scene = NoScene;
        let mut bus = EventBus::default();
        let now = Instant::now();
        let list = vec![rec(2), rec(3)];

        rc.apply_entity_list(&list, ListSource::Snapshot, &mut scene, &mut bus, now);
        rc.apply_entity_list(&list, ListSource::Snapshot, &mut scene, &mut bus, now);

        assert_eq!(rc.store().len(), 2);
        assert_eq!(rc.store().counters.added, 2);
        let added = bus
            .drain::<EntityEvent>()
            .into_iter()
            .filter(|e| matches!(e, EntityEvent::Added(_)))
            .count();
        assert_eq!(added, 2);
    }

    #[test]
    fn never_models_own_session() {
        let mut rc = reconciler();
        let mut scene = NoScene;
        let mut bus = EventBus::default();
        let now = Instant::now();

        rc.apply_entity_list(
            &[rec(1), rec(2)],
            ListSource::Snapshot,
            &mut scene,
            &mut bus,
            now,
        );
        assert!(!rc.store().contains(SELF_ID));
        assert!(rc.store().contains(SessionId(2)));
    }

    #[test]
    fn absent_id_is_removed() {
        let mut rc = reconciler();
        let mut scene = NoScene;
        let mut bus = EventBus::default();
        let now = Instant::now();

        rc.apply_entity_list(
            &[rec(2), rec(3)],
            ListSource::Snapshot,
            &mut scene,
            &mut bus,
            now,
        );
        bus.drain::<EntityEvent>();

        rc.apply_entity_list(&[rec(2)], ListSource::Sync, &mut scene, &mut bus, now);
        assert!(!rc.store().contains(SessionId(3)));
        assert_eq!(
            bus.drain::<EntityEvent>(),
            vec![EntityEvent::Removed(SessionId(3))]
        );
    }

    #[test]
    fn unchanged_record_touches_without_update_event() {
        let mut rc = reconciler();
        let mut scene = NoScene;
        let mut bus = EventBus::default();
        let t0 = Instant::now();

        rc.apply_entity_list(&[rec_at(2, 1.0)], ListSource::Snapshot, &mut scene, &mut bus, t0);
        bus.drain::<EntityEvent>();

        // Same transform half a second later: refresh only.
        let t1 = t0 + Duration::from_millis(500);
        rc.apply_entity_list(&[rec_at(2, 1.0)], ListSource::Sync, &mut scene, &mut bus, t1);
        assert_eq!(bus.pending::<EntityEvent>(), 0);

        // The touch kept it alive past what would otherwise be stale.
        rc.sweep(&mut scene, &mut bus, t1 + Duration::from_secs(4));
        assert!(rc.store().contains(SessionId(2)));
    }

    #[test]
    fn moved_record_emits_update() {
        let mut rc = reconciler();
        let mut scene = NoScene;
        let mut bus = EventBus::default();
        let now = Instant::now();

        rc.apply_entity_list(&[rec_at(2, 0.0)], ListSource::Snapshot, &mut scene, &mut bus, now);
        bus.drain::<EntityEvent>();

        rc.apply_single_update(&rec_at(2, 1.0), &mut bus, now);
        let events = bus.drain::<EntityEvent>();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], EntityEvent::Updated(ref r) if r.position.x == 1.0));
    }

    #[test]
    fn unknown_single_update_ignored() {
        let mut rc = reconciler();
        let mut bus = EventBus::default();
        let now = Instant::now();

        rc.apply_single_update(&rec(9), &mut bus, now);
        assert!(rc.store().is_empty());
        assert_eq!(rc.store().counters.unknown_updates_ignored, 1);
        assert_eq!(bus.pending::<EntityEvent>(), 0);
    }

    #[test]
    fn remnant_destroyed_before_creation() {
        let mut rc = reconciler();
        let mut bus = EventBus::default();
        let now = Instant::now();
        let mut scene = MockScene::default();
        scene.remnants.insert(SessionId(2));

        rc.apply_entity_list(&[rec(2)], ListSource::Snapshot, &mut scene, &mut bus, now);

        assert_eq!(scene.destroyed, vec![SessionId(2)]);
        assert!(rc.store().contains(SessionId(2)));
        assert_eq!(rc.store().counters.remnants_destroyed, 1);
    }

    #[test]
    fn deferred_creation_lands_once() {
        let mut rc = reconciler().with_deferred_spawn();
        let mut scene = NoScene;
        let mut bus = EventBus::default();
        let now = Instant::now();

        rc.apply_entity_list(&[rec(2)], ListSource::Snapshot, &mut scene, &mut bus, now);
        assert!(rc.store().is_empty());
        assert_eq!(rc.drain_pending_spawns().len(), 1);

        // Another list during the window refreshes, spawns nothing new.
        rc.apply_entity_list(&[rec_at(2, 5.0)], ListSource::Sync, &mut scene, &mut bus, now);
        assert!(rc.drain_pending_spawns().is_empty());

        assert!(rc.finish_creation(SessionId(2), &mut bus, now));
        assert!(!rc.finish_creation(SessionId(2), &mut bus, now));
        assert_eq!(rc.store().len(), 1);
        // The entity landed with the refreshed transform.
        assert_eq!(
            rc.store().get(SessionId(2)).unwrap().record.position.x,
            5.0
        );
        let added = bus
            .drain::<EntityEvent>()
            .into_iter()
            .filter(|e| matches!(e, EntityEvent::Added(_)))
            .count();
        assert_eq!(added, 1);
    }

    #[test]
    fn creation_timeout_clears_pending() {
        let mut rc = reconciler().with_deferred_spawn();
        let mut bus = EventBus::default();
        let t0 = Instant::now();
        let mut scene = MockScene::default();

        rc.apply_entity_list(&[rec(2)], ListSource::Snapshot, &mut scene, &mut bus, t0);
        // Partial visual appeared, then the load stalled.
        scene.remnants.insert(SessionId(2));

        rc.sweep(&mut scene, &mut bus, t0 + Duration::from_secs(9));
        assert_eq!(rc.store().counters.creations_timed_out, 1);
        assert_eq!(scene.destroyed, vec![SessionId(2)]);

        // Late completion is a no-op.
        assert!(!rc.finish_creation(SessionId(2), &mut bus, t0 + Duration::from_secs(10)));

        // A later snapshot retries cleanly.
        rc.apply_entity_list(
            &[rec(2)],
            ListSource::Snapshot,
            &mut scene,
            &mut bus,
            t0 + Duration::from_secs(10),
        );
        assert_eq!(rc.drain_pending_spawns().len(), 2);
    }

    #[test]
    fn vanished_pending_spawn_is_canceled() {
        let mut rc = reconciler().with_deferred_spawn();
        let mut scene = NoScene;
        let mut bus = EventBus::default();
        let now = Instant::now();

        rc.apply_entity_list(&[rec(2)], ListSource::Snapshot, &mut scene, &mut bus, now);
        rc.drain_pending_spawns();

        // Authoritative list no longer mentions the id.
        rc.apply_entity_list(&[], ListSource::Snapshot, &mut scene, &mut bus, now);
        assert!(!rc.finish_creation(SessionId(2), &mut bus, now));
        assert!(rc.store().is_empty());
    }

    #[test]
    fn stale_entity_evicted_by_sweep() {
        let mut rc = reconciler();
        let mut scene = NoScene;
        let mut bus = EventBus::default();
        let t0 = Instant::now();

        rc.apply_entity_list(&[rec(2)], ListSource::Snapshot, &mut scene, &mut bus, t0);
        bus.drain::<EntityEvent>();

        rc.sweep(&mut scene, &mut bus, t0 + Duration::from_secs(6));
        assert!(rc.store().is_empty());
        assert_eq!(rc.store().counters.evicted_stale, 1);
        assert_eq!(
            bus.drain::<EntityEvent>(),
            vec![EntityEvent::Removed(SessionId(2))]
        );
    }

    #[test]
    fn purge_clears_everything() {
        let mut rc = reconciler();
        let mut scene = NoScene;
        let mut bus = EventBus::default();
        let now = Instant::now();

        rc.apply_entity_list(&[rec(2), rec(3)], ListSource::Snapshot, &mut scene, &mut bus, now);
        bus.drain::<EntityEvent>();

        rc.purge(&mut bus);
        assert!(rc.store().is_empty());
        assert_eq!(bus.drain::<EntityEvent>().len(), 2);
    }
}
