//! Interpolation.
//!
//! Remote entities arrive as discrete target transforms at network rate.
//! The client renders at its own rate and eases each displayed transform
//! toward its latest target with a recency-weighted smoothing factor: the
//! fresher the target, the harder we chase it. Stale targets are skipped
//! entirely rather than animated toward.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use world_shared::config::EngineConfig;
use world_shared::math::{Orientation, Vec3};
use world_shared::net::SessionId;

/// Target ages below this chase at the aggressive tier.
const FRESH_AGE: Duration = Duration::from_millis(100);
/// Target ages below this chase at the medium tier.
const RECENT_AGE: Duration = Duration::from_millis(300);

/// Fraction of the remaining distance covered per 60 Hz tick, by tier.
const FACTOR_FRESH: f32 = 0.8;
const FACTOR_RECENT: f32 = 0.6;
const FACTOR_OLD: f32 = 0.4;

/// One entity's displayed transform and the target it is chasing.
#[derive(Debug, Clone)]
pub struct InterpState {
    pub displayed_pos: Vec3,
    pub displayed_orient: Orientation,
    target_pos: Vec3,
    target_orient: Orientation,
    refreshed: Instant,
}

/// Per-entity interpolation driven once per render tick.
pub struct Interpolator {
    states: HashMap<SessionId, InterpState>,
    target_stale: Duration,
    teleport_distance: f32,
}

impl Interpolator {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            states: HashMap::new(),
            target_stale: Duration::from_millis(cfg.target_stale_ms),
            teleport_distance: cfg.teleport_distance,
        }
    }

    /// Sets the latest authoritative transform for an entity. A first-seen
    /// entity starts displayed exactly at its target.
    pub fn set_target(&mut self, id: SessionId, pos: Vec3, orient: Orientation, now: Instant) {
        match self.states.get_mut(&id) {
            Some(st) => {
                st.target_pos = pos;
                st.target_orient = orient;
                st.refreshed = now;
            }
            None => {
                self.states.insert(
                    id,
                    InterpState {
                        displayed_pos: pos,
                        displayed_orient: orient,
                        target_pos: pos,
                        target_orient: orient,
                        refreshed: now,
                    },
                );
            }
        }
    }

    pub fn remove(&mut self, id: SessionId) {
        self.states.remove(&id);
    }

    /// Adjusts the snap threshold.
    pub fn set_teleport_distance(&mut self, distance: f32) {
        self.teleport_distance = distance;
    }

    /// Drops every state whose id fails the predicate. Keeps the set 1:1
    /// with the live entity store.
    pub fn retain(&mut self, keep: impl Fn(SessionId) -> bool) {
        self.states.retain(|id, _| keep(*id));
    }

    pub fn displayed(&self, id: SessionId) -> Option<(Vec3, Orientation)> {
        self.states
            .get(&id)
            .map(|st| (st.displayed_pos, st.displayed_orient))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Advances every displayed transform one render tick of `dt` seconds.
    pub fn tick(&mut self, now: Instant, dt: f32) {
        for st in self.states.values_mut() {
            let age = now.duration_since(st.refreshed);
            if age > self.target_stale {
                // Outdated target: freeze rather than slide toward it.
                continue;
            }

            if st.displayed_pos.distance(st.target_pos) > self.teleport_distance {
                // Respawn/reconnect jump: snap instead of a multi-second slide.
                st.displayed_pos = st.target_pos;
                st.displayed_orient = st.target_orient;
                continue;
            }

            let factor = if age < FRESH_AGE {
                FACTOR_FRESH
            } else if age < RECENT_AGE {
                FACTOR_RECENT
            } else {
                FACTOR_OLD
            };
            let t = (factor * dt * 60.0).clamp(0.0, 1.0);
            st.displayed_pos = st.displayed_pos.lerp(st.target_pos, t);
            st.displayed_orient = st.displayed_orient.lerp(st.target_orient, t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: f32 = 1.0 / 60.0;

    fn interp() -> Interpolator {
        Interpolator::new(&EngineConfig::default())
    }

    #[test]
    fn first_target_snaps_displayed() {
        let mut ip = interp();
        let now = Instant::now();
        ip.set_target(
            SessionId(1),
            Vec3::new(4.0, 0.0, 2.0),
            Orientation::yaw_only(1.0),
            now,
        );
        let (pos, orient) = ip.displayed(SessionId(1)).unwrap();
        assert_eq!(pos, Vec3::new(4.0, 0.0, 2.0));
        assert_eq!(orient.yaw, 1.0);
    }

    #[test]
    fn converges_monotonically_within_epsilon() {
        let mut ip = interp();
        let t0 = Instant::now();
        let id = SessionId(1);
        ip.set_target(id, Vec3::ZERO, Orientation::default(), t0);
        ip.set_target(id, Vec3::new(1.0, 0.0, 0.0), Orientation::default(), t0);

        let target = Vec3::new(1.0, 0.0, 0.0);
        let mut last_dist = ip.displayed(id).unwrap().0.distance(target);
        let mut now = t0;
        for _ in 0..10 {
            now += Duration::from_secs_f32(TICK);
            ip.tick(now, TICK);
            let dist = ip.displayed(id).unwrap().0.distance(target);
            assert!(dist < last_dist || dist == 0.0, "distance must shrink");
            last_dist = dist;
        }
        assert!(last_dist < 0.01, "distance after 10 ticks: {last_dist}");
    }

    #[test]
    fn large_jump_snaps_immediately() {
        let mut ip = interp();
        let t0 = Instant::now();
        let id = SessionId(1);
        ip.set_target(id, Vec3::ZERO, Orientation::default(), t0);
        ip.set_target(id, Vec3::new(10.0, 0.0, 0.0), Orientation::default(), t0);

        ip.tick(t0 + Duration::from_secs_f32(TICK), TICK);
        assert_eq!(ip.displayed(id).unwrap().0, Vec3::new(10.0, 0.0, 0.0));
    }

    #[test]
    fn stale_target_is_skipped() {
        let mut ip = interp();
        let t0 = Instant::now();
        let id = SessionId(1);
        ip.set_target(id, Vec3::ZERO, Orientation::default(), t0);
        ip.set_target(id, Vec3::new(1.0, 0.0, 0.0), Orientation::default(), t0);

        // Two seconds later the target is stale; displayed must not move.
        let before = ip.displayed(id).unwrap().0;
        ip.tick(t0 + Duration::from_secs(2), TICK);
        assert_eq!(ip.displayed(id).unwrap().0, before);
    }

    #[test]
    fn retain_prunes_removed_entities() {
        let mut ip = interp();
        let now = Instant::now();
        ip.set_target(SessionId(1), Vec3::ZERO, Orientation::default(), now);
        ip.set_target(SessionId(2), Vec3::ZERO, Orientation::default(), now);
        ip.retain(|id| id == SessionId(2));
        assert!(ip.displayed(SessionId(1)).is_none());
        assert_eq!(ip.len(), 1);
    }
}
