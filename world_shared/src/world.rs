//! World object log.
//!
//! Append-only, deduplicated log of durable placed objects. The grid
//! coordinate is the dedup key: the same placement delivered twice, whether
//! via the incremental broadcast or a full replay that overlaps it, is
//! applied at most once. Both sides of the wire run the same structure.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::net::{GridCoord, PlacedObject};

/// Deduplicated append-only object log.
#[derive(Default)]
pub struct ObjectLog {
    entries: Vec<PlacedObject>,
    seen: HashSet<GridCoord>,
    last_compact: Option<Instant>,
    pub duplicates_ignored: u64,
}

impl ObjectLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, coord: GridCoord) -> bool {
        self.seen.contains(&coord)
    }

    /// Appends one object. Returns false without side effects when the
    /// coordinate has already been applied.
    pub fn place(&mut self, obj: PlacedObject) -> bool {
        if !self.seen.insert(obj.coord) {
            self.duplicates_ignored += 1;
            debug!(coord = ?obj.coord, "duplicate placement ignored");
            return false;
        }
        self.entries.push(obj);
        true
    }

    /// Applies a full replay, skipping coordinates already applied.
    /// Returns how many entries were new.
    pub fn apply_replay(&mut self, objects: &[PlacedObject]) -> usize {
        objects
            .iter()
            .filter(|obj| self.place((*obj).clone()))
            .count()
    }

    pub fn entries(&self) -> &[PlacedObject] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bounds allocator slack in the seen set. The log is append-only, so
    /// compaction never forgets an applied coordinate; it only releases
    /// spare capacity. Cheap enough that a minutes-scale cadence suffices.
    pub fn compact_seen(&mut self, now: Instant, interval: Duration) {
        let due = match self.last_compact {
            Some(prev) => now.duration_since(prev) >= interval,
            None => true,
        };
        if due {
            self.seen.shrink_to_fit();
            self.last_compact = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SessionId;

    fn obj(x: i32, z: i32, layer: i32) -> PlacedObject {
        PlacedObject {
            coord: GridCoord::new(x, z, layer),
            color: 0xff0000,
            owner: SessionId(1),
            placed_at_ms: 0,
        }
    }

    #[test]
    fn second_placement_at_same_coord_ignored() {
        let mut log = ObjectLog::new();
        assert!(log.place(obj(3, 3, 0)));
        assert!(!log.place(obj(3, 3, 0)));
        assert_eq!(log.len(), 1);
        assert_eq!(log.duplicates_ignored, 1);
    }

    #[test]
    fn replay_overlapping_incremental_applies_once() {
        let mut log = ObjectLog::new();
        // Incremental push arrives first.
        assert!(log.place(obj(3, 3, 0)));
        // Full replay contains the same coordinate plus a new one.
        let applied = log.apply_replay(&[obj(3, 3, 0), obj(4, 3, 0)]);
        assert_eq!(applied, 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn compact_keeps_dedup_intact() {
        let mut log = ObjectLog::new();
        log.place(obj(0, 0, 0));
        let now = Instant::now();
        log.compact_seen(now, Duration::from_secs(300));
        log.compact_seen(now + Duration::from_secs(301), Duration::from_secs(300));
        assert!(!log.place(obj(0, 0, 0)));
    }
}
