//! Presence broadcasting.
//!
//! The full live session list goes to every client on each membership
//! change, and again on a fixed interval regardless of change. The interval
//! push is the correction path: a client whose incremental delta was
//! dropped can be wrong for at most one interval.

use std::time::Duration;

use tokio::time::Instant;

/// Why a broadcast is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Membership changed; send immediately as a snapshot.
    Change,
    /// Interval elapsed; send as a corrective sync.
    Interval,
}

/// Tracks when the full entity list must go out.
pub struct PresenceBroadcaster {
    interval: Duration,
    last_sent: Instant,
    dirty: bool,
}

impl PresenceBroadcaster {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_sent: now,
            dirty: false,
        }
    }

    /// Marks a membership change (join, leave, eviction).
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Adjusts the corrective broadcast interval.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Returns what kind of broadcast is due, if any, and resets the timer.
    pub fn poll(&mut self, now: Instant) -> Option<SyncKind> {
        if self.dirty {
            self.dirty = false;
            self.last_sent = now;
            return Some(SyncKind::Change);
        }
        if now.duration_since(self.last_sent) >= self.interval {
            self.last_sent = now;
            return Some(SyncKind::Interval);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_broadcasts_immediately() {
        let t0 = Instant::now();
        let mut pb = PresenceBroadcaster::new(Duration::from_secs(5), t0);
        assert_eq!(pb.poll(t0), None);
        pb.mark_dirty();
        assert_eq!(pb.poll(t0), Some(SyncKind::Change));
        assert_eq!(pb.poll(t0), None);
    }

    #[test]
    fn interval_fires_without_change() {
        let t0 = Instant::now();
        let mut pb = PresenceBroadcaster::new(Duration::from_secs(5), t0);
        assert_eq!(pb.poll(t0 + Duration::from_secs(4)), None);
        assert_eq!(
            pb.poll(t0 + Duration::from_secs(5)),
            Some(SyncKind::Interval)
        );
        // Timer reset by the send.
        assert_eq!(pb.poll(t0 + Duration::from_secs(6)), None);
    }

    #[test]
    fn change_resets_interval_timer() {
        let t0 = Instant::now();
        let mut pb = PresenceBroadcaster::new(Duration::from_secs(5), t0);
        pb.mark_dirty();
        assert_eq!(pb.poll(t0 + Duration::from_secs(4)), Some(SyncKind::Change));
        assert_eq!(pb.poll(t0 + Duration::from_secs(8)), None);
        assert_eq!(
            pb.poll(t0 + Duration::from_secs(9)),
            Some(SyncKind::Interval)
        );
    }
}
