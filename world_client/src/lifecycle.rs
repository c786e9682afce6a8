//! Connection lifecycle.
//!
//! State machine owning connect/disconnect/reconnect state for one client:
//! `disconnected → connecting → connected` and
//! `connected → reconnecting → connected | disconnected`.
//!
//! All transitions take an explicit `now` so the machine stays deterministic
//! under test; the owner supplies timers and performs the actual dial.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use world_shared::config::EngineConfig;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What the owner must do after a connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossAction {
    /// Schedule one reconnect attempt after the delay.
    Retry(Duration),
    /// No retry: purge all remote live entities and go offline.
    GiveUp,
}

/// Lifecycle state machine for one client connection.
pub struct Lifecycle {
    state: ConnState,
    last_attempt: Option<Instant>,
    attempts: u32,
    cooldown: Duration,
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl Lifecycle {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            state: ConnState::Disconnected,
            last_attempt: None,
            attempts: 0,
            cooldown: Duration::from_millis(cfg.connect_cooldown_ms),
            base: Duration::from_millis(cfg.reconnect_base_ms),
            cap: Duration::from_millis(cfg.reconnect_cap_ms),
            max_attempts: cfg.reconnect_max_attempts,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// True in every state that wants a live transport.
    pub fn is_enabled(&self) -> bool {
        self.state != ConnState::Disconnected
    }

    /// Requests a user-initiated connection. A request within the cooldown
    /// window of the previous attempt, or while a connect is already in
    /// flight, is a no-op; the return value is the enabled state after the
    /// call either way.
    pub fn request_connection(&mut self, now: Instant) -> bool {
        match self.state {
            ConnState::Connecting | ConnState::Connected => return self.is_enabled(),
            _ => {}
        }
        if let Some(prev) = self.last_attempt {
            if now.duration_since(prev) < self.cooldown {
                debug!("connection request inside cooldown window, ignored");
                return self.is_enabled();
            }
        }
        self.last_attempt = Some(now);
        self.attempts = 0;
        self.state = ConnState::Connecting;
        true
    }

    /// Transport established; resets the reconnect attempt counter. The
    /// owner starts its heartbeat now.
    pub fn on_connected(&mut self, _now: Instant) {
        info!(prev = ?self.state, "connected");
        self.state = ConnState::Connected;
        self.attempts = 0;
    }

    /// Transport failed or closed. An expected close (client-initiated)
    /// goes straight to `Disconnected`; an abnormal close from a live
    /// connection schedules capped exponential backoff until the attempt
    /// budget runs out.
    pub fn on_connection_lost(&mut self, now: Instant, expected: bool) -> LossAction {
        if expected {
            self.state = ConnState::Disconnected;
            self.attempts = 0;
            return LossAction::GiveUp;
        }
        match self.state {
            ConnState::Disconnected => LossAction::GiveUp,
            ConnState::Connecting => {
                // Initial dial failed; the user may retry after the cooldown.
                self.state = ConnState::Disconnected;
                LossAction::GiveUp
            }
            ConnState::Connected | ConnState::Reconnecting => {
                self.attempts += 1;
                self.last_attempt = Some(now);
                if self.attempts > self.max_attempts {
                    warn!(attempts = self.attempts - 1, "reconnect attempts exhausted");
                    self.state = ConnState::Disconnected;
                    self.attempts = 0;
                    return LossAction::GiveUp;
                }
                self.state = ConnState::Reconnecting;
                let delay = self.backoff_delay();
                info!(attempt = self.attempts, ?delay, "scheduling reconnect");
                LossAction::Retry(delay)
            }
        }
    }

    /// Synchronous transition to `Disconnected` from any state. The owner
    /// cancels pending timers and purges remote entities.
    pub fn request_disconnection(&mut self) {
        if self.state != ConnState::Disconnected {
            info!(prev = ?self.state, "disconnecting");
        }
        self.state = ConnState::Disconnected;
        self.attempts = 0;
    }

    /// Exponential backoff capped at `cap`, with a little jitter so a herd
    /// of clients does not redial in lockstep.
    fn backoff_delay(&self) -> Duration {
        let shift = self.attempts.saturating_sub(1).min(16);
        let exp = self
            .base
            .saturating_mul(1u32 << shift)
            .min(self.cap);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        exp + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> Lifecycle {
        Lifecycle::new(&EngineConfig::default())
    }

    #[test]
    fn request_within_cooldown_is_noop() {
        let mut lc = lifecycle();
        let t0 = Instant::now();
        assert!(lc.request_connection(t0));
        assert_eq!(lc.state(), ConnState::Connecting);

        // A failed dial drops back to Disconnected...
        assert_eq!(lc.on_connection_lost(t0, false), LossAction::GiveUp);
        // ...and an immediate retry is still inside the cooldown.
        assert!(!lc.request_connection(t0 + Duration::from_millis(500)));
        assert_eq!(lc.state(), ConnState::Disconnected);

        // Past the cooldown the request goes through.
        assert!(lc.request_connection(t0 + Duration::from_millis(1600)));
        assert_eq!(lc.state(), ConnState::Connecting);
    }

    #[test]
    fn abnormal_close_schedules_capped_backoff() {
        let mut lc = lifecycle();
        let t0 = Instant::now();
        lc.request_connection(t0);
        lc.on_connected(t0);

        let mut delays = Vec::new();
        let mut now = t0;
        loop {
            now += Duration::from_secs(1);
            match lc.on_connection_lost(now, false) {
                LossAction::Retry(d) => delays.push(d),
                LossAction::GiveUp => break,
            }
        }

        assert_eq!(delays.len(), 5);
        // Base 1s doubling to the 3s cap, plus up to 250ms jitter each.
        assert!(delays[0] >= Duration::from_secs(1));
        assert!(delays[0] < Duration::from_millis(1250));
        assert!(delays[4] >= Duration::from_secs(3));
        assert!(delays[4] < Duration::from_millis(3250));
        assert_eq!(lc.state(), ConnState::Disconnected);
    }

    #[test]
    fn expected_close_skips_reconnect() {
        let mut lc = lifecycle();
        let t0 = Instant::now();
        lc.request_connection(t0);
        lc.on_connected(t0);
        assert_eq!(lc.on_connection_lost(t0, true), LossAction::GiveUp);
        assert_eq!(lc.state(), ConnState::Disconnected);
    }

    #[test]
    fn reconnect_success_resets_attempts() {
        let mut lc = lifecycle();
        let t0 = Instant::now();
        lc.request_connection(t0);
        lc.on_connected(t0);

        assert!(matches!(
            lc.on_connection_lost(t0, false),
            LossAction::Retry(_)
        ));
        assert_eq!(lc.state(), ConnState::Reconnecting);
        lc.on_connected(t0 + Duration::from_secs(2));
        assert_eq!(lc.state(), ConnState::Connected);

        // Counter is back at zero: the next loss starts from the base delay.
        match lc.on_connection_lost(t0 + Duration::from_secs(3), false) {
            LossAction::Retry(d) => assert!(d < Duration::from_millis(1250)),
            LossAction::GiveUp => panic!("expected retry"),
        }
    }

    #[test]
    fn disconnect_request_works_from_any_state() {
        let mut lc = lifecycle();
        let t0 = Instant::now();
        lc.request_connection(t0);
        lc.on_connected(t0);
        lc.on_connection_lost(t0, false);
        assert_eq!(lc.state(), ConnState::Reconnecting);

        lc.request_disconnection();
        assert_eq!(lc.state(), ConnState::Disconnected);
        assert!(!lc.is_enabled());
    }
}
