//! Chat relay primitives.
//!
//! The server relays chat lines between sessions; the UI that displays them
//! is an external collaborator. This module only carries what the relay
//! needs: message sanitation and per-session rate limiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Maximum message length in characters.
pub const MAX_MESSAGE_LENGTH: usize = 256;

/// Rate limit: messages per window.
pub const RATE_LIMIT_MESSAGES: u32 = 5;
/// Rate limit: window duration.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);

/// Trims and truncates a chat line to the wire limit.
pub fn sanitize(text: &str) -> String {
    let mut out = text.trim().to_string();
    if out.len() > MAX_MESSAGE_LENGTH {
        // Truncate on a char boundary.
        let mut end = MAX_MESSAGE_LENGTH;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    out
}

/// Sliding-window rate limiter for chat spam prevention.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    history: VecDeque<Instant>,
    max_messages: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            history: VecDeque::with_capacity(max_messages as usize),
            max_messages,
            window,
        }
    }

    /// Records a message being sent. Returns false if rate limited.
    pub fn record_message(&mut self) -> bool {
        self.record_at(Instant::now())
    }

    fn record_at(&mut self, now: Instant) -> bool {
        // checked_sub: the monotonic clock can start near zero.
        if let Some(cutoff) = now.checked_sub(self.window) {
            while let Some(&front) = self.history.front() {
                if front <= cutoff {
                    self.history.pop_front();
                } else {
                    break;
                }
            }
        }

        if (self.history.len() as u32) >= self.max_messages {
            return false;
        }

        self.history.push_back(now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_MESSAGES, RATE_LIMIT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_blocks_after_burst() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();
        assert!(limiter.record_at(start));
        assert!(limiter.record_at(start));
        assert!(limiter.record_at(start));
        assert!(!limiter.record_at(start));
        // Window slides past the burst.
        assert!(limiter.record_at(start + Duration::from_secs(11)));
    }

    #[test]
    fn sanitize_truncates_long_lines() {
        let long = "x".repeat(MAX_MESSAGE_LENGTH + 40);
        assert_eq!(sanitize(&long).len(), MAX_MESSAGE_LENGTH);
        assert_eq!(sanitize("  hello  "), "hello");
    }
}
