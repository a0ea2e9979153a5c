//! Stall classification and reconnect bookkeeping.
//!
//! Pure state machines: the controller feeds them observations from its
//! periodic health poll and acts on the verdict.

use std::time::Duration;

use tokio::time::Instant;

use crate::backend::ChannelState;

/// Outcome of one health observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Playing normally.
    Healthy,
    /// Stalled, but not (yet) judged dead.
    Buffering,
    /// Stalled for too long without byte advancement.
    Dead,
    /// The channel stopped on its own.
    Disconnected,
    /// Paused; nothing to judge.
    Idle,
}

#[derive(Debug, Clone, Copy)]
pub struct StallLimits {
    /// How long a stall must persist before byte advancement is checked.
    pub grace: Duration,
    /// How long the position must stay frozen to count as dead.
    pub frozen: Duration,
}

/// Per-handle stall tracker.
#[derive(Debug, Clone)]
pub struct StallTracker {
    limits: StallLimits,
    stall_start: Option<Instant>,
    last_check_at: Instant,
    last_position: u64,
}

impl StallTracker {
    /// Start tracking with a baseline, so a stream that stalls before it
    /// ever played is still judged by byte advancement.
    pub fn attach(limits: StallLimits, now: Instant, position: u64) -> Self {
        Self {
            limits,
            stall_start: None,
            last_check_at: now,
            last_position: position,
        }
    }

    pub fn stall_start(&self) -> Option<Instant> {
        self.stall_start
    }

    pub fn last_position(&self) -> u64 {
        self.last_position
    }

    pub fn observe(&mut self, state: ChannelState, position: u64, now: Instant) -> Verdict {
        match state {
            ChannelState::Stopped => Verdict::Disconnected,
            ChannelState::Paused => {
                self.stall_start = None;
                Verdict::Idle
            }
            ChannelState::Playing => {
                self.stall_start = None;
                self.last_check_at = now;
                self.last_position = position;
                Verdict::Healthy
            }
            ChannelState::Stalled => self.observe_stall(position, now),
        }
    }

    fn observe_stall(&mut self, position: u64, now: Instant) -> Verdict {
        let stall_start = *self.stall_start.get_or_insert(now);
        if now.duration_since(stall_start) < self.limits.grace {
            return Verdict::Buffering;
        }

        let since_check = now.duration_since(self.last_check_at);
        let advanced = position > self.last_position;
        self.last_check_at = now;
        self.last_position = position;

        if advanced {
            // Re-buffering, not dead: give it half a grace period more.
            self.stall_start = Some(now - self.limits.grace / 2);
            Verdict::Buffering
        } else if since_check > self.limits.frozen {
            Verdict::Dead
        } else {
            Verdict::Buffering
        }
    }
}

/// Reconnect attempts for one URL.
///
/// The stall start and last known byte position of the same stream are
/// kept by [`StallTracker`], which is rebuilt whenever monitoring starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectContext {
    pub url: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl ReconnectContext {
    pub fn new(url: &str, max_attempts: u32) -> Self {
        Self {
            url: url.to_string(),
            attempts: 0,
            max_attempts,
        }
    }

    /// Claim the next attempt number, or `None` once exhausted.
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
