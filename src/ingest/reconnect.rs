//! Reconnection policy and read-failure bookkeeping.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::ReconnectSettings;

/// Why a reconnection sequence was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectTrigger {
    ReadFailures,
    Freeze,
    Manual,
}

impl std::fmt::Display for ReconnectTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReconnectTrigger::ReadFailures => "repeated read failures",
            ReconnectTrigger::Freeze => "frozen stream",
            ReconnectTrigger::Manual => "manual request",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Reconnected,
    Failed,
    /// Less than `base_delay` since the previous attempt.
    RateLimited,
    /// Another reconnection sequence is already running.
    InFlight,
    /// The source was released while waiting out the backoff.
    Cancelled,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("reconnection refused; previous attempt was {since:?} ago (minimum spacing {min_spacing:?})")]
pub struct Refused {
    pub since: Duration,
    pub min_spacing: Duration,
}

/// Exponential backoff with attempt bookkeeping.
///
/// `delay_for(k) = min(base * 2^k, max)`. The strategy never refuses on its own
/// account of failures; escalation to FAILED is the caller's decision.
///
/// Attempts are spaced at least `base_delay` apart, measured from the later of
/// the previous admission and the previous reopen.
#[derive(Clone, Debug)]
pub struct ReconnectionStrategy {
    attempt_count: u32,
    last_attempt: Option<Instant>,
    base_delay: Duration,
    max_delay: Duration,
}

impl ReconnectionStrategy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempt_count: 0,
            last_attempt: None,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(settings.base_delay, settings.max_delay)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn current_delay(&self) -> Duration {
        self.delay_for(self.attempt_count)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    /// Admit a new attempt at `now`, returning the backoff to wait before reopening.
    pub fn begin(&mut self, now: Instant) -> Result<Duration, Refused> {
        if let Some(last) = self.last_attempt {
            let since = now.saturating_duration_since(last);
            if since < self.base_delay {
                return Err(Refused {
                    since,
                    min_spacing: self.base_delay,
                });
            }
        }
        self.last_attempt = Some(now);
        Ok(self.current_delay())
    }

    /// Record a successful reopen at `now`.
    pub fn succeeded(&mut self, now: Instant) {
        self.attempt_count = 0;
        self.last_attempt = Some(now);
    }

    /// Record a failed reopen at `now`. Returns the number of consecutive
    /// failed attempts so far.
    pub fn failed(&mut self, now: Instant) -> u32 {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt = Some(now);
        self.attempt_count
    }

    /// Forget all history, as after a fresh setup.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.last_attempt = None;
    }
}

/// Producer-side read-failure counters.
///
/// Owned by the producer task alone.
#[derive(Clone, Debug)]
pub struct ErrorCounters {
    consecutive: u32,
    network: u32,
    max_consecutive: u32,
    max_network: u32,
}

impl ErrorCounters {
    pub fn new(max_consecutive: u32, max_network: u32) -> Self {
        Self {
            consecutive: 0,
            network: 0,
            max_consecutive: max_consecutive.max(1),
            max_network: max_network.max(1),
        }
    }

    /// Count a failed read. Returns true when a threshold is crossed; both
    /// counters are reset in that case.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.network = self.network.saturating_add(1);
        if self.consecutive >= self.max_consecutive || self.network >= self.max_network {
            self.reset();
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.network = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn network(&self) -> u32 {
        self.network
    }
}
