//! Circuit breaker in front of the host moderation endpoints.

use super::ModerationError;
use crate::config::BlockFlag;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Consecutive failures that open the breaker.
pub const FAILURE_THRESHOLD: u32 = 3;
pub const COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NetworkStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub rate_limited: u64,
    pub cooldown_remaining_secs: Option<u64>,
    pub blocked: Option<BlockFlag>,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct NetworkGuard {
    attempts: u64,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    rate_limited: u64,
    cooldown_until: Option<Instant>,
    blocked: Option<BlockFlag>,
    last_error: Option<String>,
    last_success: Option<DateTime<Utc>>,
}

impl NetworkGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start blocked, as recorded by an earlier session.
    pub fn with_block(flag: Option<BlockFlag>) -> Self {
        Self {
            blocked: flag,
            ..Self::default()
        }
    }

    /// Whether a request may be sent now.
    pub fn check(&self, now: Instant) -> Result<(), ModerationError> {
        if let Some(flag) = &self.blocked {
            return Err(ModerationError::Blocked(flag.reason.clone()));
        }
        match self.cooldown_until {
            Some(until) if until > now => Err(ModerationError::Unavailable(format!(
                "network cooling down for {}s",
                (until - now).as_secs()
            ))),
            _ => Ok(()),
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_success(&mut self) {
        self.successes += 1;
        self.consecutive_failures = 0;
        self.cooldown_until = None;
        self.last_success = Some(Utc::now());
    }

    /// Count a failed request. Returns the block flag when this failure
    /// newly blocked the network path so the caller can persist it.
    pub fn record_failure(&mut self, error: &ModerationError, now: Instant) -> Option<BlockFlag> {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());

        match error {
            ModerationError::Blocked(reason) => {
                self.start_cooldown(now);
                if self.blocked.is_none() {
                    let flag = BlockFlag {
                        blocked_at: Utc::now(),
                        reason: reason.clone(),
                    };
                    log::error!("Moderation API blocked by edge protection: {reason}");
                    self.blocked = Some(flag.clone());
                    return Some(flag);
                }
            }
            ModerationError::RateLimited => {
                self.rate_limited += 1;
                self.start_cooldown(now);
            }
            _ if self.consecutive_failures >= FAILURE_THRESHOLD => self.start_cooldown(now),
            _ => {}
        }
        None
    }

    fn start_cooldown(&mut self, now: Instant) {
        log::warn!(
            "Disabling network moderation for {}s after {} consecutive failures",
            COOLDOWN.as_secs(),
            self.consecutive_failures
        );
        self.cooldown_until = Some(now + COOLDOWN);
    }

    /// Clear the block flag and any running cooldown.
    pub fn reset_block(&mut self) {
        self.blocked = None;
        self.cooldown_until = None;
        self.consecutive_failures = 0;
    }

    pub fn set_block(&mut self, flag: Option<BlockFlag>) {
        self.blocked = flag;
    }

    pub fn stats(&self, now: Instant) -> NetworkStats {
        NetworkStats {
            attempts: self.attempts,
            successes: self.successes,
            failures: self.failures,
            consecutive_failures: self.consecutive_failures,
            rate_limited: self.rate_limited,
            cooldown_remaining_secs: self
                .cooldown_until
                .filter(|until| *until > now)
                .map(|until| (until - now).as_secs()),
            blocked: self.blocked.clone(),
            last_error: self.last_error.clone(),
            last_success: self.last_success,
        }
    }
}
