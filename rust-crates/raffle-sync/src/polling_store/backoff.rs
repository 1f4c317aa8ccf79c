use crate::error::FailureKind;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff without jitter: `min(max, base * 2^step)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Highest step the counter reaches.
    pub cap: u32,
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub const RATE_LIMITED: BackoffPolicy = BackoffPolicy {
        cap: 6,
        base: Duration::from_secs(10),
        max: Duration::from_secs(300),
    };

    pub const GENERIC: BackoffPolicy = BackoffPolicy {
        cap: 3,
        base: Duration::from_secs(5),
        max: Duration::from_secs(60),
    };

    /// `None` for outcomes that must not back off.
    pub fn for_kind(kind: FailureKind) -> Option<BackoffPolicy> {
        match kind {
            FailureKind::RateLimited => Some(Self::RATE_LIMITED),
            FailureKind::Generic => Some(Self::GENERIC),
            FailureKind::Cancelled => None,
        }
    }

    pub fn delay(&self, step: u32) -> Duration {
        let factor = 2u32.checked_pow(step.min(self.cap)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackoffState {
    pub step: u32,
    pub until: Option<Instant>,
}

impl BackoffState {
    /// Opens a backoff window starting at `now` and returns its length.
    pub fn record_failure(&mut self, policy: &BackoffPolicy, now: Instant) -> Duration {
        let delay = policy.delay(self.step);
        self.step = self.step.saturating_add(1).min(policy.cap);
        self.until = Some(now + delay);
        delay
    }

    pub fn reset(&mut self) {
        *self = BackoffState::default();
    }

    /// Time left in the current window, if any.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.until
            .map(|until| until.saturating_duration_since(now))
            .filter(|left| !left.is_zero())
    }
}
