//! Refill rates and bucket quotas.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Time window used to express a rate as "n per window".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate
    Second,
    /// Per-minute rate
    Minute,
    /// Per-hour rate
    Hour,
    /// Per-day rate
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// Token refill rate, in tokens per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Rate(f64);

impl Rate {
    /// A rate that never refills.
    pub const ZERO: Rate = Rate(0.0);

    /// A rate that refills the bucket instantly.
    pub const INFINITE: Rate = Rate(f64::INFINITY);

    /// Create a rate of `tokens` per second.
    pub fn per_second(tokens: f64) -> Self {
        Rate(tokens)
    }

    /// One token every `period`. A zero period is an infinite rate.
    pub fn every(period: Duration) -> Self {
        if period.is_zero() {
            return Rate::INFINITE;
        }
        Rate(1.0 / period.as_secs_f64())
    }

    /// `count` tokens per `window`.
    pub fn per(count: u64, window: TimeWindow) -> Self {
        Rate(count as f64 / window.duration().as_secs_f64())
    }

    /// Tokens per second.
    pub fn tokens_per_second(&self) -> f64 {
        self.0
    }

    pub fn is_infinite(&self) -> bool {
        self.0 == f64::INFINITY
    }

    /// Whether this rate ever produces tokens. NaN and negative rates do not.
    pub fn is_positive(&self) -> bool {
        self.0 > 0.0
    }

    /// Tokens produced over `elapsed`.
    pub(crate) fn tokens_over(&self, elapsed: Duration) -> f64 {
        if self.is_infinite() {
            return f64::INFINITY;
        }
        elapsed.as_secs_f64() * self.0
    }

    /// Time needed to produce `tokens`, or `None` if the rate never produces any.
    pub(crate) fn time_to_produce(&self, tokens: f64) -> Option<Duration> {
        if tokens <= 0.0 || self.is_infinite() {
            return Some(Duration::ZERO);
        }
        if !self.is_positive() {
            return None;
        }
        Duration::try_from_secs_f64(tokens / self.0).ok()
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/s", self.0)
    }
}

/// A refill rate paired with a burst capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    /// Token refill rate
    pub rate: Rate,
    /// Maximum number of tokens the bucket holds
    pub burst: u32,
}

impl Quota {
    /// Create a new quota.
    pub fn new(rate: Rate, burst: u32) -> Self {
        Self { rate, burst }
    }

    /// Whether this quota rejects every request.
    ///
    /// A zero burst can never hold a token and a non-positive rate never
    /// refills. Both are accepted at construction and deny everything.
    pub fn is_degenerate(&self) -> bool {
        self.burst == 0 || !self.rate.is_positive()
    }

    /// Time to refill an empty bucket completely.
    pub fn time_to_fill(&self) -> Option<Duration> {
        self.rate.time_to_produce(self.burst as f64)
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} burst {}", self.rate, self.burst)
    }
}
