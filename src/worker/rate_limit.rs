//! Sliding-window start limiter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// At most `max` job starts within any rolling `per` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: usize,
    #[serde(with = "duration_ms")]
    pub per: Duration,
}

impl RateLimit {
    pub fn new(max: usize, per: Duration) -> Self {
        Self {
            max: max.max(1),
            per,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Log of recent starts. A start at `t` stops counting at `t + per`.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    starts: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            starts: VecDeque::with_capacity(limit.max),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.starts.front() {
            if now.saturating_duration_since(oldest) >= self.limit.per {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }

    /// How long until one more start is allowed. Zero means now.
    pub fn time_until_available(&mut self, now: Instant) -> Duration {
        self.evict(now);
        if self.starts.len() < self.limit.max {
            return Duration::ZERO;
        }
        match self.starts.front() {
            Some(&oldest) => self
                .limit
                .per
                .saturating_sub(now.saturating_duration_since(oldest)),
            None => Duration::ZERO,
        }
    }

    /// Count a start at `now`.
    pub fn record(&mut self, now: Instant) {
        self.evict(now);
        self.starts.push_back(now);
    }

    pub fn in_window(&self) -> usize {
        self.starts.len()
    }
}
