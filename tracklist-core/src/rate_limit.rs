//! Sliding-window rate limiting for expensive artwork operations
//!
//! Each limiter keeps, per client key, the timestamps of recorded requests.
//! Checking prunes timestamps that fell out of the window but never records;
//! callers record only once they decide to proceed.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::clock::SharedClock;
use crate::error::{ArtworkError, Result};

/// Window accounting returned with every decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitInfo {
    /// Requests recorded inside the current window
    pub requests_made: usize,

    /// Requests still available, present only when allowed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_remaining: Option<usize>,

    /// Maximum requests per window
    pub max_requests: usize,

    /// Window length
    pub window_seconds: i64,

    /// Seconds until the oldest request leaves the window, present only when
    /// rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_in_seconds: Option<u64>,

    /// Instant the oldest request leaves the window, present only when
    /// rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

/// Decision returned by [`SlidingWindowLimiter::check`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,

    /// Window accounting at decision time
    pub info: RateLimitInfo,
}

/// Aggregate limiter statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterStats {
    /// Limiter name.
    pub identifier: String,
    /// Requests allowed per window.
    pub max_requests: usize,
    /// Window length.
    pub window_seconds: i64,
    /// Keys with a tracked window.
    pub active_keys: usize,
    /// Timestamps held across all keys.
    pub total_requests: usize,
}

/// Per-key sliding-window request counter.
pub struct SlidingWindowLimiter {
    identifier: String,
    max_requests: usize,
    window: Duration,
    clock: SharedClock,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked = self
            .windows
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or(0);

        f.debug_struct("SlidingWindowLimiter")
            .field("identifier", &self.identifier)
            .field("max_requests", &self.max_requests)
            .field("window_seconds", &self.window.num_seconds())
            .field("tracked_keys", &tracked)
            .finish()
    }
}

impl SlidingWindowLimiter {
    /// Builds a limiter allowing `max_requests` per `window` for each key.
    pub fn new(
        identifier: impl Into<String>,
        max_requests: usize,
        window: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            max_requests,
            window,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Requests allowed per window.
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Prunes expired timestamps for `key` and reports whether one more
    /// request fits in the window. Does not record anything.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let cutoff = now - self.window;
        let window_seconds = self.window.num_seconds();

        let mut windows = self.windows.lock();
        let (count, oldest) = match windows.get_mut(key) {
            Some(stamps) => {
                stamps.retain(|ts| *ts > cutoff);
                (stamps.len(), stamps.iter().min().copied())
            }
            None => (0, None),
        };
        if count == 0 {
            windows.remove(key);
        }
        drop(windows);

        if count >= self.max_requests {
            let reset_at = oldest.map(|ts| ts + self.window).unwrap_or(now);
            let remaining_ms = (reset_at - now).num_milliseconds().max(0);
            let reset_in_seconds = (remaining_ms as u64).div_ceil(1000);

            return RateLimitDecision {
                allowed: false,
                info: RateLimitInfo {
                    requests_made: count,
                    requests_remaining: None,
                    max_requests: self.max_requests,
                    window_seconds,
                    reset_in_seconds: Some(reset_in_seconds),
                    reset_at: Some(reset_at),
                },
            };
        }

        RateLimitDecision {
            allowed: true,
            info: RateLimitInfo {
                requests_made: count,
                requests_remaining: Some(self.max_requests - count),
                max_requests: self.max_requests,
                window_seconds,
                reset_in_seconds: None,
                reset_at: None,
            },
        }
    }

    /// Records one request for `key` at the current time.
    pub fn record(&self, key: &str) {
        let now = self.clock.now();
        self.windows
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(now);
    }

    /// Forgets every request recorded for `key`.
    pub fn reset(&self, key: &str) {
        self.windows.lock().remove(key);
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> LimiterStats {
        let windows = self.windows.lock();
        LimiterStats {
            identifier: self.identifier.clone(),
            max_requests: self.max_requests,
            window_seconds: self.window.num_seconds(),
            active_keys: windows.len(),
            total_requests: windows.values().map(VecDeque::len).sum(),
        }
    }
}

/// Which window rejected a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    /// Rolling one hour window.
    Hourly,
    /// Rolling one day window.
    Daily,
}

impl LimitType {
    /// Lowercase name used in responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Hourly => "hourly",
            LimitType::Daily => "daily",
        }
    }
}

/// Outcome of the composite refresh gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshDecision {
    /// Whether the refresh may proceed.
    pub allowed: bool,
    /// Window that rejected it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_type: Option<LimitType>,
    /// Human readable rejection reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Hourly window usage.
    pub hourly: RateLimitInfo,
    /// Daily window usage; absent when the hourly window already rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily: Option<RateLimitInfo>,
}

impl RefreshDecision {
    /// Seconds until the rejecting window frees a slot.
    pub fn retry_after(&self) -> Option<u64> {
        let info = match self.limit_type? {
            LimitType::Hourly => &self.hourly,
            LimitType::Daily => self.daily.as_ref()?,
        };
        info.reset_in_seconds
    }

    /// Converts a rejection into [`ArtworkError::RateLimited`].
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            return Ok(self);
        }
        Err(ArtworkError::RateLimited {
            message: self
                .message
                .clone()
                .unwrap_or_else(|| "Refresh limit exceeded".to_string()),
            limit_type: self
                .limit_type
                .map(|kind| kind.as_str().to_string())
                .unwrap_or_default(),
            retry_after: self.retry_after().unwrap_or(0),
        })
    }
}

/// Statistics for both refresh windows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshLimiterStats {
    /// Hourly window.
    pub hourly: LimiterStats,
    /// Daily window.
    pub daily: LimiterStats,
}

/// Two independent windows gating manual artwork refreshes. A refresh is
/// allowed only if both windows pass; the hourly window is consulted first.
#[derive(Debug)]
pub struct ArtworkRefreshLimiter {
    hourly: SlidingWindowLimiter,
    daily: SlidingWindowLimiter,
}

impl ArtworkRefreshLimiter {
    /// Refreshes allowed per album per hour by default.
    pub const DEFAULT_HOURLY_MAX: usize = 5;
    /// Refreshes allowed per album per day by default.
    pub const DEFAULT_DAILY_MAX: usize = 20;

    /// Builds both windows with the given limits.
    pub fn new(hourly_max: usize, daily_max: usize, clock: SharedClock) -> Self {
        Self {
            hourly: SlidingWindowLimiter::new(
                "artwork_refresh_hourly",
                hourly_max,
                Duration::hours(1),
                clock.clone(),
            ),
            daily: SlidingWindowLimiter::new(
                "artwork_refresh_daily",
                daily_max,
                Duration::days(1),
                clock,
            ),
        }
    }

    /// Builds both windows with the default limits.
    pub fn with_defaults(clock: SharedClock) -> Self {
        Self::new(Self::DEFAULT_HOURLY_MAX, Self::DEFAULT_DAILY_MAX, clock)
    }

    /// Checks both windows without recording anything.
    pub fn check_refresh(&self, key: &str) -> RefreshDecision {
        let hourly = self.hourly.check(key);
        if !hourly.allowed {
            return RefreshDecision {
                allowed: false,
                limit_type: Some(LimitType::Hourly),
                message: Some(format!(
                    "Hourly refresh limit exceeded ({} per hour)",
                    self.hourly.max_requests()
                )),
                hourly: hourly.info,
                daily: None,
            };
        }

        let daily = self.daily.check(key);
        if !daily.allowed {
            return RefreshDecision {
                allowed: false,
                limit_type: Some(LimitType::Daily),
                message: Some(format!(
                    "Daily refresh limit exceeded ({} per day)",
                    self.daily.max_requests()
                )),
                hourly: hourly.info,
                daily: Some(daily.info),
            };
        }

        RefreshDecision {
            allowed: true,
            limit_type: None,
            message: None,
            hourly: hourly.info,
            daily: Some(daily.info),
        }
    }

    /// Records an accepted refresh in both windows.
    pub fn record_refresh(&self, key: &str) {
        self.hourly.record(key);
        self.daily.record(key);
    }

    /// Clears both windows for `key`.
    pub fn reset(&self, key: &str) {
        self.hourly.reset(key);
        self.daily.reset(key);
    }

    /// Statistics for both windows.
    pub fn stats(&self) -> RefreshLimiterStats {
        RefreshLimiterStats {
            hourly: self.hourly.stats(),
            daily: self.daily.stats(),
        }
    }
}
