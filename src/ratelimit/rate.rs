//! Quota definitions: capacity plus refill period.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, UrsaError};

/// Time unit for rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Up to `capacity` admitted requests per `refill_period`.
///
/// Both fields are guaranteed positive; the only way to build one is through
/// the checked constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateSpec {
    capacity: u32,
    refill_period: Duration,
}

impl RateSpec {
    /// Create a quota, rejecting a zero capacity or a zero period.
    pub fn new(capacity: u32, refill_period: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(UrsaError::config("rate capacity must be greater than zero"));
        }
        if refill_period.is_zero() {
            return Err(UrsaError::config("rate refill period must be greater than zero"));
        }
        Ok(Self {
            capacity,
            refill_period,
        })
    }

    /// `capacity` requests per one `unit`.
    pub fn per(capacity: u32, unit: TimeUnit) -> Result<Self> {
        Self::new(capacity, unit.duration())
    }

    /// `capacity` requests every `count` units.
    pub fn every(capacity: u32, count: u32, unit: TimeUnit) -> Result<Self> {
        Self::new(capacity, unit.duration() * count)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }
}

impl std::fmt::Display for RateSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:?}", self.capacity, self.refill_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_rate_spec_rejects_zero_capacity() {
        assert!(RateSpec::new(0, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_rate_spec_rejects_zero_period() {
        assert!(RateSpec::new(5, Duration::ZERO).is_err());
        assert!(RateSpec::every(5, 0, TimeUnit::Minute).is_err());
    }

    #[test]
    fn test_rate_spec_every() {
        let rate = RateSpec::every(10, 5, TimeUnit::Minute).unwrap();
        assert_eq!(rate.capacity(), 10);
        assert_eq!(rate.refill_period(), Duration::from_secs(300));
    }
}
