//! Staleness policy deciding whether a location record is still "active".

use chrono::{DateTime, TimeDelta, Utc};

use crate::errors::ConfigError;

/// Default staleness horizon: five minutes.
pub const DEFAULT_HORIZON_MS: i64 = 300_000;

/// Decides liveness of records from their last-update timestamp.
///
/// A record is active iff `now - last_updated < horizon`. Records stamped at or
/// after `now` (age of zero or negative age from clock skew) are always active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    horizon: TimeDelta,
}

impl StalenessPolicy {
    /// Builds a policy from a horizon in milliseconds.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when the horizon is negative.
    pub fn from_millis(horizon_ms: i64) -> Result<Self, ConfigError> {
        if horizon_ms < 0 {
            return Err(ConfigError::invalid(
                "staleness_horizon_ms",
                format!("must not be negative (got {horizon_ms})"),
            ));
        }
        Ok(Self {
            horizon: TimeDelta::milliseconds(horizon_ms),
        })
    }

    /// Maximum age of an active record.
    pub const fn horizon(&self) -> TimeDelta {
        self.horizon
    }

    /// Horizon in milliseconds.
    pub fn horizon_ms(&self) -> i64 {
        self.horizon.num_milliseconds()
    }

    /// Whether a record stamped `last_updated` is still active at `now`.
    pub fn is_active(&self, last_updated: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(last_updated);
        age <= TimeDelta::zero() || age < self.horizon
    }
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            horizon: TimeDelta::milliseconds(DEFAULT_HORIZON_MS),
        }
    }
}

/// Free-function form of [`StalenessPolicy::is_active`].
///
/// A negative horizon is a configuration error and is reported as inactive here;
/// use [`StalenessPolicy::from_millis`] to reject it up front.
pub fn is_active(last_updated: DateTime<Utc>, now: DateTime<Utc>, horizon_ms: i64) -> bool {
    StalenessPolicy::from_millis(horizon_ms)
        .is_ok_and(|policy| policy.is_active(last_updated, now))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn default_horizon_is_five_minutes() {
        assert_eq!(StalenessPolicy::default().horizon_ms(), 300_000);
    }

    #[test]
    fn now_equal_to_last_updated_is_active() {
        let policy = StalenessPolicy::default();
        assert!(policy.is_active(at(0), at(0)));

        let zero = StalenessPolicy::from_millis(0).unwrap();
        assert!(zero.is_active(at(0), at(0)));
        assert!(!zero.is_active(at(0), at(1)));
    }

    #[test]
    fn horizon_boundary() {
        let policy = StalenessPolicy::default();
        let now = at(1_000_000);
        assert!(!policy.is_active(at(1_000_000 - 300_000 - 1), now));
        assert!(policy.is_active(at(1_000_000 - 300_000 + 1), now));
        assert!(!policy.is_active(at(1_000_000 - 300_000), now));
    }

    #[test]
    fn future_timestamps_are_active() {
        let policy = StalenessPolicy::from_millis(1_000).unwrap();
        assert!(policy.is_active(at(10_000), at(0)));
    }

    #[test]
    fn negative_horizon_is_rejected() {
        let err = StalenessPolicy::from_millis(-1).unwrap_err();
        assert!(err.to_string().contains("staleness_horizon_ms"));
        assert!(!is_active(at(0), at(0), -1));
    }

    #[test]
    fn free_function_matches_policy() {
        assert!(is_active(at(0), at(299_999), DEFAULT_HORIZON_MS));
        assert!(!is_active(at(0), at(300_001), DEFAULT_HORIZON_MS));
    }
}
