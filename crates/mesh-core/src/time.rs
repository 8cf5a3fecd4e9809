//! Timestamps for key-refresh and IV-Index bookkeeping.
//!
//! The IV-Index state machine reasons in whole hours (96-hour dwell,
//! 192-hour recovery rule), so the type carries helpers for that instead
//! of generic clock-skew machinery.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Timestamp in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since the Unix epoch.
    pub const fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// The current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System time before Unix epoch");
        Self(duration.as_millis() as i64)
    }

    /// Milliseconds since the Unix epoch.
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Whole hours elapsed from `earlier` to `self`; zero if `earlier` is
    /// in the future.
    pub fn hours_since(&self, earlier: Timestamp) -> u64 {
        if self.0 <= earlier.0 {
            return 0;
        }
        ((self.0 - earlier.0) / 3_600_000) as u64
    }

    /// Adds a duration, saturating.
    pub fn add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as i64))
    }

    /// Subtracts a duration, saturating.
    pub fn sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as i64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(millis: i64) -> Self {
        Self(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hours_since() {
        let t0 = Timestamp::new(0);
        let t1 = t0.add(Duration::from_secs(96 * 3600));
        assert_eq!(t1.hours_since(t0), 96);
        assert_eq!(t0.hours_since(t1), 0);

        // 95h59m59s rounds down to 95.
        let almost = t0.add(Duration::from_secs(96 * 3600 - 1));
        assert_eq!(almost.hours_since(t0), 95);
    }

    #[test]
    fn test_arithmetic() {
        let ts = Timestamp::new(1_000_000);
        assert_eq!(ts.add(Duration::from_millis(5000)).0, 1_005_000);
        assert_eq!(ts.sub(Duration::from_millis(5000)).0, 995_000);
    }

    #[test]
    fn test_now_is_recent() {
        // After 2024-01-01.
        assert!(Timestamp::now().0 > 1_704_067_200_000);
    }
}
