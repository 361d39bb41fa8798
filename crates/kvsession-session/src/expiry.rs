use crate::store::SessionRecord;
use chrono::{DateTime, Duration, Utc};
use kvsession_core::SessionConfig;

/// Why a record is no longer trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Not written for at least `max_age`.
    Idle,
    /// Past its recorded `expires_at`.
    Expired,
    /// Created at least `max_stale` ago.
    Lifetime,
}

impl StaleReason {
    /// Label used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Expired => "expired",
            Self::Lifetime => "lifetime",
        }
    }
}

/// Staleness and expiry rules.
///
/// All comparisons are inclusive on the stale side: a record whose age equals
/// `max_age` is stale. Times come from the UTC wall clock.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    max_age: Duration,
    max_stale: Option<Duration>,
    refresh_after: Option<Duration>,
}

impl ExpiryPolicy {
    pub fn new(max_age: Duration, max_stale: Option<Duration>, refresh_after: Option<Duration>) -> Self {
        Self {
            max_age,
            max_stale,
            refresh_after,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.max_age(), config.max_stale(), config.refresh_after())
    }

    /// The first rule `record` breaks at `now`, if any.
    pub fn stale_reason(&self, record: &SessionRecord, now: DateTime<Utc>) -> Option<StaleReason> {
        if now >= record.expires_at {
            return Some(StaleReason::Expired);
        }
        if now - record.updated_at >= self.max_age {
            return Some(StaleReason::Idle);
        }
        match self.max_stale {
            Some(max_stale) if now - record.created_at >= max_stale => Some(StaleReason::Lifetime),
            _ => None,
        }
    }

    /// Expiry for a record written at `now`: the idle deadline, capped by the
    /// absolute lifetime, and never before `created_at`.
    pub fn expires_at(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let idle = now + self.max_age;
        let capped = match self.max_stale {
            Some(max_stale) => idle.min(created_at + max_stale),
            None => idle,
        };
        capped.max(created_at)
    }

    /// Whether a fresh, unmodified session should be re-written to extend it.
    pub fn needs_refresh(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.refresh_after
            .is_some_and(|threshold| now - updated_at >= threshold)
    }
}
