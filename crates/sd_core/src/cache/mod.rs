/// Expiring value holder.
///
/// Replaces process-wide cached flags and memoised payloads:
/// - value carries its own computation time and TTL
/// - refreshed on demand via `get_or_refresh`
/// - explicit invalidation on data mutation
/// - clock is injectable so expiry is testable without sleeping
use std::sync::{Arc, Mutex};

use time::{Duration, OffsetDateTime};

use crate::clock::{Clock, SystemClock};
use crate::overview::StatusOverview;

/// Status overview TTL.
pub const OVERVIEW_TTL_SECONDS: i64 = 30;

struct Cached<T> {
    value: T,
    computed_at: OffsetDateTime,
}

pub struct Expiring<T> {
    slot: Mutex<Option<Cached<T>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

pub type OverviewCache = Expiring<StatusOverview>;

impl<T: Clone> Expiring<T> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            slot: Mutex::new(None),
            ttl,
            clock,
        }
    }

    /// Current value if it has not expired.
    pub fn get(&self) -> Option<T> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let cached = slot.as_ref()?;
        let age = self.clock.now_utc() - cached.computed_at;
        // Future-dated entries (clock moved backwards) count as expired.
        if age.is_negative() || age >= self.ttl {
            return None;
        }
        Some(cached.value.clone())
    }

    pub fn set(&self, value: T) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Cached {
            value,
            computed_at: self.clock.now_utc(),
        });
    }

    pub fn invalidate(&self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Return the live value or compute, store and return a fresh one. Errors are not
    /// cached.
    pub fn get_or_refresh<E>(&self, refresh: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        if let Some(v) = self.get() {
            return Ok(v);
        }
        let fresh = refresh()?;
        self.set(fresh.clone());
        Ok(fresh)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached: self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_some(),
            ttl_seconds: self.ttl.whole_seconds(),
        }
    }
}

impl Expiring<StatusOverview> {
    pub fn for_overview(clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(Duration::seconds(OVERVIEW_TTL_SECONDS), clock)
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub cached: bool,
    pub ttl_seconds: i64,
}
