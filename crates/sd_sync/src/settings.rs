use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;
pub const MIN_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ACTIVE_FETCH_LIMIT: usize = 100;
pub const DEFAULT_RESOLVED_FETCH_LIMIT: usize = 50;
pub const MAX_ACTIVE_FETCH_LIMIT: usize = 1000;
pub const MAX_RESOLVED_FETCH_LIMIT: usize = 100;
/// Largest page a provider is asked for.
pub const FETCH_PAGE_SIZE: usize = 100;
pub const MAX_LEASE_TTL_SECS: i64 = 86_400;

/// Tuning for one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Per HTTP request.
    pub request_timeout: Duration,
    /// How long a run may hold its datasource before the watchdog reclaims it.
    pub lease_ttl: time::Duration,
    pub active_fetch_limit: usize,
    pub resolved_fetch_limit: usize,
}

impl SyncSettings {
    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            lease_ttl: default_lease_ttl(
                request_timeout,
                DEFAULT_ACTIVE_FETCH_LIMIT,
                DEFAULT_RESOLVED_FETCH_LIMIT,
            ),
            active_fetch_limit: DEFAULT_ACTIVE_FETCH_LIMIT,
            resolved_fetch_limit: DEFAULT_RESOLVED_FETCH_LIMIT,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::with_request_timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }
}

/// Page requests one run makes at most.
pub fn expected_page_requests(active_fetch_limit: usize, resolved_fetch_limit: usize) -> usize {
    active_fetch_limit.max(1).div_ceil(FETCH_PAGE_SIZE)
        + resolved_fetch_limit.max(1).div_ceil(FETCH_PAGE_SIZE)
}

/// Two request timeouts per expected page plus a minute of slack, capped at a day.
pub fn default_lease_ttl(
    request_timeout: Duration,
    active_fetch_limit: usize,
    resolved_fetch_limit: usize,
) -> time::Duration {
    let secs = i64::try_from(request_timeout.as_secs()).unwrap_or(MAX_LEASE_TTL_SECS);
    let pages = i64::try_from(expected_page_requests(active_fetch_limit, resolved_fetch_limit))
        .unwrap_or(i64::MAX);
    let ttl = secs.saturating_mul(pages).saturating_mul(2).saturating_add(60);
    time::Duration::seconds(ttl.min(MAX_LEASE_TTL_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lease_outlives_several_requests() {
        let s = SyncSettings::default();
        assert_eq!(s.request_timeout, Duration::from_secs(20));
        assert_eq!(s.lease_ttl, time::Duration::seconds(140));
        assert_eq!(s.resolved_fetch_limit, 50);
    }

    #[test]
    fn default_lease_grows_with_page_count() {
        assert_eq!(expected_page_requests(1000, 100), 11);
        assert_eq!(
            default_lease_ttl(Duration::from_secs(30), 1000, 100),
            time::Duration::seconds(30 * 11 * 2 + 60)
        );
        assert_eq!(
            default_lease_ttl(Duration::from_secs(u64::MAX), usize::MAX, usize::MAX),
            time::Duration::seconds(MAX_LEASE_TTL_SECS)
        );
    }
}
