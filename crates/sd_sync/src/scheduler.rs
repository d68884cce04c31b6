use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use time::OffsetDateTime;

use sd_core::db;
use sd_core::domain::{Datasource, SyncStatus};
use sd_core::error::AppError;
use sd_core::repo::datasources::{list_enabled_datasources, reclaim_expired_leases};
use sd_core::timestamps::parse_utc;

use crate::reconcile::SyncResult;
use crate::service::SyncService;

pub const DEFAULT_TICK_SECONDS: u64 = 15;

/// Most recent of the last success and the last attempt. `None` when the datasource
/// has never run or its timestamps are unreadable.
fn last_run(ds: &Datasource) -> Option<OffsetDateTime> {
    [ds.last_sync_at.as_deref(), ds.last_attempt_at.as_deref()]
        .into_iter()
        .flatten()
        .filter_map(|s| parse_utc("last_run", s).ok())
        .max()
}

/// Enabled, not mid-run, and at least one interval since the last run.
pub fn is_due(ds: &Datasource, now: OffsetDateTime) -> bool {
    if !ds.enabled || ds.sync_status == SyncStatus::Syncing {
        return false;
    }
    match last_run(ds) {
        None => true,
        Some(last) => (now - last).whole_seconds() >= ds.sync_interval_seconds,
    }
}

pub struct SyncScheduler {
    service: Arc<SyncService>,
    tick_interval: Duration,
}

impl SyncScheduler {
    pub fn new(service: Arc<SyncService>, tick_interval: Duration) -> Self {
        Self {
            service,
            tick_interval,
        }
    }

    /// One scheduling pass: reclaim expired leases, then start a worker thread for
    /// every due datasource that is not already running in this process.
    pub fn tick(&self, now: OffsetDateTime) -> Result<Vec<JoinHandle<SyncResult>>, AppError> {
        let mut conn = db::open(self.service.db_path())?;

        for id in reclaim_expired_leases(&mut conn, now)? {
            tracing::warn!(datasource_id = id, "reclaimed expired sync lease");
        }

        let due: Vec<Datasource> = list_enabled_datasources(&conn)?
            .into_iter()
            .filter(|ds| is_due(ds, now))
            .collect();
        drop(conn);

        let mut handles = Vec::with_capacity(due.len());
        for ds in due {
            let Some(guard) = self.service.locks().try_acquire(ds.id) else {
                tracing::debug!(datasource_id = ds.id, "sync already running, skipping");
                continue;
            };
            let service = Arc::clone(&self.service);
            let spawned = thread::Builder::new()
                .name(format!("sync-ds-{}", ds.id))
                .spawn(move || service.run_locked(guard));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::error!(datasource_id = ds.id, error = %e, "failed to spawn sync worker")
                }
            }
        }
        Ok(handles)
    }

    /// Tick until `shutdown` is set. Workers are detached; a slow provider never delays
    /// the next tick for other datasources.
    pub fn run(&self, shutdown: &AtomicBool) {
        tracing::info!(tick_seconds = self.tick_interval.as_secs(), "sync scheduler started");
        while !shutdown.load(Ordering::Relaxed) {
            let now = self.service.clock().now_utc();
            match self.tick(now) {
                Ok(handles) if !handles.is_empty() => {
                    tracing::debug!(started = handles.len(), "sync workers started")
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "sync scheduler tick failed"),
            }
            self.sleep_until_next_tick(shutdown);
        }
        tracing::info!("sync scheduler stopped");
    }

    fn sleep_until_next_tick(&self, shutdown: &AtomicBool) {
        let step = Duration::from_millis(200);
        let mut slept = Duration::ZERO;
        while slept < self.tick_interval && !shutdown.load(Ordering::Relaxed) {
            thread::sleep(step);
            slept += step;
        }
    }
}
