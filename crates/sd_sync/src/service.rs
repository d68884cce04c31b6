use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use sd_core::cache::OverviewCache;
use sd_core::clock::{Clock, SystemClock};
use sd_core::db;
use sd_core::error::AppError;
use sd_core::repo::datasources::{find_datasource, mark_sync_failed};

use crate::lock::{SyncGuard, SyncLocks};
use crate::provider::{AdapterFactory, DefaultAdapterFactory, ProviderAdapter};
use crate::reconcile::{ReconciliationEngine, SyncResult, SYNC_IN_PROGRESS_MESSAGE};
use crate::settings::SyncSettings;

pub const DATASOURCE_NOT_FOUND_MESSAGE: &str = "Datasource not found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
}

/// Entry point for sync runs, manual or scheduled. Each run opens its own connection
/// on `db_path`; the schema must already be migrated.
pub struct SyncService {
    db_path: PathBuf,
    engine: ReconciliationEngine,
    clock: Arc<dyn Clock>,
    locks: Arc<SyncLocks>,
    factory: Arc<dyn AdapterFactory>,
    overview_cache: Option<Arc<OverviewCache>>,
}

impl SyncService {
    pub fn new(db_path: impl Into<PathBuf>, settings: SyncSettings) -> Self {
        Self::with_parts(
            db_path,
            settings,
            Arc::new(SystemClock),
            Arc::new(DefaultAdapterFactory {
                request_timeout: settings.request_timeout,
            }),
        )
    }

    pub fn with_parts(
        db_path: impl Into<PathBuf>,
        settings: SyncSettings,
        clock: Arc<dyn Clock>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            engine: ReconciliationEngine::new(settings, Arc::clone(&clock)),
            clock,
            locks: SyncLocks::new(),
            factory,
            overview_cache: None,
        }
    }

    /// Invalidate this cache whenever a run changes incident data.
    pub fn with_overview_cache(mut self, cache: Arc<OverviewCache>) -> Self {
        self.overview_cache = Some(cache);
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn locks(&self) -> &Arc<SyncLocks> {
        &self.locks
    }

    /// Manual trigger: ignores the interval, never overlaps another run for the same
    /// datasource.
    pub fn trigger_sync(&self, datasource_id: i64) -> SyncResult {
        let Some(guard) = self.locks.try_acquire(datasource_id) else {
            tracing::info!(datasource_id, "manual sync rejected, run already in flight");
            return SyncResult::failed(SYNC_IN_PROGRESS_MESSAGE);
        };
        self.run_locked(guard)
    }

    pub(crate) fn run_locked(&self, guard: SyncGuard) -> SyncResult {
        let datasource_id = guard.datasource_id();
        let mut conn = match db::open(&self.db_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(datasource_id, error = %e, "failed to open database for sync");
                return SyncResult::failed(e.message);
            }
        };

        let datasource = match find_datasource(&conn, datasource_id) {
            Ok(Some(ds)) => ds,
            Ok(None) => return SyncResult::failed(DATASOURCE_NOT_FOUND_MESSAGE),
            Err(e) => return SyncResult::failed(e.message),
        };

        let adapter = match self.factory.build(&datasource) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(datasource_id, error = %e, "datasource is not configured correctly");
                if let Err(write_err) =
                    mark_sync_failed(&conn, datasource_id, self.clock.now_utc(), &e.message)
                {
                    tracing::error!(datasource_id, error = %write_err, "failed to record sync failure");
                }
                return SyncResult::failed(e.message);
            }
        };

        let result = self.engine.run(&mut conn, &datasource, adapter.as_ref());
        if result.created + result.updated > 0 {
            if let Some(cache) = &self.overview_cache {
                cache.invalidate();
            }
        }
        drop(guard);
        result
    }

    pub fn test_connection(&self, datasource_id: i64) -> ConnectionTestResult {
        match self.connection_check(datasource_id) {
            Ok(identity) => ConnectionTestResult {
                success: true,
                message: format!("Connected as {identity}"),
            },
            Err(e) => ConnectionTestResult {
                success: false,
                message: e.message,
            },
        }
    }

    fn connection_check(&self, datasource_id: i64) -> Result<String, AppError> {
        let conn = db::open(&self.db_path)?;
        let datasource = find_datasource(&conn, datasource_id)?
            .ok_or_else(|| AppError::new("DB_NOT_FOUND", DATASOURCE_NOT_FOUND_MESSAGE))?;
        let adapter: Box<dyn ProviderAdapter> = self.factory.build(&datasource)?;
        let info = adapter.test_connection()?;
        Ok(info.identity)
    }
}
