use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rusqlite::Connection;
use serde::Serialize;

use sd_core::cache::OverviewCache;
use sd_core::clock::{Clock, SystemClock};
use sd_core::db;
use sd_core::domain::{ComponentStatus, Datasource};
use sd_core::error::AppError;
use sd_core::overview::{compute_status_overview, StatusOverview};
use sd_core::repo::datasources::{get_datasource, insert_datasource, list_datasources, NewDatasource};
use sd_core::timestamps::format_utc;
use sd_sync::service::ConnectionTestResult;
use sd_sync::{SyncResult, SyncScheduler, SyncService};

use crate::config::AppConfig;

#[derive(Debug, Serialize)]
pub struct InitDbResponse {
    pub db_path: String,
    pub initialized_at: String,
}

/// Shared handles for one process: config, clock, overview cache and sync service.
pub struct AppContext {
    pub config: AppConfig,
    clock: Arc<dyn Clock>,
    overview_cache: Arc<OverviewCache>,
    sync: Arc<SyncService>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let overview_cache = Arc::new(OverviewCache::with_clock(
            time::Duration::seconds(config.overview_ttl_secs),
            Arc::clone(&clock),
        ));
        let sync = Arc::new(
            SyncService::new(&config.db_path, config.to_sync_settings())
                .with_overview_cache(Arc::clone(&overview_cache)),
        );
        Self {
            config,
            clock,
            overview_cache,
            sync,
        }
    }

    fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    /// Migrations run here, once per process; sync workers open plain connections.
    pub fn open_db(&self) -> Result<Connection, AppError> {
        db::open_and_migrate(self.db_path())
    }
}

pub fn init_db(ctx: &AppContext) -> Result<InitDbResponse, AppError> {
    let _conn = ctx.open_db()?;
    Ok(InitDbResponse {
        db_path: ctx.db_path().display().to_string(),
        initialized_at: format_utc(ctx.clock.now_utc())?,
    })
}

pub fn status_overview(ctx: &AppContext) -> Result<StatusOverview, AppError> {
    let conn = ctx.open_db()?;
    ctx.overview_cache
        .get_or_refresh(|| compute_status_overview(&conn, ctx.clock.now_utc()))
}

pub fn datasources_list(ctx: &AppContext) -> Result<Vec<Datasource>, AppError> {
    let conn = ctx.open_db()?;
    list_datasources(&conn)
}

pub fn datasource_add(ctx: &AppContext, new: &NewDatasource) -> Result<Datasource, AppError> {
    let conn = ctx.open_db()?;
    let now = format_utc(ctx.clock.now_utc())?;
    let id = insert_datasource(&conn, new, &now)?;
    tracing::info!(datasource_id = id, provider = %new.provider_type, "datasource added");
    get_datasource(&conn, id)
}

pub fn sync_datasource(ctx: &AppContext, datasource_id: i64) -> Result<SyncResult, AppError> {
    let _conn = ctx.open_db()?;
    Ok(ctx.sync.trigger_sync(datasource_id))
}

pub fn test_datasource_connection(
    ctx: &AppContext,
    datasource_id: i64,
) -> Result<ConnectionTestResult, AppError> {
    let _conn = ctx.open_db()?;
    Ok(ctx.sync.test_connection(datasource_id))
}

/// One scheduling pass, waiting for every started run.
pub fn run_once(ctx: &AppContext) -> Result<Vec<SyncResult>, AppError> {
    let _conn = ctx.open_db()?;
    let scheduler = SyncScheduler::new(Arc::clone(&ctx.sync), ctx.config.tick_interval());
    let handles = scheduler.tick(ctx.clock.now_utc())?;
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.join() {
            Ok(result) => results.push(result),
            Err(_) => results.push(SyncResult::failed("Sync worker panicked")),
        }
    }
    Ok(results)
}

/// Run the scheduler until Ctrl-C, logging global status transitions as they appear.
pub fn run_forever(ctx: &AppContext) -> Result<(), AppError> {
    let conn = ctx.open_db()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed)).map_err(|e| {
            AppError::new("APP_SIGNAL_HANDLER_FAILED", "Failed to install shutdown handler")
                .with_details(e.to_string())
        })?;
    }

    let scheduler = SyncScheduler::new(Arc::clone(&ctx.sync), ctx.config.tick_interval());
    let worker_shutdown = Arc::clone(&shutdown);
    let scheduler_thread = thread::Builder::new()
        .name("sync-scheduler".to_string())
        .spawn(move || scheduler.run(&worker_shutdown))
        .map_err(|e| {
            AppError::new("APP_SPAWN_FAILED", "Failed to start sync scheduler").with_details(e.to_string())
        })?;

    let mut last_status: Option<ComponentStatus> = None;
    while !shutdown.load(Ordering::Relaxed) {
        match ctx
            .overview_cache
            .get_or_refresh(|| compute_status_overview(&conn, ctx.clock.now_utc()))
        {
            Ok(overview) if last_status != Some(overview.global_status) => {
                tracing::info!(
                    global_status = %overview.global_status,
                    active_incidents = overview.active_incidents.len(),
                    "global status changed"
                );
                last_status = Some(overview.global_status);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to compute status overview"),
        }
        thread::sleep(std::time::Duration::from_millis(500));
    }

    if scheduler_thread.join().is_err() {
        tracing::error!("sync scheduler thread panicked");
    }
    Ok(())
}
