use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use crate::domain::{Datasource, SyncStatus};
use crate::error::{db_err, AppError};
use crate::repo::collect;
use crate::timestamps::{format_utc, parse_utc};

pub const MIN_SYNC_INTERVAL_SECONDS: i64 = 30;
pub const MAX_SYNC_INTERVAL_SECONDS: i64 = 3600;
pub const DEFAULT_SYNC_INTERVAL_SECONDS: i64 = 60;

pub const LEASE_EXPIRED_MESSAGE: &str = "Sync lease expired before the run finished";

const DATASOURCE_COLUMNS: &str = r#"
  id, name, provider_type, config_json, enabled, sync_interval_seconds,
  sync_status, sync_error, last_sync_at, last_attempt_at, lease_token, lease_expires_at
"#;

fn datasource_from_row(row: &Row<'_>) -> rusqlite::Result<Datasource> {
    Ok(Datasource {
        id: row.get(0)?,
        name: row.get(1)?,
        provider_type: row.get(2)?,
        config_json: row.get(3)?,
        enabled: row.get(4)?,
        sync_interval_seconds: row.get(5)?,
        sync_status: row.get(6)?,
        sync_error: row.get(7)?,
        last_sync_at: row.get(8)?,
        last_attempt_at: row.get(9)?,
        lease_token: row.get(10)?,
        lease_expires_at: row.get(11)?,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewDatasource {
    pub name: String,
    pub provider_type: String,
    pub config_json: String,
    pub enabled: bool,
    pub sync_interval_seconds: i64,
}

pub fn insert_datasource(conn: &Connection, ds: &NewDatasource, now: &str) -> Result<i64, AppError> {
    if ds.name.trim().is_empty() {
        return Err(AppError::new("VALIDATION_DATASOURCE_NAME", "Datasource name is required"));
    }
    if !(MIN_SYNC_INTERVAL_SECONDS..=MAX_SYNC_INTERVAL_SECONDS).contains(&ds.sync_interval_seconds) {
        return Err(AppError::new(
            "VALIDATION_SYNC_INTERVAL",
            format!(
                "sync_interval_seconds must be between {MIN_SYNC_INTERVAL_SECONDS} and {MAX_SYNC_INTERVAL_SECONDS}"
            ),
        )
        .with_details(format!("value={}", ds.sync_interval_seconds)));
    }
    serde_json::from_str::<serde_json::Value>(&ds.config_json).map_err(|e| {
        AppError::new("VALIDATION_DATASOURCE_CONFIG", "Datasource config must be valid JSON")
            .with_details(e.to_string())
    })?;

    conn.execute(
        r#"
      INSERT INTO datasources(name, provider_type, config_json, enabled, sync_interval_seconds, sync_status, created_at)
      VALUES (?1, ?2, ?3, ?4, ?5, 'idle', ?6)
      "#,
        params![ds.name, ds.provider_type, ds.config_json, ds.enabled, ds.sync_interval_seconds, now],
    )
    .map_err(db_err("DB_INSERT_FAILED", "Failed to insert datasource"))?;
    Ok(conn.last_insert_rowid())
}

pub fn find_datasource(conn: &Connection, id: i64) -> Result<Option<Datasource>, AppError> {
    conn.query_row(
        &format!("SELECT {DATASOURCE_COLUMNS} FROM datasources WHERE id = ?1"),
        [id],
        datasource_from_row,
    )
    .optional()
    .map_err(db_err("DB_QUERY_FAILED", "Failed to query datasource"))
}

pub fn get_datasource(conn: &Connection, id: i64) -> Result<Datasource, AppError> {
    find_datasource(conn, id)?.ok_or_else(|| AppError::not_found("Datasource", id))
}

pub fn list_datasources(conn: &Connection) -> Result<Vec<Datasource>, AppError> {
    let mut stmt = conn
        .prepare(&format!("SELECT {DATASOURCE_COLUMNS} FROM datasources ORDER BY name, id"))
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare datasources query"))?;
    let rows = stmt
        .query_map([], datasource_from_row)
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query datasources"))?;
    collect(rows, "Failed to decode datasource row")
}

pub fn list_enabled_datasources(conn: &Connection) -> Result<Vec<Datasource>, AppError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {DATASOURCE_COLUMNS} FROM datasources WHERE enabled = 1 ORDER BY id"
        ))
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare enabled datasources query"))?;
    let rows = stmt
        .query_map([], datasource_from_row)
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query enabled datasources"))?;
    collect(rows, "Failed to decode datasource row")
}

pub fn set_datasource_enabled(conn: &Connection, id: i64, enabled: bool) -> Result<(), AppError> {
    let n = conn
        .execute("UPDATE datasources SET enabled = ?1 WHERE id = ?2", params![enabled, id])
        .map_err(db_err("DB_UPDATE_FAILED", "Failed to update datasource"))?;
    if n == 0 {
        return Err(AppError::not_found("Datasource", id));
    }
    Ok(())
}

/// Opaque claim on a datasource's sync slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLease {
    pub datasource_id: i64,
    pub token: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired(SyncLease),
    /// Another run holds a lease that has not expired yet.
    Busy { expires_at: Option<String> },
}

static LEASE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn new_lease_token(datasource_id: i64, now: OffsetDateTime) -> String {
    let seq = LEASE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let payload = format!(
        "ds={datasource_id}|now={}|pid={}|seq={seq}",
        now.unix_timestamp_nanos(),
        std::process::id()
    );
    hex::encode(Sha256::digest(payload.as_bytes()))
}

fn lease_is_live(ds: &Datasource, now: OffsetDateTime) -> bool {
    if ds.sync_status != SyncStatus::Syncing {
        return false;
    }
    // A syncing row without a parseable expiry is treated as abandoned.
    ds.lease_expires_at
        .as_deref()
        .and_then(|s| parse_utc("lease_expires_at", s).ok())
        .is_some_and(|expires| expires > now)
}

/// Move a datasource into `syncing` and claim its lease, committed immediately so other
/// readers observe the transition. Fails over to `Busy` while another live lease exists.
pub fn acquire_sync_lease(
    conn: &mut Connection,
    datasource_id: i64,
    now: OffsetDateTime,
    ttl: Duration,
) -> Result<LeaseOutcome, AppError> {
    let expires_at = now
        .checked_add(ttl)
        .filter(|_| ttl.is_positive())
        .ok_or_else(|| {
            AppError::new("SYNC_LEASE_TTL_INVALID", "Sync lease duration is out of range")
                .with_details(format!("ttl_seconds={}", ttl.whole_seconds()))
        })?;
    let expires_at = format_utc(expires_at)?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err("DB_TX_FAILED", "Failed to start lease transaction"))?;

    let ds = tx
        .query_row(
            &format!("SELECT {DATASOURCE_COLUMNS} FROM datasources WHERE id = ?1"),
            [datasource_id],
            datasource_from_row,
        )
        .optional()
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query datasource for lease"))?
        .ok_or_else(|| AppError::not_found("Datasource", datasource_id))?;

    if lease_is_live(&ds, now) {
        return Ok(LeaseOutcome::Busy {
            expires_at: ds.lease_expires_at,
        });
    }

    let lease = SyncLease {
        datasource_id,
        token: new_lease_token(datasource_id, now),
        expires_at,
    };
    tx.execute(
        r#"
      UPDATE datasources
      SET sync_status = 'syncing', lease_token = ?1, lease_expires_at = ?2, last_attempt_at = ?3
      WHERE id = ?4
      "#,
        params![lease.token, lease.expires_at, format_utc(now)?, datasource_id],
    )
    .map_err(db_err("DB_UPDATE_FAILED", "Failed to mark datasource as syncing"))?;
    tx.commit()
        .map_err(db_err("DB_TX_FAILED", "Failed to commit lease transaction"))?;

    Ok(LeaseOutcome::Acquired(lease))
}

/// Record a successful run. Returns `false` when the lease was reclaimed in the
/// meantime, in which case the row is left alone.
pub fn complete_sync_success(
    conn: &Connection,
    lease: &SyncLease,
    now: OffsetDateTime,
) -> Result<bool, AppError> {
    let n = conn
        .execute(
            r#"
      UPDATE datasources
      SET sync_status = 'success', last_sync_at = ?1, sync_error = NULL,
          lease_token = NULL, lease_expires_at = NULL
      WHERE id = ?2 AND lease_token = ?3
      "#,
            params![format_utc(now)?, lease.datasource_id, lease.token],
        )
        .map_err(db_err("DB_UPDATE_FAILED", "Failed to record sync success"))?;
    Ok(n == 1)
}

/// Record a failed run; `last_sync_at` keeps the previous success.
pub fn complete_sync_error(conn: &Connection, lease: &SyncLease, message: &str) -> Result<bool, AppError> {
    let n = conn
        .execute(
            r#"
      UPDATE datasources
      SET sync_status = 'error', sync_error = ?1, lease_token = NULL, lease_expires_at = NULL
      WHERE id = ?2 AND lease_token = ?3
      "#,
            params![message, lease.datasource_id, lease.token],
        )
        .map_err(db_err("DB_UPDATE_FAILED", "Failed to record sync error"))?;
    Ok(n == 1)
}

/// Record a failure that happened before a lease could be taken (e.g. the provider
/// could not be configured). Rows currently syncing are not touched.
pub fn mark_sync_failed(
    conn: &Connection,
    datasource_id: i64,
    now: OffsetDateTime,
    message: &str,
) -> Result<(), AppError> {
    conn.execute(
        r#"
      UPDATE datasources
      SET sync_status = 'error', sync_error = ?1, last_attempt_at = ?2
      WHERE id = ?3 AND sync_status != 'syncing'
      "#,
        params![message, format_utc(now)?, datasource_id],
    )
    .map_err(db_err("DB_UPDATE_FAILED", "Failed to record sync failure"))?;
    Ok(())
}

/// Watchdog: move every `syncing` row whose lease has expired (or is missing) into
/// `error`. Returns the ids that were reclaimed.
pub fn reclaim_expired_leases(conn: &mut Connection, now: OffsetDateTime) -> Result<Vec<i64>, AppError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err("DB_TX_FAILED", "Failed to start lease reclaim transaction"))?;

    let syncing = {
        let mut stmt = tx
            .prepare(&format!(
                "SELECT {DATASOURCE_COLUMNS} FROM datasources WHERE sync_status = 'syncing'"
            ))
            .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare syncing datasources query"))?;
        let rows = stmt
            .query_map([], datasource_from_row)
            .map_err(db_err("DB_QUERY_FAILED", "Failed to query syncing datasources"))?;
        collect(rows, "Failed to decode datasource row")?
    };

    let mut reclaimed = Vec::new();
    for ds in syncing.iter().filter(|ds| !lease_is_live(ds, now)) {
        tx.execute(
            r#"
          UPDATE datasources
          SET sync_status = 'error', sync_error = ?1, lease_token = NULL, lease_expires_at = NULL
          WHERE id = ?2 AND sync_status = 'syncing'
          "#,
            params![LEASE_EXPIRED_MESSAGE, ds.id],
        )
        .map_err(db_err("DB_UPDATE_FAILED", "Failed to reclaim expired lease"))?;
        reclaimed.push(ds.id);
    }

    tx.commit()
        .map_err(db_err("DB_TX_FAILED", "Failed to commit lease reclaim transaction"))?;
    Ok(reclaimed)
}
