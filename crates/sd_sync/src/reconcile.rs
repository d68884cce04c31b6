use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sd_core::clock::Clock;
use sd_core::domain::{Datasource, ExternalIncident, IncidentStatus, ValidationWarning};
use sd_core::error::AppError;
use sd_core::repo::datasources::{
    acquire_sync_lease, complete_sync_error, complete_sync_success, LeaseOutcome,
};
use sd_core::repo::external::{
    create_linked_incident, find_link, refresh_linked_incident, resolve_linked_incident,
    CreateOutcome,
};
use sd_core::repo::NewIncident;
use sd_core::timestamps::format_utc;

use crate::error::ProviderError;
use crate::provider::{IncidentQuery, ProviderAdapter};
use crate::settings::SyncSettings;

pub const SYNC_IN_PROGRESS_MESSAGE: &str = "Sync already in progress";

const ACTIVE_STATUSES: [&str; 2] = ["triggered", "acknowledged"];
const RESOLVED_STATUSES: [&str; 1] = ["resolved"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub total_fetched: usize,
    /// Succeeded, but some records were skipped.
    pub partial: bool,
    pub error: Option<String>,
    pub warnings: Vec<ValidationWarning>,
}

impl SyncResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyMode {
    /// Active records: refresh linked incidents, create unlinked ones.
    Upsert,
    /// Recently resolved records: resolve linked incidents, never create.
    UpdateOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Created,
    Updated,
    Ignored,
}

/// Merges one datasource's provider incidents into canonical storage.
pub struct ReconciliationEngine {
    settings: SyncSettings,
    clock: Arc<dyn Clock>,
}

impl ReconciliationEngine {
    pub fn new(settings: SyncSettings, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }

    /// One full run. Always yields a result; failures are recorded on the datasource
    /// row and reported in `error`. Records applied before a failure stay committed.
    pub fn run(
        &self,
        conn: &mut Connection,
        datasource: &Datasource,
        adapter: &dyn ProviderAdapter,
    ) -> SyncResult {
        let started = self.clock.now_utc();
        let lease = match acquire_sync_lease(conn, datasource.id, started, self.settings.lease_ttl) {
            Ok(LeaseOutcome::Acquired(lease)) => lease,
            Ok(LeaseOutcome::Busy { expires_at }) => {
                tracing::info!(
                    datasource_id = datasource.id,
                    lease_expires_at = ?expires_at,
                    "sync rejected, another run holds the lease"
                );
                return SyncResult::failed(SYNC_IN_PROGRESS_MESSAGE);
            }
            Err(e) => {
                tracing::error!(datasource_id = datasource.id, error = %e, "failed to acquire sync lease");
                return SyncResult::failed(e.message);
            }
        };

        tracing::info!(
            datasource_id = datasource.id,
            provider = adapter.name(),
            "sync started"
        );

        let mut result = SyncResult::default();
        match self.reconcile(conn, datasource, adapter, &mut result) {
            Ok(()) => {
                result.success = true;
                result.partial = result.skipped > 0;
                match complete_sync_success(conn, &lease, self.clock.now_utc()) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(datasource_id = datasource.id, "sync lease was reclaimed before completion");
                        result.warnings.push(ValidationWarning::new(
                            "SYNC_LEASE_LOST",
                            "Sync lease expired before completion; datasource status was not updated",
                        ));
                    }
                    Err(e) => {
                        tracing::error!(datasource_id = datasource.id, error = %e, "failed to record sync success");
                        result.success = false;
                        result.partial = false;
                        result.error = Some(e.message);
                    }
                }
            }
            Err(e) => {
                match complete_sync_error(conn, &lease, &e.message) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(datasource_id = datasource.id, "sync lease was reclaimed before failure was recorded")
                    }
                    Err(write_err) => {
                        tracing::error!(datasource_id = datasource.id, error = %write_err, "failed to record sync error")
                    }
                }
                result.success = false;
                result.error = Some(e.message);
            }
        }

        tracing::info!(
            datasource_id = datasource.id,
            success = result.success,
            created = result.created,
            updated = result.updated,
            skipped = result.skipped,
            total_fetched = result.total_fetched,
            error = result.error.as_deref().unwrap_or(""),
            "sync finished"
        );
        result
    }

    fn reconcile(
        &self,
        conn: &mut Connection,
        datasource: &Datasource,
        adapter: &dyn ProviderAdapter,
        result: &mut SyncResult,
    ) -> Result<(), AppError> {
        let active = adapter.fetch_incidents(&IncidentQuery::with_statuses(
            &ACTIVE_STATUSES,
            self.settings.active_fetch_limit,
        ))?;
        result.total_fetched += active.len();
        self.apply_batch(conn, datasource, adapter, &active, ApplyMode::Upsert, result)?;

        let resolved = adapter.fetch_incidents(&IncidentQuery::with_statuses(
            &RESOLVED_STATUSES,
            self.settings.resolved_fetch_limit,
        ))?;
        result.total_fetched += resolved.len();
        self.apply_batch(conn, datasource, adapter, &resolved, ApplyMode::UpdateOnly, result)
    }

    fn apply_batch(
        &self,
        conn: &mut Connection,
        datasource: &Datasource,
        adapter: &dyn ProviderAdapter,
        records: &[Value],
        mode: ApplyMode,
        result: &mut SyncResult,
    ) -> Result<(), AppError> {
        for record in records {
            let external = match adapter.normalize(record) {
                Ok(e) => e,
                Err(ProviderError::Validation(reason)) => {
                    let id = record.get("id").and_then(Value::as_str).unwrap_or("?");
                    tracing::warn!(
                        datasource_id = datasource.id,
                        external_id = id,
                        reason = %reason,
                        "skipping malformed provider record"
                    );
                    result.skipped += 1;
                    result.warnings.push(
                        ValidationWarning::new(
                            "SYNC_RECORD_SKIPPED",
                            format!("Skipped malformed {} record", adapter.name()),
                        )
                        .with_details(format!("external_id={id}; reason={reason}")),
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self.apply_one(conn, datasource, adapter, &external, mode)? {
                Applied::Created => result.created += 1,
                Applied::Updated => result.updated += 1,
                Applied::Ignored => {}
            }
        }
        Ok(())
    }

    fn apply_one(
        &self,
        conn: &mut Connection,
        datasource: &Datasource,
        adapter: &dyn ProviderAdapter,
        external: &ExternalIncident,
        mode: ApplyMode,
    ) -> Result<Applied, AppError> {
        let now = format_utc(self.clock.now_utc())?;
        let raw_json = external.raw.to_string();

        if let Some(link) = find_link(conn, datasource.id, &external.external_id)? {
            match mode {
                ApplyMode::Upsert => refresh_linked_incident(conn, &link, external, &raw_json, &now)?,
                ApplyMode::UpdateOnly => resolve_linked_incident(conn, &link, external, &raw_json, &now)?,
            }
            return Ok(Applied::Updated);
        }

        if mode == ApplyMode::UpdateOnly {
            return Ok(Applied::Ignored);
        }
        self.create_or_adopt(conn, datasource, adapter.name(), external, &raw_json, &now)
    }

    /// Create path for an unlinked record. Losing the insert race to another writer
    /// turns into one refresh of the link that writer made.
    fn create_or_adopt(
        &self,
        conn: &mut Connection,
        datasource: &Datasource,
        source: &str,
        external: &ExternalIncident,
        raw_json: &str,
        now: &str,
    ) -> Result<Applied, AppError> {
        let incident = NewIncident {
            title: external.title.clone(),
            severity: external.severity,
            status: external.status,
            started_at: external.created_at.clone(),
            resolved_at: match external.status {
                IncidentStatus::Resolved => {
                    Some(external.resolved_at.clone().unwrap_or_else(|| now.to_string()))
                }
                _ => None,
            },
            source: source.to_string(),
            created_by: format!("{source}:{}", datasource.name),
        };

        match create_linked_incident(conn, datasource.id, &incident, external, raw_json, now)? {
            CreateOutcome::Created { incident_id, .. } => {
                tracing::debug!(
                    datasource_id = datasource.id,
                    external_id = %external.external_id,
                    incident_id,
                    "created incident from provider record"
                );
                Ok(Applied::Created)
            }
            CreateOutcome::Conflict => {
                let link = find_link(conn, datasource.id, &external.external_id)?.ok_or_else(|| {
                    AppError::new(
                        "SYNC_CONFLICT_UNRESOLVED",
                        "External incident link conflict could not be resolved",
                    )
                    .with_details(format!("external_id={}", external.external_id))
                })?;
                tracing::debug!(
                    datasource_id = datasource.id,
                    external_id = %external.external_id,
                    "record linked concurrently, updating instead"
                );
                refresh_linked_incident(conn, &link, external, raw_json, now)?;
                Ok(Applied::Updated)
            }
        }
    }
}
