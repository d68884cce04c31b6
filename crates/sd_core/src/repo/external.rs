use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::{ExternalIncident, ExternalIncidentLink, IncidentStatus};
use crate::error::{db_err, is_unique_constraint_error, AppError};
use crate::repo::{insert_incident, NewIncident};

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<ExternalIncidentLink> {
    Ok(ExternalIncidentLink {
        id: row.get(0)?,
        datasource_id: row.get(1)?,
        external_id: row.get(2)?,
        incident_id: row.get(3)?,
        external_url: row.get(4)?,
        raw_json: row.get(5)?,
        synced_at: row.get(6)?,
    })
}

pub fn find_link(
    conn: &Connection,
    datasource_id: i64,
    external_id: &str,
) -> Result<Option<ExternalIncidentLink>, AppError> {
    conn.query_row(
        r#"
      SELECT id, datasource_id, external_id, incident_id, external_url, raw_json, synced_at
      FROM external_incidents
      WHERE datasource_id = ?1 AND external_id = ?2
      "#,
        params![datasource_id, external_id],
        link_from_row,
    )
    .optional()
    .map_err(db_err("DB_QUERY_FAILED", "Failed to query external incident link"))
}

pub fn count_links(conn: &Connection, datasource_id: i64) -> Result<i64, AppError> {
    conn.query_row(
        "SELECT COUNT(*) FROM external_incidents WHERE datasource_id = ?1",
        [datasource_id],
        |row| row.get(0),
    )
    .map_err(db_err("DB_QUERY_FAILED", "Failed to count external incident links"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { incident_id: i64, link_id: i64 },
    /// Another writer linked the same (datasource, external id) first; nothing was written.
    Conflict,
}

/// Create a canonical incident and its external link atomically.
pub fn create_linked_incident(
    conn: &mut Connection,
    datasource_id: i64,
    incident: &NewIncident,
    external: &ExternalIncident,
    raw_json: &str,
    now: &str,
) -> Result<CreateOutcome, AppError> {
    let tx = conn
        .transaction()
        .map_err(db_err("DB_TX_FAILED", "Failed to start incident import transaction"))?;

    let incident_id = insert_incident(&tx, incident, now)?;

    let res = tx.execute(
        r#"
      INSERT INTO external_incidents(datasource_id, external_id, incident_id, external_url, raw_json, synced_at)
      VALUES (?1, ?2, ?3, ?4, ?5, ?6)
      "#,
        params![
            datasource_id,
            external.external_id,
            incident_id,
            external.html_url,
            raw_json,
            now
        ],
    );

    match res {
        Ok(_) => {
            let link_id = tx.last_insert_rowid();
            tx.commit()
                .map_err(db_err("DB_TX_FAILED", "Failed to commit incident import"))?;
            Ok(CreateOutcome::Created {
                incident_id,
                link_id,
            })
        }
        // Dropping the transaction rolls back the incident insert too.
        Err(e) if is_unique_constraint_error(&e) => Ok(CreateOutcome::Conflict),
        Err(e) => Err(AppError::new("DB_INSERT_FAILED", "Failed to insert external incident link")
            .with_details(format!("external_id={}; err={e}", external.external_id))),
    }
}

/// Refresh the mutable fields of a linked incident from the provider and touch the link.
///
/// A resolved incident without a provider timestamp keeps its own `resolved_at`, or
/// falls back to `now`. A reopened incident has `resolved_at` cleared.
pub fn refresh_linked_incident(
    conn: &mut Connection,
    link: &ExternalIncidentLink,
    external: &ExternalIncident,
    raw_json: &str,
    now: &str,
) -> Result<(), AppError> {
    let tx = conn
        .transaction()
        .map_err(db_err("DB_TX_FAILED", "Failed to start incident refresh transaction"))?;

    if let Some(incident_id) = link.incident_id {
        let resolved = external.status == IncidentStatus::Resolved;
        tx.execute(
            r#"
          UPDATE incidents SET
            title = ?1,
            severity = ?2,
            status = ?3,
            resolved_at = CASE WHEN ?4 THEN COALESCE(?5, resolved_at, ?6) ELSE NULL END,
            updated_at = ?6
          WHERE id = ?7
          "#,
            params![
                external.title,
                external.severity,
                external.status,
                resolved,
                external.resolved_at,
                now,
                incident_id
            ],
        )
        .map_err(db_err("DB_UPDATE_FAILED", "Failed to update linked incident"))?;
    }

    touch_link(&tx, link.id, external, raw_json, now)?;
    tx.commit()
        .map_err(db_err("DB_TX_FAILED", "Failed to commit incident refresh"))?;
    Ok(())
}

/// Mark a linked incident resolved (update-only path for recently resolved records).
pub fn resolve_linked_incident(
    conn: &mut Connection,
    link: &ExternalIncidentLink,
    external: &ExternalIncident,
    raw_json: &str,
    now: &str,
) -> Result<(), AppError> {
    let tx = conn
        .transaction()
        .map_err(db_err("DB_TX_FAILED", "Failed to start incident resolve transaction"))?;

    if let Some(incident_id) = link.incident_id {
        tx.execute(
            r#"
          UPDATE incidents SET
            status = 'resolved',
            resolved_at = COALESCE(?1, resolved_at, ?2),
            updated_at = ?2
          WHERE id = ?3
          "#,
            params![external.resolved_at, now, incident_id],
        )
        .map_err(db_err("DB_UPDATE_FAILED", "Failed to resolve linked incident"))?;
    }

    touch_link(&tx, link.id, external, raw_json, now)?;
    tx.commit()
        .map_err(db_err("DB_TX_FAILED", "Failed to commit incident resolve"))?;
    Ok(())
}

fn touch_link(
    conn: &Connection,
    link_id: i64,
    external: &ExternalIncident,
    raw_json: &str,
    now: &str,
) -> Result<(), AppError> {
    conn.execute(
        r#"
      UPDATE external_incidents
      SET raw_json = ?1, external_url = COALESCE(?2, external_url), synced_at = ?3
      WHERE id = ?4
      "#,
        params![raw_json, external.html_url, now, link_id],
    )
    .map_err(db_err("DB_UPDATE_FAILED", "Failed to refresh external incident link"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::domain::Severity;
    use crate::repo::datasources::{insert_datasource, NewDatasource};
    use crate::repo::{count_incidents, get_incident};

    fn setup() -> (Connection, i64) {
        let mut conn = db::open_in_memory().expect("open");
        db::migrate(&mut conn).expect("migrate");
        let ds = insert_datasource(
            &conn,
            &NewDatasource {
                name: "pd".to_string(),
                provider_type: "pagerduty".to_string(),
                config_json: "{}".to_string(),
                enabled: true,
                sync_interval_seconds: 60,
            },
            "2026-01-01T00:00:00Z",
        )
        .unwrap();
        (conn, ds)
    }

    fn external(status: IncidentStatus) -> ExternalIncident {
        ExternalIncident {
            external_id: "P1".to_string(),
            title: "Checkout down".to_string(),
            severity: Severity::Critical,
            status,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            resolved_at: None,
            html_url: Some("https://pd.example/incidents/P1".to_string()),
            raw: serde_json::json!({"id": "P1"}),
        }
    }

    fn new_incident(e: &ExternalIncident) -> NewIncident {
        NewIncident {
            title: e.title.clone(),
            severity: e.severity,
            status: e.status,
            started_at: e.created_at.clone(),
            resolved_at: None,
            source: "pagerduty".to_string(),
            created_by: "pagerduty:pd".to_string(),
        }
    }

    #[test]
    fn duplicate_create_reports_conflict_and_rolls_back_incident() {
        let (mut conn, ds) = setup();
        let e = external(IncidentStatus::Investigating);
        let now = "2026-01-01T00:01:00Z";

        let first = create_linked_incident(&mut conn, ds, &new_incident(&e), &e, "{}", now).unwrap();
        assert!(matches!(first, CreateOutcome::Created { .. }));

        let second = create_linked_incident(&mut conn, ds, &new_incident(&e), &e, "{}", now).unwrap();
        assert_eq!(second, CreateOutcome::Conflict);
        assert_eq!(count_incidents(&conn).unwrap(), 1);
        assert_eq!(count_links(&conn, ds).unwrap(), 1);
    }

    #[test]
    fn resolve_without_provider_timestamp_falls_back_to_now() {
        let (mut conn, ds) = setup();
        let e = external(IncidentStatus::Investigating);
        let CreateOutcome::Created { incident_id, .. } =
            create_linked_incident(&mut conn, ds, &new_incident(&e), &e, "{}", "2026-01-01T00:01:00Z")
                .unwrap()
        else {
            panic!("expected create");
        };

        let link = find_link(&conn, ds, "P1").unwrap().unwrap();
        let resolved = external(IncidentStatus::Resolved);
        resolve_linked_incident(&mut conn, &link, &resolved, "{}", "2026-01-01T00:09:00Z").unwrap();

        let incident = get_incident(&conn, incident_id).unwrap();
        assert_eq!(incident.status, IncidentStatus::Resolved);
        assert_eq!(incident.resolved_at.as_deref(), Some("2026-01-01T00:09:00Z"));
    }

    #[test]
    fn reopened_incident_clears_resolved_at() {
        let (mut conn, ds) = setup();
        let mut resolved = external(IncidentStatus::Resolved);
        resolved.resolved_at = Some("2026-01-01T00:05:00Z".to_string());
        let mut incident = new_incident(&resolved);
        incident.resolved_at = resolved.resolved_at.clone();
        let CreateOutcome::Created { incident_id, .. } =
            create_linked_incident(&mut conn, ds, &incident, &resolved, "{}", "2026-01-01T00:06:00Z")
                .unwrap()
        else {
            panic!("expected create");
        };

        let link = find_link(&conn, ds, "P1").unwrap().unwrap();
        let reopened = external(IncidentStatus::Investigating);
        refresh_linked_incident(&mut conn, &link, &reopened, "{}", "2026-01-01T00:10:00Z").unwrap();

        let incident = get_incident(&conn, incident_id).unwrap();
        assert_eq!(incident.status, IncidentStatus::Investigating);
        assert_eq!(incident.resolved_at, None);
    }
}
