use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Component, ComponentGroup, Impact, ImpactLink, Incident, IncidentStatus, IncidentWithLinks,
    MaintenanceStatus, MaintenanceWindow, MaintenanceWithLinks, Severity, TIER_CRITICAL, TIER_LOW,
};
use crate::error::{db_err, AppError};
use crate::timestamps::parse_utc;

pub mod datasources;
pub mod external;

const INCIDENT_COLUMNS: &str =
    "id, title, severity, status, started_at, resolved_at, source, created_by";

pub(crate) fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        title: row.get(1)?,
        severity: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        resolved_at: row.get(5)?,
        source: row.get(6)?,
        created_by: row.get(7)?,
    })
}

fn component_from_row(row: &Row<'_>) -> rusqlite::Result<Component> {
    Ok(Component {
        id: row.get(0)?,
        group_id: row.get(1)?,
        name: row.get(2)?,
        tier: row.get(3)?,
        is_active: row.get(4)?,
        display_order: row.get(5)?,
    })
}

fn window_from_row(row: &Row<'_>) -> rusqlite::Result<MaintenanceWindow> {
    Ok(MaintenanceWindow {
        id: row.get(0)?,
        title: row.get(1)?,
        status: row.get(2)?,
        start_at: row.get(3)?,
        end_at: row.get(4)?,
    })
}

pub(crate) fn collect<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    message: &'static str,
) -> Result<Vec<T>, AppError> {
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(db_err("DB_QUERY_FAILED", message))?);
    }
    Ok(out)
}

fn is_decode_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
    )
}

/// Like `collect`, but rows whose values do not decode are logged and dropped.
/// Statement failures still abort.
pub(crate) fn collect_readable<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &'static str,
) -> Result<Vec<T>, AppError> {
    let mut out = Vec::new();
    for r in rows {
        match r {
            Ok(v) => out.push(v),
            Err(e) if is_decode_error(&e) => {
                tracing::warn!(row = what, error = %e, "skipping unreadable row");
            }
            Err(e) => {
                return Err(AppError::new("DB_QUERY_FAILED", format!("Failed to read {what} rows"))
                    .with_details(e.to_string()))
            }
        }
    }
    Ok(out)
}

pub fn list_component_groups(conn: &Connection) -> Result<Vec<ComponentGroup>, AppError> {
    let mut stmt = conn
        .prepare("SELECT id, name, display_order FROM component_groups ORDER BY display_order, name, id")
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare component groups query"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ComponentGroup {
                id: row.get(0)?,
                name: row.get(1)?,
                display_order: row.get(2)?,
            })
        })
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query component groups"))?;
    collect(rows, "Failed to decode component group row")
}

/// Active components ordered for display: (display_order, name).
pub fn list_active_components(conn: &Connection) -> Result<Vec<Component>, AppError> {
    let mut stmt = conn
        .prepare(
            r#"
      SELECT id, group_id, name, tier, is_active, display_order
      FROM components
      WHERE is_active = 1
      ORDER BY display_order, name, id
      "#,
        )
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare components query"))?;
    let rows = stmt
        .query_map([], component_from_row)
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query components"))?;
    collect_readable(rows, "component")
}

pub fn get_incident(conn: &Connection, id: i64) -> Result<Incident, AppError> {
    conn.query_row(
        &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
        [id],
        incident_from_row,
    )
    .optional()
    .map_err(db_err("DB_QUERY_FAILED", "Failed to query incident"))?
    .ok_or_else(|| AppError::not_found("Incident", id))
}

pub fn count_incidents(conn: &Connection) -> Result<i64, AppError> {
    conn.query_row("SELECT COUNT(*) FROM incidents", [], |row| row.get(0))
        .map_err(db_err("DB_QUERY_FAILED", "Failed to count incidents"))
}

/// Unresolved incidents with their component impact links, newest `started_at` first.
pub fn list_unresolved_incidents(conn: &Connection) -> Result<Vec<IncidentWithLinks>, AppError> {
    let incidents = {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE status != ?1 ORDER BY started_at DESC, id DESC"
            ))
            .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare unresolved incidents query"))?;
        let rows = stmt
            .query_map([IncidentStatus::Resolved], incident_from_row)
            .map_err(db_err("DB_QUERY_FAILED", "Failed to query unresolved incidents"))?;
        collect_readable(rows, "incident")?
    };

    let mut links = load_links(
        conn,
        r#"
      SELECT ic.incident_id, ic.component_id, ic.impact
      FROM incident_components ic
      JOIN incidents i ON i.id = ic.incident_id
      WHERE i.status != 'resolved'
      "#,
    )?;

    Ok(incidents
        .into_iter()
        .map(|incident| IncidentWithLinks {
            links: links.remove(&incident.id).unwrap_or_default(),
            incident,
        })
        .collect())
}

/// In-progress maintenance windows with the components they touch.
pub fn list_in_progress_maintenance(
    conn: &Connection,
) -> Result<Vec<MaintenanceWithLinks>, AppError> {
    let windows = list_windows_with_status(conn, MaintenanceStatus::InProgress)?;
    let mut links = load_links(
        conn,
        r#"
      SELECT mc.maintenance_id, mc.component_id, mc.expected_impact
      FROM maintenance_components mc
      JOIN maintenance_windows m ON m.id = mc.maintenance_id
      WHERE m.status = 'in_progress'
      "#,
    )?;

    Ok(windows
        .into_iter()
        .map(|window| MaintenanceWithLinks {
            links: links.remove(&window.id).unwrap_or_default(),
            window,
        })
        .collect())
}

pub fn list_windows_with_status(
    conn: &Connection,
    status: MaintenanceStatus,
) -> Result<Vec<MaintenanceWindow>, AppError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title, status, start_at, end_at FROM maintenance_windows WHERE status = ?1 ORDER BY start_at, id",
        )
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare maintenance query"))?;
    let rows = stmt
        .query_map([status], window_from_row)
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query maintenance windows"))?;
    collect_readable(rows, "maintenance window")
}

fn load_links(conn: &Connection, sql: &str) -> Result<HashMap<i64, Vec<ImpactLink>>, AppError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare component links query"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                ImpactLink {
                    component_id: row.get(1)?,
                    impact: row.get(2)?,
                },
            ))
        })
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query component links"))?;

    let mut out: HashMap<i64, Vec<ImpactLink>> = HashMap::new();
    for (owner, link) in collect_readable(rows, "component link")? {
        out.entry(owner).or_default().push(link);
    }
    Ok(out)
}

// Insert helpers. Full CRUD for the catalog lives with the management API; these
// cover seeding and what the engine itself writes.

pub fn insert_component_group(
    conn: &Connection,
    name: &str,
    display_order: i64,
) -> Result<i64, AppError> {
    conn.execute(
        "INSERT INTO component_groups(name, display_order) VALUES (?1, ?2)",
        params![name, display_order],
    )
    .map_err(db_err("DB_INSERT_FAILED", "Failed to insert component group"))?;
    Ok(conn.last_insert_rowid())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewComponent {
    pub group_id: Option<i64>,
    pub name: String,
    pub tier: i64,
    pub is_active: bool,
    pub display_order: i64,
}

pub fn insert_component(conn: &Connection, c: &NewComponent) -> Result<i64, AppError> {
    if !(TIER_CRITICAL..=TIER_LOW).contains(&c.tier) {
        return Err(AppError::new("VALIDATION_TIER_OUT_OF_RANGE", "Component tier must be 0..=3")
            .with_details(format!("tier={}", c.tier)));
    }
    conn.execute(
        "INSERT INTO components(group_id, name, tier, is_active, display_order) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![c.group_id, c.name, c.tier, c.is_active, c.display_order],
    )
    .map_err(db_err("DB_INSERT_FAILED", "Failed to insert component"))?;
    Ok(conn.last_insert_rowid())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewIncident {
    pub title: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub started_at: String,
    pub resolved_at: Option<String>,
    pub source: String,
    pub created_by: String,
}

pub fn insert_incident(conn: &Connection, i: &NewIncident, now: &str) -> Result<i64, AppError> {
    conn.execute(
        r#"
      INSERT INTO incidents(title, severity, status, started_at, resolved_at, source, created_by, created_at, updated_at)
      VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
      "#,
        params![i.title, i.severity, i.status, i.started_at, i.resolved_at, i.source, i.created_by, now],
    )
    .map_err(db_err("DB_INSERT_FAILED", "Failed to insert incident"))?;
    Ok(conn.last_insert_rowid())
}

pub fn link_incident_component(
    conn: &Connection,
    incident_id: i64,
    component_id: i64,
    impact: Impact,
) -> Result<(), AppError> {
    conn.execute(
        r#"
      INSERT INTO incident_components(incident_id, component_id, impact) VALUES (?1, ?2, ?3)
      ON CONFLICT(incident_id, component_id) DO UPDATE SET impact = excluded.impact
      "#,
        params![incident_id, component_id, impact],
    )
    .map_err(db_err("DB_INSERT_FAILED", "Failed to link incident to component"))?;
    Ok(())
}

pub fn insert_maintenance_window(
    conn: &Connection,
    title: &str,
    status: MaintenanceStatus,
    start_at: &str,
    end_at: &str,
) -> Result<i64, AppError> {
    let start = parse_utc("start_at", start_at)?;
    let end = parse_utc("end_at", end_at)?;
    if start >= end {
        return Err(AppError::new(
            "VALIDATION_MAINTENANCE_WINDOW",
            "Maintenance start_at must be before end_at",
        )
        .with_details(format!("start_at={start_at}; end_at={end_at}")));
    }
    conn.execute(
        "INSERT INTO maintenance_windows(title, status, start_at, end_at) VALUES (?1, ?2, ?3, ?4)",
        params![title, status, start_at, end_at],
    )
    .map_err(db_err("DB_INSERT_FAILED", "Failed to insert maintenance window"))?;
    Ok(conn.last_insert_rowid())
}

pub fn link_maintenance_component(
    conn: &Connection,
    maintenance_id: i64,
    component_id: i64,
    expected_impact: Impact,
) -> Result<(), AppError> {
    conn.execute(
        r#"
      INSERT INTO maintenance_components(maintenance_id, component_id, expected_impact) VALUES (?1, ?2, ?3)
      ON CONFLICT(maintenance_id, component_id) DO UPDATE SET expected_impact = excluded.expected_impact
      "#,
        params![maintenance_id, component_id, expected_impact],
    )
    .map_err(db_err("DB_INSERT_FAILED", "Failed to link maintenance to component"))?;
    Ok(())
}
