use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::domain::{
    ComponentStatus, IncidentStatus, MaintenanceStatus, MaintenanceWindow, Severity,
};
use crate::error::AppError;
use crate::repo::{
    list_active_components, list_component_groups, list_in_progress_maintenance,
    list_unresolved_incidents, list_windows_with_status,
};
use crate::status::{compute_global_status, ImpactIndex};
use crate::timestamps::{format_utc, parse_utc};

pub const UNGROUPED_NAME: &str = "Other Services";
pub const UPCOMING_MAINTENANCE_HORIZON_DAYS: i64 = 7;
pub const UPCOMING_MAINTENANCE_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentStatusInfo {
    pub id: i64,
    pub name: String,
    pub tier: i64,
    pub status: ComponentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupStatusInfo {
    /// `None` for the pseudo-group of ungrouped components.
    pub id: Option<i64>,
    pub name: String,
    pub components: Vec<ComponentStatusInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveIncidentSummary {
    pub id: i64,
    pub title: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub started_at: String,
    pub affected_components: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusOverview {
    pub global_status: ComponentStatus,
    pub groups: Vec<GroupStatusInfo>,
    pub active_incidents: Vec<ActiveIncidentSummary>,
    pub upcoming_maintenance: Vec<MaintenanceWindow>,
    pub last_updated: String,
}

/// Aggregated health view, recomputed from current incident and maintenance state.
pub fn compute_status_overview(
    conn: &Connection,
    now: OffsetDateTime,
) -> Result<StatusOverview, AppError> {
    let incidents = list_unresolved_incidents(conn)?;
    let maintenance = list_in_progress_maintenance(conn)?;
    let groups = list_component_groups(conn)?;
    let components = list_active_components(conn)?;

    let index = ImpactIndex::build(&incidents, &maintenance);
    let info = |c: &crate::domain::Component| ComponentStatusInfo {
        id: c.id,
        name: c.name.clone(),
        tier: c.tier,
        status: index.status_for(c.id),
    };

    let mut group_statuses: Vec<GroupStatusInfo> = groups
        .iter()
        .map(|g| GroupStatusInfo {
            id: Some(g.id),
            name: g.name.clone(),
            components: components
                .iter()
                .filter(|c| c.group_id == Some(g.id))
                .map(info)
                .collect(),
        })
        .filter(|g| !g.components.is_empty())
        .collect();

    let known_group = |id: i64| groups.iter().any(|g| g.id == id);
    let ungrouped: Vec<ComponentStatusInfo> = components
        .iter()
        .filter(|c| c.group_id.map_or(true, |id| !known_group(id)))
        .map(info)
        .collect();
    if !ungrouped.is_empty() {
        group_statuses.push(GroupStatusInfo {
            id: None,
            name: UNGROUPED_NAME.to_string(),
            components: ungrouped,
        });
    }

    let global_status = compute_global_status(
        group_statuses
            .iter()
            .flat_map(|g| g.components.iter())
            .map(|c| (c.tier, c.status)),
    );

    let active_incidents = incidents
        .iter()
        .map(|i| ActiveIncidentSummary {
            id: i.incident.id,
            title: i.incident.title.clone(),
            severity: i.incident.severity,
            status: i.incident.status,
            started_at: i.incident.started_at.clone(),
            affected_components: i.links.len(),
        })
        .collect();

    Ok(StatusOverview {
        global_status,
        groups: group_statuses,
        active_incidents,
        upcoming_maintenance: upcoming_maintenance(conn, now)?,
        last_updated: format_utc(now)?,
    })
}

/// Scheduled windows starting within the next week, soonest first.
fn upcoming_maintenance(
    conn: &Connection,
    now: OffsetDateTime,
) -> Result<Vec<MaintenanceWindow>, AppError> {
    let horizon = now + Duration::days(UPCOMING_MAINTENANCE_HORIZON_DAYS);
    let mut upcoming: Vec<(OffsetDateTime, MaintenanceWindow)> = Vec::new();
    for window in list_windows_with_status(conn, MaintenanceStatus::Scheduled)? {
        // Rows with unparseable timestamps are left out rather than failing the overview.
        let Ok(start) = parse_utc("start_at", &window.start_at) else {
            tracing::warn!(maintenance_id = window.id, "skipping maintenance window with bad start_at");
            continue;
        };
        if start >= now && start <= horizon {
            upcoming.push((start, window));
        }
    }
    upcoming.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.id.cmp(&b.1.id)));
    Ok(upcoming
        .into_iter()
        .take(UPCOMING_MAINTENANCE_LIMIT)
        .map(|(_, w)| w)
        .collect())
}
