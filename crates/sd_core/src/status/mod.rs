use std::collections::HashMap;

use crate::domain::{
    ComponentStatus, Impact, IncidentWithLinks, MaintenanceStatus, MaintenanceWithLinks,
};

/// Highest tier whose major outage is surfaced globally as a major outage.
const GLOBAL_OUTAGE_MAX_TIER: i64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ComponentImpact {
    outage: bool,
    degraded: bool,
    maintenance: bool,
}

/// Impact of unresolved incidents and in-progress maintenance, indexed by component id.
///
/// Built once per evaluation batch so per-component lookups are O(1). Resolved
/// incidents and windows that are not in progress are ignored.
#[derive(Debug, Clone, Default)]
pub struct ImpactIndex {
    by_component: HashMap<i64, ComponentImpact>,
}

impl ImpactIndex {
    pub fn build(incidents: &[IncidentWithLinks], maintenance: &[MaintenanceWithLinks]) -> Self {
        let mut by_component: HashMap<i64, ComponentImpact> = HashMap::new();

        for item in incidents.iter().filter(|i| !i.incident.is_resolved()) {
            for link in &item.links {
                let entry = by_component.entry(link.component_id).or_default();
                match link.impact {
                    Impact::Outage => entry.outage = true,
                    Impact::Degraded => entry.degraded = true,
                }
            }
        }

        for item in maintenance
            .iter()
            .filter(|m| m.window.status == MaintenanceStatus::InProgress)
        {
            for link in &item.links {
                by_component.entry(link.component_id).or_default().maintenance = true;
            }
        }

        Self { by_component }
    }

    /// Outage beats degraded beats maintenance beats operational.
    pub fn status_for(&self, component_id: i64) -> ComponentStatus {
        match self.by_component.get(&component_id) {
            Some(i) if i.outage => ComponentStatus::MajorOutage,
            Some(i) if i.degraded => ComponentStatus::Degraded,
            Some(i) if i.maintenance => ComponentStatus::Maintenance,
            _ => ComponentStatus::Operational,
        }
    }
}

/// Status of a single component. For many components build an [`ImpactIndex`] once
/// and call [`ImpactIndex::status_for`] instead.
pub fn compute_component_status(
    component_id: i64,
    unresolved_incidents: &[IncidentWithLinks],
    active_maintenance: &[MaintenanceWithLinks],
) -> ComponentStatus {
    ImpactIndex::build(unresolved_incidents, active_maintenance).status_for(component_id)
}

/// Global status from `(tier, status)` pairs of every active component.
///
/// A major outage on a tier 0/1 component is global. Lower-tier major outages are
/// downgraded to a partial outage, and partial outages or degradations anywhere show
/// as degraded. Maintenance does not affect global status.
pub fn compute_global_status<I>(statuses: I) -> ComponentStatus
where
    I: IntoIterator<Item = (i64, ComponentStatus)>,
{
    let mut has_outage = false;
    let mut has_partial = false;
    let mut has_degraded = false;

    for (tier, status) in statuses {
        match status {
            ComponentStatus::MajorOutage if tier <= GLOBAL_OUTAGE_MAX_TIER => {
                return ComponentStatus::MajorOutage;
            }
            ComponentStatus::MajorOutage => has_outage = true,
            ComponentStatus::PartialOutage => has_partial = true,
            ComponentStatus::Degraded => has_degraded = true,
            ComponentStatus::Operational | ComponentStatus::Maintenance => {}
        }
    }

    if has_outage {
        ComponentStatus::PartialOutage
    } else if has_partial || has_degraded {
        ComponentStatus::Degraded
    } else {
        ComponentStatus::Operational
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ImpactLink, Incident, IncidentStatus, MaintenanceWindow, Severity,
    };

    fn incident(id: i64, status: IncidentStatus, links: &[(i64, Impact)]) -> IncidentWithLinks {
        IncidentWithLinks {
            incident: Incident {
                id,
                title: format!("incident {id}"),
                severity: Severity::Major,
                status,
                started_at: "2026-01-01T00:00:00Z".to_string(),
                resolved_at: None,
                source: "manual".to_string(),
                created_by: "test".to_string(),
            },
            links: links
                .iter()
                .map(|&(component_id, impact)| ImpactLink {
                    component_id,
                    impact,
                })
                .collect(),
        }
    }

    fn maintenance(id: i64, status: MaintenanceStatus, components: &[i64]) -> MaintenanceWithLinks {
        MaintenanceWithLinks {
            window: MaintenanceWindow {
                id,
                title: format!("window {id}"),
                status,
                start_at: "2026-01-01T00:00:00Z".to_string(),
                end_at: "2026-01-01T02:00:00Z".to_string(),
            },
            links: components
                .iter()
                .map(|&component_id| ImpactLink {
                    component_id,
                    impact: Impact::Degraded,
                })
                .collect(),
        }
    }

    #[test]
    fn no_links_is_operational() {
        assert_eq!(compute_component_status(1, &[], &[]), ComponentStatus::Operational);
        let other = [incident(1, IncidentStatus::Investigating, &[(2, Impact::Outage)])];
        assert_eq!(compute_component_status(1, &other, &[]), ComponentStatus::Operational);
    }

    #[test]
    fn outage_dominates_concurrent_maintenance_and_degradation() {
        let incidents = [
            incident(1, IncidentStatus::Identified, &[(7, Impact::Degraded)]),
            incident(2, IncidentStatus::Investigating, &[(7, Impact::Outage)]),
        ];
        let windows = [maintenance(1, MaintenanceStatus::InProgress, &[7])];
        assert_eq!(
            compute_component_status(7, &incidents, &windows),
            ComponentStatus::MajorOutage
        );
    }

    #[test]
    fn degraded_beats_maintenance() {
        let incidents = [incident(1, IncidentStatus::Monitoring, &[(7, Impact::Degraded)])];
        let windows = [maintenance(1, MaintenanceStatus::InProgress, &[7])];
        assert_eq!(compute_component_status(7, &incidents, &windows), ComponentStatus::Degraded);
    }

    #[test]
    fn only_in_progress_maintenance_counts() {
        let windows = [
            maintenance(1, MaintenanceStatus::Scheduled, &[7]),
            maintenance(2, MaintenanceStatus::Completed, &[7]),
        ];
        assert_eq!(compute_component_status(7, &[], &windows), ComponentStatus::Operational);

        let windows = [maintenance(3, MaintenanceStatus::InProgress, &[7])];
        assert_eq!(compute_component_status(7, &[], &windows), ComponentStatus::Maintenance);
    }

    #[test]
    fn resolved_incidents_are_ignored() {
        let incidents = [incident(1, IncidentStatus::Resolved, &[(7, Impact::Outage)])];
        assert_eq!(compute_component_status(7, &incidents, &[]), ComponentStatus::Operational);
    }

    #[test]
    fn critical_tier_outage_is_global_major_outage() {
        let statuses = [
            (0, ComponentStatus::MajorOutage),
            (2, ComponentStatus::Operational),
            (3, ComponentStatus::Operational),
        ];
        assert_eq!(compute_global_status(statuses), ComponentStatus::MajorOutage);
        assert_eq!(
            compute_global_status([(1, ComponentStatus::MajorOutage)]),
            ComponentStatus::MajorOutage
        );
    }

    #[test]
    fn low_tier_outage_is_downgraded_to_partial() {
        let statuses = [
            (3, ComponentStatus::MajorOutage),
            (0, ComponentStatus::Degraded),
            (1, ComponentStatus::Operational),
        ];
        assert_eq!(compute_global_status(statuses), ComponentStatus::PartialOutage);
    }

    #[test]
    fn partial_or_degraded_anywhere_is_degraded() {
        assert_eq!(
            compute_global_status([(2, ComponentStatus::PartialOutage)]),
            ComponentStatus::Degraded
        );
        assert_eq!(
            compute_global_status([(0, ComponentStatus::Degraded), (3, ComponentStatus::Maintenance)]),
            ComponentStatus::Degraded
        );
    }

    #[test]
    fn empty_or_maintenance_only_is_operational() {
        assert_eq!(compute_global_status(Vec::new()), ComponentStatus::Operational);
        assert_eq!(
            compute_global_status([(0, ComponentStatus::Maintenance)]),
            ComponentStatus::Operational
        );
    }
}
