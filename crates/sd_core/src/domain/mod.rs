use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Closed set of lowercase string values stored in TEXT columns and sent on the wire.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(AppError::new(
                        "DOMAIN_INVALID_VALUE",
                        concat!("Invalid ", stringify!($name), " value"),
                    )
                    .with_details(format!("value={other}"))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                s.parse().map_err(|e: AppError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum!(
    /// Incident severity levels.
    Severity {
        Critical => "critical",
        Major => "major",
        Minor => "minor",
        Info => "info",
    }
);

text_enum!(
    /// Incident lifecycle; `Resolved` is terminal for manual edits.
    IncidentStatus {
        Investigating => "investigating",
        Identified => "identified",
        Monitoring => "monitoring",
        Resolved => "resolved",
    }
);

text_enum!(
    /// Impact an incident or maintenance window imposes on one component.
    Impact {
        Degraded => "degraded",
        Outage => "outage",
    }
);

text_enum!(
    MaintenanceStatus {
        Scheduled => "scheduled",
        InProgress => "in_progress",
        Completed => "completed",
        Canceled => "canceled",
    }
);

text_enum!(
    /// Derived operational status of a component, or of the whole system.
    /// Never persisted.
    ComponentStatus {
        Operational => "operational",
        Degraded => "degraded",
        PartialOutage => "partial_outage",
        MajorOutage => "major_outage",
        Maintenance => "maintenance",
    }
);

text_enum!(
    SyncStatus {
        Idle => "idle",
        Syncing => "syncing",
        Success => "success",
        Error => "error",
    }
);

/// Highest criticality tier.
pub const TIER_CRITICAL: i64 = 0;
/// Lowest criticality tier.
pub const TIER_LOW: i64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentGroup {
    pub id: i64,
    pub name: String,
    pub display_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Component {
    pub id: i64,
    pub group_id: Option<i64>,
    pub name: String,
    /// 0 = critical ... 3 = low. Only used to weight global status.
    pub tier: i64,
    pub is_active: bool,
    pub display_order: i64,
}

/// Canonical incident.
///
/// Timestamps are RFC3339 UTC strings. `source` is `manual` or the provider name that
/// imported the incident.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Incident {
    pub id: i64,
    pub title: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub started_at: String,
    pub resolved_at: Option<String>,
    pub source: String,
    pub created_by: String,
}

impl Incident {
    pub fn is_resolved(&self) -> bool {
        self.status == IncidentStatus::Resolved
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImpactLink {
    pub component_id: i64,
    pub impact: Impact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncidentWithLinks {
    pub incident: Incident,
    pub links: Vec<ImpactLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceWindow {
    pub id: i64,
    pub title: String,
    pub status: MaintenanceStatus,
    pub start_at: String,
    pub end_at: String,
}

/// Maintenance window with the components it touches (`impact` is the expected impact).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceWithLinks {
    pub window: MaintenanceWindow,
    pub links: Vec<ImpactLink>,
}

/// Configured external on-call integration.
///
/// `config_json` is the opaque provider configuration (credentials, service filter);
/// its storage and encryption are owned by the datasource management layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Datasource {
    pub id: i64,
    pub name: String,
    pub provider_type: String,
    #[serde(skip_serializing)]
    pub config_json: String,
    pub enabled: bool,
    pub sync_interval_seconds: i64,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
    pub last_sync_at: Option<String>,
    pub last_attempt_at: Option<String>,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<String>,
}

/// Dedup record mapping one provider incident id to at most one canonical incident.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalIncidentLink {
    pub id: i64,
    pub datasource_id: i64,
    pub external_id: String,
    pub incident_id: Option<i64>,
    pub external_url: Option<String>,
    pub raw_json: Option<String>,
    pub synced_at: String,
}

/// Provider-neutral view of one provider incident, already mapped onto internal enums.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalIncident {
    pub external_id: String,
    pub title: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    /// Canonical RFC3339 UTC.
    pub created_at: String,
    /// Canonical RFC3339 UTC, present only when the provider reports one.
    pub resolved_at: Option<String>,
    pub html_url: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationWarning {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

impl ValidationWarning {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_enums_round_trip_through_strings() {
        assert_eq!("in_progress".parse::<MaintenanceStatus>().unwrap(), MaintenanceStatus::InProgress);
        assert_eq!(ComponentStatus::PartialOutage.as_str(), "partial_outage");
        assert_eq!(
            serde_json::to_string(&ComponentStatus::MajorOutage).unwrap(),
            "\"major_outage\""
        );
    }

    #[test]
    fn unknown_text_enum_value_is_structured_error() {
        let err = "sev0".parse::<Severity>().unwrap_err();
        assert_eq!(err.code, "DOMAIN_INVALID_VALUE");
        assert_eq!(err.details.as_deref(), Some("value=sev0"));
    }
}
