use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sd_core::domain::{Datasource, ExternalIncident};
use sd_core::error::AppError;

use crate::error::ProviderError;
use crate::pagerduty::PagerDutyAdapter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ok: bool,
    /// Rendered as `Name (email)`.
    pub identity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncidentQuery {
    /// Provider-native status names.
    pub statuses: Vec<String>,
    /// Empty means the adapter's configured service filter.
    pub service_ids: Vec<String>,
    pub since: Option<String>,
    pub limit: usize,
}

impl IncidentQuery {
    pub fn with_statuses(statuses: &[&str], limit: usize) -> Self {
        Self {
            statuses: statuses.iter().map(|s| s.to_string()).collect(),
            limit,
            ..Self::default()
        }
    }
}

/// Capability surface every external on-call provider implements.
pub trait ProviderAdapter: Send + Sync {
    /// Used as the incident `source` and as the `created_by` prefix.
    fn name(&self) -> &str;

    fn test_connection(&self) -> Result<ConnectionInfo, ProviderError>;

    /// Provider-native records, at most `query.limit`. Each call starts from the first
    /// page.
    fn fetch_incidents(&self, query: &IncidentQuery) -> Result<Vec<serde_json::Value>, ProviderError>;

    fn normalize(&self, record: &serde_json::Value) -> Result<ExternalIncident, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    PagerDuty,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PagerDuty => "pagerduty",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pagerduty" => Ok(Self::PagerDuty),
            _ => Err(AppError::new("CONFIG_UNKNOWN_PROVIDER", format!("Unknown provider: {s}"))),
        }
    }
}

/// Datasource `config_json` as understood by the built-in providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub service_ids: Vec<String>,
    /// Overrides the provider's public API endpoint (mock servers, proxies).
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(raw).map_err(|e| {
            AppError::new("CONFIG_INVALID", format!("Invalid config: {e}"))
        })?;
        if config.api_key.trim().is_empty() {
            return Err(AppError::new("CONFIG_MISSING_API_KEY", "API key not configured"));
        }
        Ok(config)
    }
}

/// Resolves a datasource into a ready adapter.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, datasource: &Datasource) -> Result<Box<dyn ProviderAdapter>, AppError>;
}

#[derive(Debug, Clone, Copy)]
pub struct DefaultAdapterFactory {
    pub request_timeout: Duration,
}

impl AdapterFactory for DefaultAdapterFactory {
    fn build(&self, datasource: &Datasource) -> Result<Box<dyn ProviderAdapter>, AppError> {
        let kind: ProviderKind = datasource.provider_type.parse()?;
        let config = ProviderConfig::from_json(&datasource.config_json)?;
        match kind {
            ProviderKind::PagerDuty => Ok(Box::new(PagerDutyAdapter::new(config, self.request_timeout))),
        }
    }
}
