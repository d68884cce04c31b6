use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use sd_core::error::AppError;
use sd_sync::settings::{
    default_lease_ttl, MAX_ACTIVE_FETCH_LIMIT, MAX_LEASE_TTL_SECS, MAX_REQUEST_TIMEOUT_SECS,
    MAX_RESOLVED_FETCH_LIMIT, MIN_REQUEST_TIMEOUT_SECS,
};
use sd_sync::SyncSettings;

fn default_db_path() -> PathBuf {
    PathBuf::from("statusdash.sqlite")
}

fn default_tick_seconds() -> u64 {
    sd_sync::scheduler::DEFAULT_TICK_SECONDS
}

fn default_request_timeout_secs() -> u64 {
    sd_sync::settings::DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_active_fetch_limit() -> usize {
    sd_sync::settings::DEFAULT_ACTIVE_FETCH_LIMIT
}

fn default_resolved_fetch_limit() -> usize {
    sd_sync::settings::DEFAULT_RESOLVED_FETCH_LIMIT
}

fn default_overview_ttl_secs() -> i64 {
    sd_core::cache::OVERVIEW_TTL_SECONDS
}

/// `statusdash.toml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Defaults to two request timeouts per expected page plus a minute.
    #[serde(default)]
    pub lease_ttl_secs: Option<i64>,
    #[serde(default = "default_active_fetch_limit")]
    pub active_fetch_limit: usize,
    #[serde(default = "default_resolved_fetch_limit")]
    pub resolved_fetch_limit: usize,
    #[serde(default = "default_overview_ttl_secs")]
    pub overview_ttl_secs: i64,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            tick_seconds: default_tick_seconds(),
            request_timeout_secs: default_request_timeout_secs(),
            lease_ttl_secs: None,
            active_fetch_limit: default_active_fetch_limit(),
            resolved_fetch_limit: default_resolved_fetch_limit(),
            overview_ttl_secs: default_overview_ttl_secs(),
            log_json: false,
        }
    }
}

impl AppConfig {
    /// Read and validate a config file; no path means built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|e| {
            AppError::new("CONFIG_READ_FAILED", "Failed to read config file")
                .with_details(format!("path={}; err={e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, AppError> {
        let config: Self = toml::from_str(text).map_err(|e| {
            AppError::new("CONFIG_PARSE_FAILED", "Failed to parse config file").with_details(e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(MIN_REQUEST_TIMEOUT_SECS..=MAX_REQUEST_TIMEOUT_SECS).contains(&self.request_timeout_secs) {
            return Err(invalid(
                "request_timeout_secs",
                format!("must be between {MIN_REQUEST_TIMEOUT_SECS} and {MAX_REQUEST_TIMEOUT_SECS}"),
                self.request_timeout_secs,
            ));
        }
        if self.tick_seconds == 0 {
            return Err(invalid("tick_seconds", "must be at least 1".to_string(), self.tick_seconds));
        }
        if !(1..=MAX_RESOLVED_FETCH_LIMIT).contains(&self.resolved_fetch_limit) {
            return Err(invalid(
                "resolved_fetch_limit",
                format!("must be between 1 and {MAX_RESOLVED_FETCH_LIMIT}"),
                self.resolved_fetch_limit,
            ));
        }
        if !(1..=MAX_ACTIVE_FETCH_LIMIT).contains(&self.active_fetch_limit) {
            return Err(invalid(
                "active_fetch_limit",
                format!("must be between 1 and {MAX_ACTIVE_FETCH_LIMIT}"),
                self.active_fetch_limit,
            ));
        }
        if let Some(ttl) = self.lease_ttl_secs {
            if ttl <= self.request_timeout_secs as i64 || ttl > MAX_LEASE_TTL_SECS {
                return Err(invalid(
                    "lease_ttl_secs",
                    format!("must exceed request_timeout_secs and be at most {MAX_LEASE_TTL_SECS}"),
                    ttl,
                ));
            }
        }
        if self.overview_ttl_secs < 0 {
            return Err(invalid(
                "overview_ttl_secs",
                "must not be negative".to_string(),
                self.overview_ttl_secs,
            ));
        }
        Ok(())
    }

    pub fn to_sync_settings(&self) -> SyncSettings {
        let request_timeout = Duration::from_secs(self.request_timeout_secs);
        SyncSettings {
            request_timeout,
            lease_ttl: self
                .lease_ttl_secs
                .map(time::Duration::seconds)
                .unwrap_or_else(|| {
                    default_lease_ttl(
                        request_timeout,
                        self.active_fetch_limit,
                        self.resolved_fetch_limit,
                    )
                }),
            active_fetch_limit: self.active_fetch_limit,
            resolved_fetch_limit: self.resolved_fetch_limit,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }
}

fn invalid(field: &str, rule: String, value: impl std::fmt::Display) -> AppError {
    AppError::new("CONFIG_INVALID_VALUE", format!("{field} {rule}")).with_details(format!("value={value}"))
}
