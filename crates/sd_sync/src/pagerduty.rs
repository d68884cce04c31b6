use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use sd_core::domain::{ExternalIncident, IncidentStatus, Severity};
use sd_core::timestamps::normalize_timestamp;

use crate::error::ProviderError;
use crate::provider::{ConnectionInfo, IncidentQuery, ProviderAdapter, ProviderConfig};
use crate::settings::FETCH_PAGE_SIZE;

pub const PROVIDER_NAME: &str = "pagerduty";
pub const DEFAULT_BASE_URL: &str = "https://api.pagerduty.com";
const ACCEPT: &str = "application/vnd.pagerduty+json;version=2";
const ERROR_BODY_LIMIT: usize = 200;

/// PagerDuty REST API v2 client.
#[derive(Debug, Clone)]
pub struct PagerDutyAdapter {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
    service_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    user: User,
}

#[derive(Debug, Deserialize)]
struct User {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncidentPage {
    #[serde(default)]
    incidents: Vec<Value>,
    #[serde(default)]
    more: bool,
}

impl PagerDutyAdapter {
    pub fn new(config: ProviderConfig, request_timeout: Duration) -> Self {
        let base_url = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Self {
            agent: ureq::AgentBuilder::new().timeout(request_timeout).build(),
            api_key: config.api_key,
            base_url,
            service_ids: config.service_ids,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> ureq::Request {
        self.agent
            .get(&format!("{}{path}", self.base_url))
            .set("Authorization", &format!("Token token={}", self.api_key))
            .set("Accept", ACCEPT)
            .set("Content-Type", "application/json")
    }

    fn fetch_page(
        &self,
        query: &IncidentQuery,
        service_ids: &[String],
        offset: usize,
        page_size: usize,
    ) -> Result<IncidentPage, ProviderError> {
        let mut req = self
            .get("/incidents")
            .query("limit", &page_size.to_string())
            .query("offset", &offset.to_string())
            .query("sort_by", "created_at:desc");
        for status in &query.statuses {
            req = req.query("statuses[]", status);
        }
        for id in service_ids {
            req = req.query("service_ids[]", id);
        }
        if let Some(since) = &query.since {
            req = req.query("since", since);
        }

        let resp = req.call().map_err(classify)?;
        resp.into_json::<IncidentPage>()
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

impl ProviderAdapter for PagerDutyAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn test_connection(&self) -> Result<ConnectionInfo, ProviderError> {
        let resp = self.get("/users/me").call().map_err(classify)?;
        let envelope: UserEnvelope = resp
            .into_json()
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let name = envelope.user.name.unwrap_or_default();
        let identity = match envelope.user.email {
            Some(email) if !email.is_empty() => format!("{name} ({email})"),
            _ => name,
        };
        Ok(ConnectionInfo { ok: true, identity })
    }

    fn fetch_incidents(&self, query: &IncidentQuery) -> Result<Vec<Value>, ProviderError> {
        let service_ids = if query.service_ids.is_empty() {
            &self.service_ids
        } else {
            &query.service_ids
        };
        let page_size = query.limit.clamp(1, FETCH_PAGE_SIZE);

        let mut out: Vec<Value> = Vec::new();
        let mut offset = 0;
        while out.len() < query.limit {
            let page = self.fetch_page(query, service_ids, offset, page_size)?;
            let received = page.incidents.len();
            out.extend(page.incidents);
            if !page.more || received == 0 {
                break;
            }
            offset += received;
        }
        out.truncate(query.limit);

        tracing::debug!(
            provider = PROVIDER_NAME,
            statuses = ?query.statuses,
            fetched = out.len(),
            "fetched incidents"
        );
        Ok(out)
    }

    fn normalize(&self, record: &Value) -> Result<ExternalIncident, ProviderError> {
        normalize_record(record)
    }
}

/// Map PagerDuty urgency onto severity. Anything but `high` is `Major`.
pub fn map_severity(urgency: &str) -> Severity {
    match urgency {
        "high" => Severity::Critical,
        _ => Severity::Major,
    }
}

pub fn map_status(status: &str) -> IncidentStatus {
    match status {
        "triggered" => IncidentStatus::Investigating,
        "acknowledged" => IncidentStatus::Identified,
        "resolved" => IncidentStatus::Resolved,
        _ => IncidentStatus::Investigating,
    }
}

fn required_str<'a>(record: &'a Value, field: &str) -> Result<&'a str, ProviderError> {
    record
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProviderError::Validation(format!("missing {field}")))
}

fn canonical_timestamp(field: &str, raw: &str) -> Result<String, ProviderError> {
    let mut warnings = Vec::new();
    let ts = normalize_timestamp(field, raw, &mut warnings);
    for w in &warnings {
        tracing::debug!(code = %w.code, details = ?w.details, "{}", w.message);
    }
    ts.canonical_rfc3339_utc
        .ok_or_else(|| ProviderError::Validation(format!("unparseable {field}: {raw}")))
}

/// Convert one PagerDuty incident object into the provider-neutral shape.
pub fn normalize_record(record: &Value) -> Result<ExternalIncident, ProviderError> {
    if !record.is_object() {
        return Err(ProviderError::Validation("record is not an object".to_string()));
    }
    let external_id = required_str(record, "id")?;
    let title = required_str(record, "title")?;
    let status = required_str(record, "status")?;
    let created_at = canonical_timestamp("created_at", required_str(record, "created_at")?)?;
    let urgency = record
        .get("urgency")
        .and_then(Value::as_str)
        .unwrap_or("high");

    let resolved_at = match record.get("resolved_at").and_then(Value::as_str) {
        Some(raw) if !raw.trim().is_empty() => Some(canonical_timestamp("resolved_at", raw)?),
        _ => None,
    };

    Ok(ExternalIncident {
        external_id: external_id.to_string(),
        title: title.to_string(),
        severity: map_severity(urgency),
        status: map_status(status),
        created_at,
        resolved_at,
        html_url: record
            .get("html_url")
            .and_then(Value::as_str)
            .map(str::to_string),
        raw: record.clone(),
    })
}

fn classify(err: ureq::Error) -> ProviderError {
    match err {
        ureq::Error::Status(status, resp) => {
            let body: String = resp
                .into_string()
                .unwrap_or_default()
                .chars()
                .take(ERROR_BODY_LIMIT)
                .collect();
            if status == 401 || status == 403 {
                ProviderError::Auth(format!("HTTP {status}: {body}"))
            } else {
                ProviderError::Api { status, body }
            }
        }
        ureq::Error::Transport(t) => {
            if is_timeout(&t) {
                ProviderError::Timeout(t.to_string())
            } else {
                ProviderError::Network(t.to_string())
            }
        }
    }
}

fn is_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}
