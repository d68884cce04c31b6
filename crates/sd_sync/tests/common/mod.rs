#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde_json::{json, Value};

use sd_core::domain::{Datasource, ExternalIncident};
use sd_core::error::AppError;
use sd_core::repo::datasources::{get_datasource, insert_datasource, NewDatasource};
use sd_sync::pagerduty::normalize_record;
use sd_sync::{AdapterFactory, ConnectionInfo, IncidentQuery, ProviderAdapter, ProviderError};

/// Scriptable provider standing in for PagerDuty.
#[derive(Default)]
pub struct FakeProvider {
    pub active: Mutex<Vec<Value>>,
    pub resolved: Mutex<Vec<Value>>,
    pub active_failure: Mutex<Option<ProviderError>>,
    pub resolved_failure: Mutex<Option<ProviderError>>,
    pub fetches: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_active(&self, records: Vec<Value>) {
        *self.active.lock().unwrap() = records;
    }

    pub fn set_resolved(&self, records: Vec<Value>) {
        *self.resolved.lock().unwrap() = records;
    }

    pub fn fail_active(&self, err: ProviderError) {
        *self.active_failure.lock().unwrap() = Some(err);
    }

    pub fn fail_resolved(&self, err: ProviderError) {
        *self.resolved_failure.lock().unwrap() = Some(err);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ProviderAdapter for FakeProvider {
    fn name(&self) -> &str {
        "pagerduty"
    }

    fn test_connection(&self) -> Result<ConnectionInfo, ProviderError> {
        if let Some(e) = self.active_failure.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(ConnectionInfo {
            ok: true,
            identity: "Mock Admin (admin@mock-pagerduty.local)".to_string(),
        })
    }

    fn fetch_incidents(&self, query: &IncidentQuery) -> Result<Vec<Value>, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let resolved = query.statuses.iter().any(|s| s == "resolved");
        let (failure, records) = if resolved {
            (&self.resolved_failure, &self.resolved)
        } else {
            (&self.active_failure, &self.active)
        };
        if let Some(e) = failure.lock().unwrap().clone() {
            return Err(e);
        }
        let mut out = records.lock().unwrap().clone();
        out.truncate(query.limit);
        Ok(out)
    }

    fn normalize(&self, record: &Value) -> Result<ExternalIncident, ProviderError> {
        normalize_record(record)
    }
}

/// Boxed handle onto a shared fake so tests keep control after handing it out.
pub struct SharedProvider(pub Arc<FakeProvider>);

impl ProviderAdapter for SharedProvider {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn test_connection(&self) -> Result<ConnectionInfo, ProviderError> {
        self.0.test_connection()
    }

    fn fetch_incidents(&self, query: &IncidentQuery) -> Result<Vec<Value>, ProviderError> {
        self.0.fetch_incidents(query)
    }

    fn normalize(&self, record: &Value) -> Result<ExternalIncident, ProviderError> {
        self.0.normalize(record)
    }
}

pub struct FakeFactory(pub Arc<FakeProvider>);

impl AdapterFactory for FakeFactory {
    fn build(&self, _datasource: &Datasource) -> Result<Box<dyn ProviderAdapter>, AppError> {
        Ok(Box::new(SharedProvider(Arc::clone(&self.0))))
    }
}

/// Provider whose first fetch parks until the test lets it go. Later fetches return
/// nothing.
#[derive(Clone)]
pub struct GatedProvider {
    entered: Arc<Mutex<Sender<()>>>,
    release: Arc<Mutex<Option<Receiver<()>>>>,
}

impl GatedProvider {
    /// Returns the provider, a receiver signalled once the first fetch has started, and
    /// the sender that releases it.
    pub fn new() -> (Self, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let provider = Self {
            entered: Arc::new(Mutex::new(entered_tx)),
            release: Arc::new(Mutex::new(Some(release_rx))),
        };
        (provider, entered_rx, release_tx)
    }
}

impl ProviderAdapter for GatedProvider {
    fn name(&self) -> &str {
        "pagerduty"
    }

    fn test_connection(&self) -> Result<ConnectionInfo, ProviderError> {
        Ok(ConnectionInfo {
            ok: true,
            identity: "Gated".to_string(),
        })
    }

    fn fetch_incidents(&self, _query: &IncidentQuery) -> Result<Vec<Value>, ProviderError> {
        let gate = self.release.lock().unwrap().take();
        if let Some(release) = gate {
            let _ = self.entered.lock().unwrap().send(());
            release.recv().map_err(|_| ProviderError::Network("gate dropped".to_string()))?;
        }
        Ok(Vec::new())
    }

    fn normalize(&self, record: &Value) -> Result<ExternalIncident, ProviderError> {
        normalize_record(record)
    }
}

/// Hands the gated provider to the datasource named `gated_name`, the fake to the rest.
pub struct SplitFactory {
    pub gated_name: String,
    pub gated: GatedProvider,
    pub other: Arc<FakeProvider>,
}

impl AdapterFactory for SplitFactory {
    fn build(&self, datasource: &Datasource) -> Result<Box<dyn ProviderAdapter>, AppError> {
        if datasource.name == self.gated_name {
            Ok(Box::new(self.gated.clone()))
        } else {
            Ok(Box::new(SharedProvider(Arc::clone(&self.other))))
        }
    }
}

pub fn pd_incident(id: &str, status: &str, urgency: &str, resolved_at: Option<&str>) -> Value {
    json!({
        "id": id,
        "title": format!("Incident {id}"),
        "created_at": "2026-01-01T09:00:00+00:00",
        "status": status,
        "urgency": urgency,
        "html_url": format!("https://mock-pagerduty.local/incidents/{id}"),
        "resolved_at": resolved_at,
        "type": "incident"
    })
}

pub fn add_datasource(conn: &Connection, name: &str, provider_type: &str, enabled: bool) -> Datasource {
    let id = insert_datasource(
        conn,
        &NewDatasource {
            name: name.to_string(),
            provider_type: provider_type.to_string(),
            config_json: r#"{"api_key":"test-api-key"}"#.to_string(),
            enabled,
            sync_interval_seconds: 60,
        },
        "2026-01-01T00:00:00Z",
    )
    .expect("insert datasource");
    get_datasource(conn, id).expect("get datasource")
}
