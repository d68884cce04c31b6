//! Pulls incidents from external on-call providers into canonical storage.

pub mod error;
pub mod lock;
pub mod pagerduty;
pub mod provider;
pub mod reconcile;
pub mod scheduler;
pub mod service;
pub mod settings;

pub use error::ProviderError;
pub use provider::{AdapterFactory, ConnectionInfo, IncidentQuery, ProviderAdapter, ProviderKind};
pub use reconcile::{ReconciliationEngine, SyncResult};
pub use scheduler::SyncScheduler;
pub use service::SyncService;
pub use settings::SyncSettings;
