mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rusqlite::Connection;
use time::macros::datetime;
use time::Duration;

use sd_core::clock::ManualClock;
use sd_core::db;
use sd_core::domain::{IncidentStatus, Severity, SyncStatus};
use sd_core::repo::datasources::{acquire_sync_lease, get_datasource, LeaseOutcome};
use sd_core::repo::external::find_link;
use sd_core::repo::{count_incidents, get_incident};
use sd_sync::reconcile::SYNC_IN_PROGRESS_MESSAGE;
use sd_sync::{ProviderError, ReconciliationEngine, SyncSettings};

use common::{add_datasource, pd_incident, FakeProvider};

struct Harness {
    conn: Connection,
    clock: Arc<ManualClock>,
    engine: ReconciliationEngine,
}

fn harness() -> Harness {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    let clock = Arc::new(ManualClock::new(datetime!(2026-01-01 10:00:00 UTC)));
    let engine = ReconciliationEngine::new(SyncSettings::default(), clock.clone());
    Harness { conn, clock, engine }
}

#[test]
fn triggered_record_is_created_then_updated_then_resolved() {
    let mut h = harness();
    let ds = add_datasource(&h.conn, "PagerDuty prod", "pagerduty", true);
    let provider = FakeProvider::new();

    provider.set_active(vec![pd_incident("P1", "triggered", "high", None)]);
    let first = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert!(first.success, "{first:?}");
    assert_eq!((first.created, first.updated), (1, 0));

    let link = find_link(&h.conn, ds.id, "P1").unwrap().expect("link");
    let incident_id = link.incident_id.expect("linked incident");
    let incident = get_incident(&h.conn, incident_id).unwrap();
    assert_eq!(incident.severity, Severity::Critical);
    assert_eq!(incident.status, IncidentStatus::Investigating);
    assert_eq!(incident.started_at, "2026-01-01T09:00:00Z");
    assert_eq!(incident.source, "pagerduty");
    assert_eq!(incident.created_by, "pagerduty:PagerDuty prod");

    h.clock.advance(Duration::minutes(1));
    let second = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert_eq!((second.created, second.updated), (0, 1));
    let link = find_link(&h.conn, ds.id, "P1").unwrap().unwrap();
    assert_eq!(link.incident_id, Some(incident_id));

    h.clock.advance(Duration::minutes(1));
    provider.set_active(Vec::new());
    provider.set_resolved(vec![pd_incident(
        "P1",
        "resolved",
        "high",
        Some("2026-01-01T10:01:30Z"),
    )]);
    let third = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert_eq!((third.created, third.updated), (0, 1));

    let incident = get_incident(&h.conn, incident_id).unwrap();
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert_eq!(incident.resolved_at.as_deref(), Some("2026-01-01T10:01:30Z"));
    assert_eq!(count_incidents(&h.conn).unwrap(), 1);
}

#[test]
fn reconciling_unchanged_set_twice_creates_nothing_new() {
    let mut h = harness();
    let ds = add_datasource(&h.conn, "pd", "pagerduty", true);
    let provider = FakeProvider::new();
    provider.set_active(vec![
        pd_incident("P1", "triggered", "high", None),
        pd_incident("P2", "acknowledged", "low", None),
        pd_incident("P3", "triggered", "low", None),
    ]);

    let first = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert_eq!(first.created, 3);
    let second = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert_eq!((second.created, second.updated), (0, 3));
    assert_eq!(count_incidents(&h.conn).unwrap(), 3);
}

#[test]
fn resolved_only_record_never_creates_an_incident() {
    let mut h = harness();
    let ds = add_datasource(&h.conn, "pd", "pagerduty", true);
    let provider = FakeProvider::new();
    provider.set_resolved(vec![pd_incident("P9", "resolved", "high", Some("2026-01-01T09:30:00Z"))]);

    let result = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert!(result.success);
    assert_eq!((result.created, result.updated, result.total_fetched), (0, 0, 1));
    assert_eq!(count_incidents(&h.conn).unwrap(), 0);
    assert!(find_link(&h.conn, ds.id, "P9").unwrap().is_none());
}

#[test]
fn one_malformed_record_in_ten_is_skipped_and_run_is_partial() {
    let mut h = harness();
    let ds = add_datasource(&h.conn, "pd", "pagerduty", true);
    let provider = FakeProvider::new();
    let mut records: Vec<_> = (0..10)
        .map(|i| pd_incident(&format!("P{i}"), "triggered", "high", None))
        .collect();
    records[4].as_object_mut().unwrap().remove("title");
    provider.set_active(records);

    let result = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert!(result.success);
    assert!(result.partial);
    assert_eq!((result.created, result.skipped, result.total_fetched), (9, 1, 10));
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].code, "SYNC_RECORD_SKIPPED");
    assert_eq!(count_incidents(&h.conn).unwrap(), 9);
}

#[test]
fn auth_failure_marks_error_and_keeps_last_sync_at() {
    let mut h = harness();
    let ds = add_datasource(&h.conn, "pd", "pagerduty", true);
    let provider = FakeProvider::new();
    provider.set_active(vec![pd_incident("P1", "triggered", "high", None)]);
    assert!(h.engine.run(&mut h.conn, &ds, provider.as_ref()).success);
    let before = get_datasource(&h.conn, ds.id).unwrap();
    assert_eq!(before.last_sync_at.as_deref(), Some("2026-01-01T10:00:00Z"));

    h.clock.advance(Duration::minutes(5));
    provider.fail_active(ProviderError::Auth("HTTP 401: Invalid API key".to_string()));
    let fetches_before = provider.fetch_count();
    let result = h.engine.run(&mut h.conn, &ds, provider.as_ref());

    assert!(!result.success);
    assert!(!result.partial);
    assert_eq!(
        result.error.as_deref(),
        Some("Authentication failed: HTTP 401: Invalid API key")
    );
    assert_eq!(provider.fetch_count() - fetches_before, 1, "run aborts on first fetch");

    let after = get_datasource(&h.conn, ds.id).unwrap();
    assert_eq!(after.sync_status, SyncStatus::Error);
    assert_eq!(after.sync_error, result.error);
    assert_eq!(after.last_sync_at, before.last_sync_at);
    assert_eq!(after.lease_token, None);
}

#[test]
fn failure_after_progress_keeps_committed_records() {
    let mut h = harness();
    let ds = add_datasource(&h.conn, "pd", "pagerduty", true);
    let provider = FakeProvider::new();
    provider.set_active(vec![
        pd_incident("P1", "triggered", "high", None),
        pd_incident("P2", "triggered", "high", None),
    ]);
    provider.fail_resolved(ProviderError::Network("connection reset".to_string()));

    let result = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert!(!result.success);
    assert_eq!(result.created, 2);
    assert_eq!(count_incidents(&h.conn).unwrap(), 2);
    assert_eq!(get_datasource(&h.conn, ds.id).unwrap().sync_status, SyncStatus::Error);
}

#[test]
fn live_lease_rejects_run_until_it_expires() {
    let mut h = harness();
    let ds = add_datasource(&h.conn, "pd", "pagerduty", true);
    let provider = FakeProvider::new();

    let now = h.clock_now();
    let held = acquire_sync_lease(&mut h.conn, ds.id, now, Duration::minutes(2)).unwrap();
    assert!(matches!(held, LeaseOutcome::Acquired(_)));

    let rejected = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert!(!rejected.success);
    assert_eq!(rejected.error.as_deref(), Some(SYNC_IN_PROGRESS_MESSAGE));
    assert_eq!(provider.fetch_count(), 0);

    h.clock.advance(Duration::minutes(3));
    let result = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert!(result.success, "{result:?}");
}

#[test]
fn link_without_incident_is_refreshed_not_recreated() {
    let mut h = harness();
    let ds = add_datasource(&h.conn, "pd", "pagerduty", true);
    let provider = FakeProvider::new();
    provider.set_active(vec![pd_incident("P1", "triggered", "high", None)]);
    assert_eq!(h.engine.run(&mut h.conn, &ds, provider.as_ref()).created, 1);

    h.conn.execute("DELETE FROM incidents", []).unwrap();
    assert_eq!(find_link(&h.conn, ds.id, "P1").unwrap().unwrap().incident_id, None);

    let result = h.engine.run(&mut h.conn, &ds, provider.as_ref());
    assert_eq!((result.created, result.updated), (0, 1));
    assert_eq!(count_incidents(&h.conn).unwrap(), 0);
}

impl Harness {
    fn clock_now(&self) -> time::OffsetDateTime {
        use sd_core::clock::Clock;
        self.clock.now_utc()
    }
}
