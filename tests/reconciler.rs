//! Integration tests for the reconciliation cycle against an in-process
//! provider and an in-memory tracked store.

mod common;

use common::{record_data, test_setup};

use trafegodns::db::queries;
use trafegodns::events::{EventBus, EventKind};
use trafegodns::model::{DesiredRecord, RecordSource, RecordType};
use trafegodns::reconcile::{Reconciler, ReconcilerConfig};

fn desired(provider_id: i64, hostname: &str, record_type: RecordType, content: &str) -> DesiredRecord {
    DesiredRecord {
        provider_id,
        source: RecordSource::Traefik,
        data: record_data(hostname, record_type, content),
    }
}

#[tokio::test]
async fn test_create_from_empty_store() {
    let (pool, handle, fake) = test_setup().await;
    let provider_id = handle.row.id;
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();

    let mut reconciler =
        Reconciler::new(handle, pool.clone(), bus, ReconcilerConfig::default());

    let intent = vec![desired(
        provider_id,
        "app.example.com",
        RecordType::Cname,
        "example.com",
    )];

    let counts = reconciler.reconcile(&intent).await.unwrap();
    assert_eq!(counts.created, 1);
    assert_eq!(counts.failed, 0);

    // Provider got exactly one create
    let at_provider = fake.record_for("app.example.com").await.unwrap();
    assert_eq!(at_provider.content, "example.com");
    assert_eq!(at_provider.proxied, Some(false));

    // Tracked store has the record, active, with the provider's id
    let tracked = queries::get_active_record(&pool, provider_id, "app.example.com", RecordType::Cname)
        .await
        .unwrap()
        .unwrap();
    assert!(tracked.managed);
    assert!(tracked.external_id.is_some());
    assert!(tracked.orphaned_at.is_none());

    // Created event on the bus
    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::RecordCreated);
    assert_eq!(event.payload["hostname"], "app.example.com");

    // Audit entry exists
    let audit_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE action = 'dns.record.create'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(audit_count, 1);
}

#[tokio::test]
async fn test_back_to_back_cycles_are_idempotent() {
    let (pool, handle, fake) = test_setup().await;
    let provider_id = handle.row.id;

    let mut reconciler = Reconciler::new(
        handle,
        pool.clone(),
        EventBus::new(16),
        ReconcilerConfig::default(),
    );

    let intent = vec![
        desired(provider_id, "a.example.com", RecordType::A, "10.0.0.1"),
        desired(provider_id, "b.example.com", RecordType::A, "10.0.0.2"),
    ];

    let first = reconciler.reconcile(&intent).await.unwrap();
    assert_eq!(first.created, 2);
    let mutations_after_first = fake.calls.mutations();

    let second = reconciler.reconcile(&intent).await.unwrap();
    assert_eq!(second.mutations(), 0);
    assert_eq!(fake.calls.mutations(), mutations_after_first);
}

#[tokio::test]
async fn test_drift_at_provider_is_repaired() {
    let (pool, handle, fake) = test_setup().await;
    let provider_id = handle.row.id;

    let mut reconciler = Reconciler::new(
        handle,
        pool.clone(),
        EventBus::new(16),
        ReconcilerConfig::default(),
    );

    let intent = vec![desired(provider_id, "a.example.com", RecordType::A, "10.0.0.1")];
    reconciler.reconcile(&intent).await.unwrap();

    // Someone edits the record out-of-band
    {
        let mut records = fake.records.lock().await;
        let record = records.values_mut().next().unwrap();
        record.ttl = 60;
    }

    let counts = reconciler.reconcile(&intent).await.unwrap();
    assert_eq!(counts.updated, 1);

    // Intent wins: TTL converges back to 300
    let at_provider = fake.record_for("a.example.com").await.unwrap();
    assert_eq!(at_provider.ttl, 300);
}

#[tokio::test]
async fn test_intent_change_updates_provider() {
    let (pool, handle, fake) = test_setup().await;
    let provider_id = handle.row.id;
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();

    let mut reconciler =
        Reconciler::new(handle, pool.clone(), bus, ReconcilerConfig::default());

    reconciler
        .reconcile(&[desired(provider_id, "a.example.com", RecordType::A, "10.0.0.1")])
        .await
        .unwrap();
    // Drain record.created and system.sync.completed from the first cycle
    let _ = events.recv().await;
    let _ = events.recv().await;

    let counts = reconciler
        .reconcile(&[desired(provider_id, "a.example.com", RecordType::A, "10.0.0.9")])
        .await
        .unwrap();
    assert_eq!(counts.updated, 1);

    assert_eq!(
        fake.record_for("a.example.com").await.unwrap().content,
        "10.0.0.9"
    );

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::RecordUpdated);
    assert_eq!(event.payload["content"], "10.0.0.9");
}

#[tokio::test]
async fn test_create_conflict_adopts_existing_record() {
    let (pool, handle, fake) = test_setup().await;
    let provider_id = handle.row.id;

    // The record already exists at the provider but is not tracked as active
    let existing_id = fake
        .seed(record_data("app.example.com", RecordType::A, "192.0.2.99"))
        .await;

    let mut reconciler = Reconciler::new(
        handle,
        pool.clone(),
        EventBus::new(16),
        ReconcilerConfig::default(),
    );

    // Stale cache: reconciler listed before the record appeared is simulated
    // by the fake rejecting the create with a conflict
    let counts = reconciler
        .reconcile(&[desired(provider_id, "app.example.com", RecordType::A, "10.0.0.1")])
        .await
        .unwrap();
    assert_eq!(counts.created + counts.updated, 1);
    assert_eq!(counts.failed, 0);

    // No second record; the existing one was adopted and updated in place
    assert_eq!(fake.record_count().await, 1);
    assert_eq!(
        fake.record_for("app.example.com").await.unwrap().content,
        "10.0.0.1"
    );

    let tracked = queries::get_active_record(&pool, provider_id, "app.example.com", RecordType::A)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tracked.external_id.as_deref(), Some(existing_id.as_str()));
}

#[tokio::test]
async fn test_vanished_intent_marks_orphan_without_delete() {
    let (pool, handle, fake) = test_setup().await;
    let provider_id = handle.row.id;
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();

    let mut reconciler =
        Reconciler::new(handle, pool.clone(), bus, ReconcilerConfig::default());

    let intent = vec![desired(provider_id, "old.example.com", RecordType::A, "10.0.0.1")];
    reconciler.reconcile(&intent).await.unwrap();
    // Drain record.created and system.sync.completed from the first cycle
    let _ = events.recv().await;
    let _ = events.recv().await;

    // Container removed: hostname gone from intent
    let counts = reconciler.reconcile(&[]).await.unwrap();
    assert_eq!(counts.orphaned, 1);

    // The record still exists at the provider; only the tracked row changed
    assert!(fake.record_for("old.example.com").await.is_some());
    assert_eq!(fake.calls.deletes.load(std::sync::atomic::Ordering::SeqCst), 0);

    let rows = queries::list_records(&pool, provider_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].orphaned_at.is_some());

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::RecordOrphaned);
}

#[tokio::test]
async fn test_reappearing_intent_restores_orphan() {
    let (pool, handle, fake) = test_setup().await;
    let provider_id = handle.row.id;

    let mut reconciler = Reconciler::new(
        handle,
        pool.clone(),
        EventBus::new(16),
        ReconcilerConfig::default(),
    );

    let intent = vec![desired(provider_id, "back.example.com", RecordType::A, "10.0.0.1")];
    reconciler.reconcile(&intent).await.unwrap();
    reconciler.reconcile(&[]).await.unwrap();

    // Container restarted before the grace period: record must come back
    let counts = reconciler.reconcile(&intent).await.unwrap();
    assert_eq!(counts.restored, 1);
    assert_eq!(counts.updated, 0);

    let tracked = queries::get_active_record(&pool, provider_id, "back.example.com", RecordType::A)
        .await
        .unwrap();
    assert!(tracked.is_some());

    // Never deleted at the provider
    assert_eq!(fake.calls.deletes.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unmanaged_records_left_alone() {
    let (pool, handle, fake) = test_setup().await;
    let provider_id = handle.row.id;

    // A record at the provider that the engine never created
    fake.seed(record_data("external.example.com", RecordType::A, "192.0.2.50"))
        .await;

    let mut reconciler = Reconciler::new(
        handle,
        pool.clone(),
        EventBus::new(16),
        ReconcilerConfig::default(),
    );

    reconciler.reconcile(&[]).await.unwrap();

    // Untouched at the provider, untracked in the store
    assert_eq!(
        fake.record_for("external.example.com").await.unwrap().content,
        "192.0.2.50"
    );
    assert_eq!(fake.calls.mutations(), 0);
    assert!(queries::list_records(&pool, provider_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_managed_missing_is_recreated() {
    let (pool, handle, fake) = test_setup().await;
    let provider_id = handle.row.id;

    let mut reconciler = Reconciler::new(
        handle,
        pool.clone(),
        EventBus::new(16),
        ReconcilerConfig::default(),
    );

    let intent = vec![desired(provider_id, "a.example.com", RecordType::A, "10.0.0.1")];
    reconciler.reconcile(&intent).await.unwrap();

    // Record deleted at the provider out-of-band
    fake.records.lock().await.clear();

    let counts = reconciler.reconcile(&intent).await.unwrap();
    assert_eq!(counts.updated, 1);
    assert_eq!(counts.failed, 0);

    assert!(fake.record_for("a.example.com").await.is_some());
}

#[tokio::test]
async fn test_sync_completed_event_carries_counts() {
    let (pool, handle, _fake) = test_setup().await;
    let provider_id = handle.row.id;
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();

    let mut reconciler =
        Reconciler::new(handle, pool.clone(), bus, ReconcilerConfig::default());

    reconciler
        .reconcile(&[desired(provider_id, "a.example.com", RecordType::A, "10.0.0.1")])
        .await
        .unwrap();

    // record.created, then system.sync.completed
    let first = events.recv().await.unwrap();
    assert_eq!(first.kind, EventKind::RecordCreated);
    let second = events.recv().await.unwrap();
    assert_eq!(second.kind, EventKind::SyncCompleted);
    assert_eq!(second.payload["created"], 1);
    assert_eq!(second.payload["failed"], 0);
}

#[tokio::test]
async fn test_cache_serves_within_freshness_window() {
    let (pool, handle, fake) = test_setup().await;
    let provider_id = handle.row.id;

    let mut reconciler = Reconciler::new(
        handle,
        pool.clone(),
        EventBus::new(16),
        ReconcilerConfig::default(),
    );

    // Two empty-intent cycles back to back: no writes, so the second list
    // comes from the cache
    reconciler.reconcile(&[]).await.unwrap();
    reconciler.reconcile(&[]).await.unwrap();
    assert_eq!(fake.calls.lists.load(std::sync::atomic::Ordering::SeqCst), 1);

    // A write invalidates the cache
    reconciler
        .reconcile(&[desired(provider_id, "a.example.com", RecordType::A, "10.0.0.1")])
        .await
        .unwrap();
    reconciler.reconcile(&[]).await.unwrap();
    assert!(fake.calls.lists.load(std::sync::atomic::Ordering::SeqCst) >= 2);
}
