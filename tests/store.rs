//! Integration tests for the tracked-record store and its repositories.

mod common;

use chrono::Utc;

use common::{create_test_provider, record_data, test_pool};
use trafegodns::db;
use trafegodns::db::queries;
use trafegodns::model::{RecordSource, RecordType};

#[tokio::test]
async fn test_migrations_apply_on_fresh_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trafegodns.db");

    let pool = db::connect(&path).await.unwrap();
    let row = create_test_provider(&pool, "cloudflare", "example.com").await;

    // Data survives a fresh pool against the same file
    drop(pool);
    let pool = db::connect(&path).await.unwrap();
    let again = queries::get_provider(&pool, row.id).await.unwrap().unwrap();
    assert_eq!(again.zone, "example.com");
}

#[tokio::test]
async fn test_seed_setting_never_overwrites() {
    let pool = test_pool().await;

    queries::seed_setting(&pool, "poll_interval_ms", "30000").await.unwrap();
    queries::seed_setting(&pool, "poll_interval_ms", "5000").await.unwrap();

    let settings = queries::load_settings(&pool).await.unwrap();
    assert_eq!(settings.get("poll_interval_ms").map(String::as_str), Some("30000"));
}

#[tokio::test]
async fn test_active_key_is_unique_but_orphans_coexist() {
    let pool = test_pool().await;
    let provider = create_test_provider(&pool, "cloudflare", "example.com").await;
    let data = record_data("app.example.com", RecordType::A, "10.0.0.1");
    let now = Utc::now();

    let mut conn = pool.acquire().await.unwrap();
    let first = queries::insert_record(
        &mut conn,
        provider.id,
        &data,
        Some("ext-1"),
        RecordSource::Traefik,
        true,
        now,
    )
    .await
    .unwrap();

    // A second active record for the same key violates the partial index
    let duplicate = queries::insert_record(
        &mut conn,
        provider.id,
        &data,
        Some("ext-2"),
        RecordSource::Traefik,
        true,
        now,
    )
    .await;
    assert!(duplicate.is_err());

    // Once the first is orphaned, a new active record may coexist with it
    queries::set_record_orphaned(&mut conn, first, now).await.unwrap();
    queries::insert_record(
        &mut conn,
        provider.id,
        &data,
        Some("ext-3"),
        RecordSource::Traefik,
        true,
        now,
    )
    .await
    .unwrap();
    drop(conn);

    let rows = queries::list_records(&pool, provider.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.iter().filter(|r| r.orphaned_at.is_some()).count(), 1);
}

#[tokio::test]
async fn test_audit_commits_with_its_mutation() {
    let pool = test_pool().await;
    let provider = create_test_provider(&pool, "cloudflare", "example.com").await;
    let data = record_data("app.example.com", RecordType::A, "10.0.0.1");

    // A rolled-back transaction leaves neither the record nor the audit entry
    {
        let mut tx = pool.begin().await.unwrap();
        let now = Utc::now();
        let id = queries::insert_record(
            &mut tx,
            provider.id,
            &data,
            None,
            RecordSource::Manual,
            true,
            now,
        )
        .await
        .unwrap();
        queries::append_audit(
            &mut tx,
            "system",
            "dns.record.create",
            "record",
            &id.to_string(),
            None,
            None,
            now,
        )
        .await
        .unwrap();
        tx.rollback().await.unwrap();
    }

    let records = queries::list_records(&pool, provider.id).await.unwrap();
    assert!(records.is_empty());

    let audit_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(audit_count, 0);
}

#[tokio::test]
async fn test_orphaned_records_listed_oldest_first() {
    let pool = test_pool().await;
    let provider = create_test_provider(&pool, "cloudflare", "example.com").await;

    let mut conn = pool.acquire().await.unwrap();
    for (hostname, minutes_ago) in [("new.example.com", 1i64), ("old.example.com", 60)] {
        let id = queries::insert_record(
            &mut conn,
            provider.id,
            &record_data(hostname, RecordType::A, "10.0.0.1"),
            None,
            RecordSource::Traefik,
            true,
            Utc::now(),
        )
        .await
        .unwrap();
        queries::set_record_orphaned(&mut conn, id, Utc::now() - chrono::Duration::minutes(minutes_ago))
            .await
            .unwrap();
    }
    drop(conn);

    let orphans = queries::list_orphaned_records(&pool).await.unwrap();
    assert_eq!(orphans[0].hostname, "old.example.com");
    assert_eq!(orphans[1].hostname, "new.example.com");
}
