use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use super::models::{
    ManagedHostname, OverrideRow, PreservedHostname, ProviderRow, TrackedRecord, TunnelIngressRow,
};
use crate::model::{IngressSource, RecordData, RecordSource, RecordType};

// ==================== Providers ====================

/// List enabled providers in routing order (priority, then id)
pub async fn list_enabled_providers(pool: &SqlitePool) -> Result<Vec<ProviderRow>> {
    let providers = sqlx::query_as::<_, ProviderRow>(
        r#"
        SELECT id, name, provider_type, zone, default_ttl, enabled, priority,
               credential_ref, account_ref, tunnel_capable, created_at, updated_at
        FROM providers
        WHERE enabled = 1
        ORDER BY priority, id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(providers)
}

pub async fn get_provider(pool: &SqlitePool, provider_id: i64) -> Result<Option<ProviderRow>> {
    let provider = sqlx::query_as::<_, ProviderRow>(
        r#"
        SELECT id, name, provider_type, zone, default_ttl, enabled, priority,
               credential_ref, account_ref, tunnel_capable, created_at, updated_at
        FROM providers
        WHERE id = $1
        "#,
    )
    .bind(provider_id)
    .fetch_optional(pool)
    .await?;

    Ok(provider)
}

pub async fn count_providers(pool: &SqlitePool) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM providers")
        .fetch_one(pool)
        .await?;

    Ok(count)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_provider(
    pool: &SqlitePool,
    name: &str,
    provider_type: &str,
    zone: &str,
    default_ttl: Option<u32>,
    priority: i64,
    credential_ref: Option<&str>,
    account_ref: Option<&str>,
    tunnel_capable: bool,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO providers (name, provider_type, zone, default_ttl, priority,
                               credential_ref, account_ref, tunnel_capable)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(provider_type)
    .bind(zone)
    .bind(default_ttl)
    .bind(priority)
    .bind(credential_ref)
    .bind(account_ref)
    .bind(tunnel_capable)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

// ==================== Tracked records ====================

/// All tracked records for a provider, orphaned included
pub async fn list_records(pool: &SqlitePool, provider_id: i64) -> Result<Vec<TrackedRecord>> {
    let records = sqlx::query_as::<_, TrackedRecord>(
        r#"
        SELECT id, provider_id, external_id, hostname, record_type, content, ttl,
               priority, weight, port, flags, tag, proxied, managed, source,
               orphaned_at, created_at, updated_at, last_synced_at
        FROM records
        WHERE provider_id = $1
        ORDER BY hostname, record_type
        "#,
    )
    .bind(provider_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// The active (non-orphaned) record for a key, if any
pub async fn get_active_record(
    pool: &SqlitePool,
    provider_id: i64,
    hostname: &str,
    record_type: RecordType,
) -> Result<Option<TrackedRecord>> {
    let record = sqlx::query_as::<_, TrackedRecord>(
        r#"
        SELECT id, provider_id, external_id, hostname, record_type, content, ttl,
               priority, weight, port, flags, tag, proxied, managed, source,
               orphaned_at, created_at, updated_at, last_synced_at
        FROM records
        WHERE provider_id = $1 AND hostname = $2 AND record_type = $3
          AND orphaned_at IS NULL
        "#,
    )
    .bind(provider_id)
    .bind(hostname)
    .bind(record_type)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Orphaned managed records across all providers, oldest first
pub async fn list_orphaned_records(pool: &SqlitePool) -> Result<Vec<TrackedRecord>> {
    let records = sqlx::query_as::<_, TrackedRecord>(
        r#"
        SELECT id, provider_id, external_id, hostname, record_type, content, ttl,
               priority, weight, port, flags, tag, proxied, managed, source,
               orphaned_at, created_at, updated_at, last_synced_at
        FROM records
        WHERE orphaned_at IS NOT NULL AND managed = 1
        ORDER BY orphaned_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn insert_record(
    conn: &mut SqliteConnection,
    provider_id: i64,
    data: &RecordData,
    external_id: Option<&str>,
    source: RecordSource,
    managed: bool,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO records (provider_id, external_id, hostname, record_type, content,
                             ttl, priority, weight, port, flags, tag, proxied, managed,
                             source, created_at, updated_at, last_synced_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15, $15)
        RETURNING id
        "#,
    )
    .bind(provider_id)
    .bind(external_id)
    .bind(&data.hostname)
    .bind(data.record_type)
    .bind(&data.content)
    .bind(data.ttl)
    .bind(data.priority)
    .bind(data.weight)
    .bind(data.port)
    .bind(data.flags)
    .bind(&data.tag)
    .bind(data.proxied)
    .bind(managed)
    .bind(source)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

/// Write new content (and possibly a newly adopted external id) to a record
pub async fn update_record(
    conn: &mut SqliteConnection,
    record_id: i64,
    data: &RecordData,
    external_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE records
        SET content = $1, ttl = $2, priority = $3, weight = $4, port = $5,
            flags = $6, tag = $7, proxied = $8,
            external_id = COALESCE($9, external_id),
            updated_at = $10, last_synced_at = $10
        WHERE id = $11
        "#,
    )
    .bind(&data.content)
    .bind(data.ttl)
    .bind(data.priority)
    .bind(data.weight)
    .bind(data.port)
    .bind(data.flags)
    .bind(&data.tag)
    .bind(data.proxied)
    .bind(external_id)
    .bind(now)
    .bind(record_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn set_record_orphaned(
    conn: &mut SqliteConnection,
    record_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE records
        SET orphaned_at = $1, updated_at = $1
        WHERE id = $2 AND orphaned_at IS NULL
        "#,
    )
    .bind(now)
    .bind(record_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn clear_record_orphaned(
    conn: &mut SqliteConnection,
    record_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE records
        SET orphaned_at = NULL, updated_at = $1
        WHERE id = $2
        "#,
    )
    .bind(now)
    .bind(record_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn delete_record(conn: &mut SqliteConnection, record_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM records WHERE id = $1")
        .bind(record_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn touch_record_synced(
    conn: &mut SqliteConnection,
    record_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE records SET last_synced_at = $1 WHERE id = $2")
        .bind(now)
        .bind(record_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

// ==================== Manual records ====================

pub async fn list_managed_hostnames(pool: &SqlitePool) -> Result<Vec<ManagedHostname>> {
    let rows = sqlx::query_as::<_, ManagedHostname>(
        r#"
        SELECT id, provider_id, hostname, record_type, content, ttl, priority,
               weight, port, flags, tag, proxied, enabled, created_at, updated_at
        FROM managed_hostnames
        WHERE enabled = 1
        ORDER BY hostname
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ==================== Overrides / preserved hostnames ====================

pub async fn list_overrides(pool: &SqlitePool) -> Result<Vec<OverrideRow>> {
    let rows = sqlx::query_as::<_, OverrideRow>(
        r#"
        SELECT id, hostname, record_type, content, ttl, proxied, provider_id,
               enabled, created_at, updated_at
        FROM overrides
        WHERE enabled = 1
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn list_preserved_hostnames(pool: &SqlitePool) -> Result<Vec<PreservedHostname>> {
    let rows = sqlx::query_as::<_, PreservedHostname>(
        r#"
        SELECT id, pattern, reason, created_at
        FROM preserved_hostnames
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ==================== Settings ====================

pub async fn load_settings(pool: &SqlitePool) -> Result<HashMap<String, String>> {
    let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM settings")
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().collect())
}

/// Insert a setting only if the key is not already present
pub async fn seed_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, value_type, category, updated_at)
        VALUES ($1, $2, 'string', 'seeded', $3)
        ON CONFLICT (key) DO NOTHING
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

// ==================== Audit log ====================

/// Append an audit entry; callers pass the transaction of the mutation it
/// describes so both commit together.
#[allow(clippy::too_many_arguments)]
pub async fn append_audit(
    conn: &mut SqliteConnection,
    actor: &str,
    action: &str,
    resource_type: &str,
    resource_id: &str,
    before: Option<&serde_json::Value>,
    after: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (actor, action, resource_type, resource_id, before, after, timestamp)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(actor)
    .bind(action)
    .bind(resource_type)
    .bind(resource_id)
    .bind(before.map(|v| v.to_string()))
    .bind(after.map(|v| v.to_string()))
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// ==================== Tunnel ingress ====================

pub async fn list_ingress(pool: &SqlitePool, tunnel_id: &str) -> Result<Vec<TunnelIngressRow>> {
    let rows = sqlx::query_as::<_, TunnelIngressRow>(
        r#"
        SELECT id, provider_id, tunnel_id, hostname, service, path, no_tls_verify,
               http_host_header, source, orphaned_at, created_at, updated_at
        FROM tunnel_ingress
        WHERE tunnel_id = $1
        ORDER BY hostname
        "#,
    )
    .bind(tunnel_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn list_orphaned_ingress(pool: &SqlitePool) -> Result<Vec<TunnelIngressRow>> {
    let rows = sqlx::query_as::<_, TunnelIngressRow>(
        r#"
        SELECT id, provider_id, tunnel_id, hostname, service, path, no_tls_verify,
               http_host_header, source, orphaned_at, created_at, updated_at
        FROM tunnel_ingress
        WHERE orphaned_at IS NOT NULL AND source = 'auto'
        ORDER BY orphaned_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_ingress(
    conn: &mut SqliteConnection,
    provider_id: i64,
    tunnel_id: &str,
    hostname: &str,
    service: &str,
    path: Option<&str>,
    no_tls_verify: bool,
    http_host_header: Option<&str>,
    source: IngressSource,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO tunnel_ingress (provider_id, tunnel_id, hostname, service, path,
                                    no_tls_verify, http_host_header, source,
                                    created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
        RETURNING id
        "#,
    )
    .bind(provider_id)
    .bind(tunnel_id)
    .bind(hostname)
    .bind(service)
    .bind(path)
    .bind(no_tls_verify)
    .bind(http_host_header)
    .bind(source)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

pub async fn update_ingress(
    conn: &mut SqliteConnection,
    ingress_id: i64,
    service: &str,
    path: Option<&str>,
    no_tls_verify: bool,
    http_host_header: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tunnel_ingress
        SET service = $1, path = $2, no_tls_verify = $3, http_host_header = $4,
            orphaned_at = NULL, updated_at = $5
        WHERE id = $6
        "#,
    )
    .bind(service)
    .bind(path)
    .bind(no_tls_verify)
    .bind(http_host_header)
    .bind(now)
    .bind(ingress_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn set_ingress_orphaned(
    conn: &mut SqliteConnection,
    ingress_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tunnel_ingress
        SET orphaned_at = $1, updated_at = $1
        WHERE id = $2 AND orphaned_at IS NULL
        "#,
    )
    .bind(now)
    .bind(ingress_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn delete_ingress(conn: &mut SqliteConnection, ingress_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM tunnel_ingress WHERE id = $1")
        .bind(ingress_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}
