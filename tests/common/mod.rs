//! Common test utilities and fixtures

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use trafegodns::db;
use trafegodns::db::models::ProviderRow;
use trafegodns::db::queries;
use trafegodns::model::{ProviderFeatures, RecordData, RecordType};
use trafegodns::provider::{
    DnsProvider, IngressRule, ProviderError, ProviderHandle, ProviderRecord, TunnelInfo,
    TunnelOps,
};

/// In-memory store with migrations applied
pub async fn test_pool() -> SqlitePool {
    db::connect_in_memory()
        .await
        .expect("Failed to open in-memory database")
}

/// Insert a provider row and return it
pub async fn create_test_provider(pool: &SqlitePool, name: &str, zone: &str) -> ProviderRow {
    let id = queries::insert_provider(
        pool,
        name,
        "cloudflare",
        zone,
        None,
        100,
        Some("test_token"),
        None,
        false,
    )
    .await
    .expect("Failed to insert provider");

    queries::get_provider(pool, id)
        .await
        .expect("Failed to fetch provider")
        .expect("Provider row missing")
}

/// Call counters for asserting on provider traffic
#[derive(Debug, Default)]
pub struct FakeProviderCalls {
    pub lists: AtomicUsize,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FakeProviderCalls {
    pub fn mutations(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
            + self.updates.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }
}

/// In-process provider with Cloudflare-like features.
///
/// Enforces the `(name, type)` uniqueness that real providers enforce, so
/// the reconciler's conflict-adoption path is exercised for real.
pub struct FakeProvider {
    zone: String,
    pub records: Mutex<HashMap<String, RecordData>>,
    next_id: AtomicUsize,
    pub calls: FakeProviderCalls,
    pub tunnel: Option<FakeTunnel>,
}

/// Remote tunnel state for tunnel-capable fakes
#[derive(Debug, Default)]
pub struct FakeTunnel {
    pub deployed: Mutex<Vec<IngressRule>>,
    pub removed: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new(zone: &str) -> Arc<Self> {
        Arc::new(Self {
            zone: zone.to_string(),
            records: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            calls: FakeProviderCalls::default(),
            tunnel: None,
        })
    }

    pub fn with_tunnel(zone: &str) -> Arc<Self> {
        Arc::new(Self {
            zone: zone.to_string(),
            records: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            calls: FakeProviderCalls::default(),
            tunnel: Some(FakeTunnel::default()),
        })
    }

    /// Seed a record as if it already existed at the provider
    pub async fn seed(&self, data: RecordData) -> String {
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records.lock().await.insert(id.clone(), data);
        id
    }

    pub async fn record_for(&self, hostname: &str) -> Option<RecordData> {
        self.records
            .lock()
            .await
            .values()
            .find(|data| data.hostname == hostname)
            .cloned()
    }

    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl DnsProvider for FakeProvider {
    fn provider_type(&self) -> &'static str {
        "cloudflare"
    }

    fn zone(&self) -> &str {
        &self.zone
    }

    fn features(&self) -> ProviderFeatures {
        ProviderFeatures {
            proxied: true,
            ttl_min: 1,
            ttl_max: 86_400,
            supported_types: &RecordType::ALL,
            batch: false,
            txt_chunking: false,
        }
    }

    async fn list_records(&self) -> Result<Vec<ProviderRecord>, ProviderError> {
        self.calls.lists.fetch_add(1, Ordering::SeqCst);

        Ok(self
            .records
            .lock()
            .await
            .iter()
            .map(|(id, data)| ProviderRecord {
                external_id: id.clone(),
                data: data.clone(),
            })
            .collect())
    }

    async fn create_record(&self, data: &RecordData) -> Result<String, ProviderError> {
        self.calls.creates.fetch_add(1, Ordering::SeqCst);

        let mut records = self.records.lock().await;
        if records.values().any(|existing| {
            existing.hostname == data.hostname && existing.record_type == data.record_type
        }) {
            return Err(ProviderError::Conflict(format!(
                "{} {} already exists",
                data.hostname, data.record_type
            )));
        }

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        records.insert(id.clone(), data.clone());
        Ok(id)
    }

    async fn update_record(
        &self,
        external_id: &str,
        data: &RecordData,
    ) -> Result<(), ProviderError> {
        self.calls.updates.fetch_add(1, Ordering::SeqCst);

        let mut records = self.records.lock().await;
        match records.get_mut(external_id) {
            Some(existing) => {
                *existing = data.clone();
                Ok(())
            }
            None => Err(ProviderError::NotFound(external_id.to_string())),
        }
    }

    async fn delete_record(&self, external_id: &str) -> Result<(), ProviderError> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        self.records.lock().await.remove(external_id);
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn tunnel_ops(&self) -> Option<&dyn TunnelOps> {
        self.tunnel.as_ref().map(|_| self as &dyn TunnelOps)
    }
}

#[async_trait]
impl TunnelOps for FakeProvider {
    async fn list_tunnels(&self) -> Result<Vec<TunnelInfo>, ProviderError> {
        Ok(vec![])
    }

    async fn create_tunnel(&self, _name: &str) -> Result<TunnelInfo, ProviderError> {
        Err(ProviderError::Internal("not supported by fake".into()))
    }

    async fn delete_tunnel(&self, _tunnel_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn get_tunnel_token(&self, _tunnel_id: &str) -> Result<String, ProviderError> {
        Ok("fake-token".into())
    }

    async fn list_ingress(&self, _tunnel_id: &str) -> Result<Vec<IngressRule>, ProviderError> {
        let tunnel = self.tunnel.as_ref().expect("tunnel-capable fake");
        Ok(tunnel.deployed.lock().await.clone())
    }

    async fn upsert_ingress(
        &self,
        _tunnel_id: &str,
        rule: &IngressRule,
    ) -> Result<(), ProviderError> {
        let tunnel = self.tunnel.as_ref().expect("tunnel-capable fake");
        let mut deployed = tunnel.deployed.lock().await;
        deployed.retain(|r| r.hostname != rule.hostname);
        deployed.push(rule.clone());
        Ok(())
    }

    async fn remove_ingress(
        &self,
        _tunnel_id: &str,
        hostname: &str,
    ) -> Result<(), ProviderError> {
        let tunnel = self.tunnel.as_ref().expect("tunnel-capable fake");
        tunnel.removed.lock().await.push(hostname.to_string());
        tunnel
            .deployed
            .lock()
            .await
            .retain(|r| r.hostname.as_deref() != Some(hostname));
        Ok(())
    }

    async fn deploy_config(
        &self,
        _tunnel_id: &str,
        rules: &[IngressRule],
    ) -> Result<(), ProviderError> {
        let tunnel = self.tunnel.as_ref().expect("tunnel-capable fake");
        *tunnel.deployed.lock().await = rules.to_vec();
        Ok(())
    }
}

/// A pool, a provider row, and a fake adapter wired into a handle
pub async fn test_setup() -> (SqlitePool, ProviderHandle, Arc<FakeProvider>) {
    let pool = test_pool().await;
    let row = create_test_provider(&pool, "cloudflare-test", "example.com").await;
    let fake = FakeProvider::new("example.com");

    let handle = ProviderHandle {
        row,
        adapter: fake.clone(),
    };

    (pool, handle, fake)
}

/// Same, but the fake is tunnel-capable
pub async fn test_setup_with_tunnel() -> (SqlitePool, ProviderHandle, Arc<FakeProvider>) {
    let pool = test_pool().await;
    let row = create_test_provider(&pool, "cloudflare-test", "example.com").await;
    let fake = FakeProvider::with_tunnel("example.com");

    let handle = ProviderHandle {
        row,
        adapter: fake.clone(),
    };

    (pool, handle, fake)
}

/// Backdate a tracked record's orphan timestamp by `minutes`
pub async fn backdate_record_orphan(pool: &SqlitePool, record_id: i64, minutes: i64) {
    let when = chrono::Utc::now() - chrono::Duration::minutes(minutes);
    sqlx::query("UPDATE records SET orphaned_at = $1 WHERE id = $2")
        .bind(when)
        .bind(record_id)
        .execute(pool)
        .await
        .expect("Failed to backdate orphan");
}

/// Backdate a tracked ingress rule's orphan timestamp by `minutes`
pub async fn backdate_ingress_orphan(pool: &SqlitePool, ingress_id: i64, minutes: i64) {
    let when = chrono::Utc::now() - chrono::Duration::minutes(minutes);
    sqlx::query("UPDATE tunnel_ingress SET orphaned_at = $1 WHERE id = $2")
        .bind(when)
        .bind(ingress_id)
        .execute(pool)
        .await
        .expect("Failed to backdate orphan");
}

pub fn record_data(hostname: &str, record_type: RecordType, content: &str) -> RecordData {
    RecordData {
        hostname: hostname.to_string(),
        record_type,
        content: content.to_string(),
        ttl: 300,
        priority: None,
        weight: None,
        port: None,
        flags: None,
        tag: None,
        proxied: Some(false),
    }
}
