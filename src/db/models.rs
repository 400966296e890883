use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::model::{
    IngressSource, RecordData, RecordKey, RecordSource, RecordType, hostname_matches_pattern,
};

/// A configured DNS provider
#[derive(Debug, Clone, FromRow)]
pub struct ProviderRow {
    pub id: i64,
    pub name: String,
    pub provider_type: String,
    pub zone: String,
    /// Per-provider TTL override; None falls back to the global default
    pub default_ttl: Option<u32>,
    pub enabled: bool,
    /// Lowest priority is the primary provider
    pub priority: i64,
    pub credential_ref: Option<String>,
    pub account_ref: Option<String>,
    pub tunnel_capable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A record the engine owns and may mutate at the provider
#[derive(Debug, Clone, FromRow)]
pub struct TrackedRecord {
    pub id: i64,
    pub provider_id: i64,
    /// The provider's own identifier, once known
    pub external_id: Option<String>,
    pub hostname: String,
    pub record_type: RecordType,
    pub content: String,
    pub ttl: u32,
    pub priority: Option<u16>,
    pub weight: Option<u16>,
    pub port: Option<u16>,
    pub flags: Option<u8>,
    pub tag: Option<String>,
    pub proxied: Option<bool>,
    /// false for records discovered at the provider; those are read-only
    pub managed: bool,
    pub source: RecordSource,
    pub orphaned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl TrackedRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            provider_id: self.provider_id,
            hostname: self.hostname.clone(),
            record_type: self.record_type,
        }
    }

    pub fn data(&self) -> RecordData {
        RecordData {
            hostname: self.hostname.clone(),
            record_type: self.record_type,
            content: self.content.clone(),
            ttl: self.ttl,
            priority: self.priority,
            weight: self.weight,
            port: self.port,
            flags: self.flags,
            tag: self.tag.clone(),
            proxied: self.proxied,
        }
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned_at.is_some()
    }
}

/// A user-authored manual record, merged into every intent rebuild
#[derive(Debug, Clone, FromRow)]
pub struct ManagedHostname {
    pub id: i64,
    /// None means "route by settings", like label-derived records
    pub provider_id: Option<i64>,
    pub hostname: String,
    pub record_type: RecordType,
    pub content: String,
    pub ttl: Option<u32>,
    pub priority: Option<u16>,
    pub weight: Option<u16>,
    pub port: Option<u16>,
    pub flags: Option<u8>,
    pub tag: Option<String>,
    pub proxied: Option<bool>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sparse patch applied to desired records matching `hostname`
#[derive(Debug, Clone, FromRow)]
pub struct OverrideRow {
    pub id: i64,
    pub hostname: String,
    pub record_type: Option<RecordType>,
    pub content: Option<String>,
    pub ttl: Option<u32>,
    pub proxied: Option<bool>,
    pub provider_id: Option<i64>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OverrideRow {
    pub fn matches(&self, hostname: &str) -> bool {
        self.enabled && hostname_matches_pattern(&self.hostname, hostname)
    }
}

/// Hostname (or `*.suffix` wildcard) exempt from orphan cleanup
#[derive(Debug, Clone, FromRow)]
pub struct PreservedHostname {
    pub id: i64,
    pub pattern: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PreservedHostname {
    pub fn matches(&self, hostname: &str) -> bool {
        hostname_matches_pattern(&self.pattern, hostname)
    }
}

/// A typed runtime setting
#[derive(Debug, Clone, FromRow)]
pub struct SettingRow {
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub category: String,
    pub updated_at: DateTime<Utc>,
}

/// A tracked tunnel ingress rule
#[derive(Debug, Clone, FromRow)]
pub struct TunnelIngressRow {
    pub id: i64,
    pub provider_id: i64,
    pub tunnel_id: String,
    pub hostname: String,
    pub service: String,
    pub path: Option<String>,
    pub no_tls_verify: bool,
    pub http_host_header: Option<String>,
    pub source: IngressSource,
    pub orphaned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TunnelIngressRow {
    pub fn is_orphaned(&self) -> bool {
        self.orphaned_at.is_some()
    }
}
