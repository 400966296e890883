//! DNS provider adapters.
//!
//! Every adapter exposes the same capability contract: list/create/update/
//! delete plus declared features, with native errors translated into the
//! common taxonomy so the reconciler can decide what is retryable without
//! knowing the provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::ProviderRow;
use crate::model::{ProviderFeatures, RecordData};
use crate::secrets::SecretStore;

pub mod cloudflare;
pub mod digitalocean;

pub use cloudflare::CloudflareProvider;
pub use digitalocean::DigitalOceanProvider;

/// Common error taxonomy for provider adapters
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Malformed input; surfaced to the caller, never retried
    #[error("validation failed: {0}")]
    Validation(String),

    /// The resource does not exist at the provider
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate on create; the reconciler falls back to the update path
    #[error("conflict: {0}")]
    Conflict(String),

    /// Provider asked us to slow down
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Timeouts, 5xx, transport errors; retried with backoff
    #[error("transient error: {0}")]
    Transient(String),

    /// Credentials rejected; provider is disabled pending intervention
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Anything the adapter could not classify
    #[error("provider error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Whether the reconciler should retry this error within the cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }
}

/// A record as it exists at the provider
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub external_id: String,
    pub data: RecordData,
}

/// A tunnel as reported by the provider
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelInfo {
    pub id: String,
    pub name: String,
}

/// Origin connection options on an ingress rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginOptions {
    pub no_tls_verify: bool,
    pub http_host_header: Option<String>,
}

/// An ingress rule in a tunnel configuration.
///
/// `hostname: None` is the catch-all rule, which must come last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub hostname: Option<String>,
    pub service: String,
    pub path: Option<String>,
    pub origin: OriginOptions,
}

impl IngressRule {
    pub fn catch_all() -> Self {
        Self {
            hostname: None,
            service: "http_status:404".to_string(),
            path: None,
            origin: OriginOptions::default(),
        }
    }
}

/// Tunnel ingress operations for providers that support them
#[async_trait]
pub trait TunnelOps: Send + Sync {
    async fn list_tunnels(&self) -> Result<Vec<TunnelInfo>, ProviderError>;
    async fn create_tunnel(&self, name: &str) -> Result<TunnelInfo, ProviderError>;
    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<(), ProviderError>;
    async fn get_tunnel_token(&self, tunnel_id: &str) -> Result<String, ProviderError>;

    async fn list_ingress(&self, tunnel_id: &str) -> Result<Vec<IngressRule>, ProviderError>;

    /// Insert or replace a single rule, keeping the catch-all last
    async fn upsert_ingress(
        &self,
        tunnel_id: &str,
        rule: &IngressRule,
    ) -> Result<(), ProviderError>;

    /// Remove the rule for a hostname; absent is success
    async fn remove_ingress(&self, tunnel_id: &str, hostname: &str)
    -> Result<(), ProviderError>;

    /// Replace the full remote ingress configuration
    async fn deploy_config(
        &self,
        tunnel_id: &str,
        rules: &[IngressRule],
    ) -> Result<(), ProviderError>;
}

/// The capability contract every DNS provider adapter implements
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Provider type tag used in label scoping (e.g. "cloudflare")
    fn provider_type(&self) -> &'static str;

    /// The zone this adapter writes to
    fn zone(&self) -> &str;

    fn features(&self) -> ProviderFeatures;

    async fn list_records(&self) -> Result<Vec<ProviderRecord>, ProviderError>;

    /// Create a record, returning the provider's identifier.
    ///
    /// A `(name, type)` collision must surface as [`ProviderError::Conflict`]
    /// so the reconciler can adopt the existing record and update it.
    async fn create_record(&self, data: &RecordData) -> Result<String, ProviderError>;

    async fn update_record(
        &self,
        external_id: &str,
        data: &RecordData,
    ) -> Result<(), ProviderError>;

    /// Delete a record; "not found" is treated as success by callers
    async fn delete_record(&self, external_id: &str) -> Result<(), ProviderError>;

    async fn test_connection(&self) -> Result<(), ProviderError>;

    /// Tunnel operations, for adapters that support Zero Trust ingress
    fn tunnel_ops(&self) -> Option<&dyn TunnelOps> {
        None
    }
}

/// An enabled provider with its configuration row and adapter
#[derive(Clone)]
pub struct ProviderHandle {
    pub row: ProviderRow,
    pub adapter: Arc<dyn DnsProvider>,
}

/// Maps provider ids to live adapters, built from configuration rows at
/// startup and whenever providers change.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    handles: HashMap<i64, ProviderHandle>,
}

impl ProviderRegistry {
    /// Instantiate adapters for every enabled provider row.
    ///
    /// A provider whose credentials cannot be resolved is skipped (and
    /// reported) rather than failing the whole registry.
    pub async fn build(
        rows: Vec<ProviderRow>,
        secrets: &dyn SecretStore,
    ) -> (Self, Vec<(String, String)>) {
        let mut handles = HashMap::new();
        let mut failures = Vec::new();

        for row in rows {
            match Self::build_adapter(&row, secrets).await {
                Ok(adapter) => {
                    handles.insert(row.id, ProviderHandle { row, adapter });
                }
                Err(reason) => {
                    tracing::error!(
                        provider = %row.name,
                        provider_type = %row.provider_type,
                        reason = %reason,
                        "Provider unavailable"
                    );
                    failures.push((row.name.clone(), reason));
                }
            }
        }

        (Self { handles }, failures)
    }

    async fn build_adapter(
        row: &ProviderRow,
        secrets: &dyn SecretStore,
    ) -> Result<Arc<dyn DnsProvider>, String> {
        let credential_ref = row
            .credential_ref
            .as_deref()
            .ok_or_else(|| "no credential reference configured".to_string())?;

        let token = secrets
            .get(credential_ref)
            .await
            .map_err(|e| e.to_string())?;

        match row.provider_type.as_str() {
            "cloudflare" => {
                let account_id = match &row.account_ref {
                    Some(account_ref) => Some(
                        secrets
                            .get(account_ref)
                            .await
                            .map_err(|e| e.to_string())?,
                    ),
                    None => None,
                };
                Ok(Arc::new(cloudflare::CloudflareProvider::new(
                    &token, &row.zone, account_id,
                )))
            }
            "digitalocean" => Ok(Arc::new(digitalocean::DigitalOceanProvider::new(
                &token, &row.zone,
            ))),
            other => Err(format!("unknown provider type '{}'", other)),
        }
    }

    /// Assemble a registry from pre-built handles (tests, embedding)
    pub fn from_handles(handles: Vec<ProviderHandle>) -> Self {
        Self {
            handles: handles.into_iter().map(|h| (h.row.id, h)).collect(),
        }
    }

    pub fn get(&self, provider_id: i64) -> Option<&ProviderHandle> {
        self.handles.get(&provider_id)
    }

    /// Handles in routing order (priority, then id)
    pub fn in_routing_order(&self) -> Vec<&ProviderHandle> {
        let mut handles: Vec<&ProviderHandle> = self.handles.values().collect();
        handles.sort_by_key(|h| (h.row.priority, h.row.id));
        handles
    }

    /// The primary provider: lowest priority, then lowest id
    pub fn primary(&self) -> Option<&ProviderHandle> {
        self.in_routing_order().into_iter().next()
    }

    /// Declared features per provider id, as the intent builder consumes them
    pub fn features_by_id(&self) -> HashMap<i64, ProviderFeatures> {
        self.handles
            .iter()
            .map(|(id, handle)| (*id, handle.adapter.features()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

/// Map an HTTP status (plus already-read body text) to the taxonomy.
///
/// Shared by the reqwest-based adapters.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> ProviderError {
    match status.as_u16() {
        400 | 422 => ProviderError::Validation(body.to_string()),
        401 | 403 => ProviderError::Auth(body.to_string()),
        404 => ProviderError::NotFound(body.to_string()),
        409 => ProviderError::Conflict(body.to_string()),
        429 => ProviderError::RateLimited { retry_after: None },
        code if code >= 500 => ProviderError::Transient(format!("status {}: {}", code, body)),
        code => ProviderError::Internal(format!("status {}: {}", code, body)),
    }
}

/// Map a transport-level reqwest error to the taxonomy
pub(crate) fn classify_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::Transient(e.to_string())
    } else {
        ProviderError::Internal(e.to_string())
    }
}
