//! Cloudflare v4 API adapter, covering DNS records and Zero Trust tunnel
//! ingress.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::{
    DnsProvider, IngressRule, OriginOptions, ProviderError, ProviderRecord, TunnelInfo,
    TunnelOps, classify_status, classify_transport,
};
use crate::model::{ProviderFeatures, RecordData, RecordType};

const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";
const PAGE_SIZE: usize = 100;

// Cloudflare-specific error codes worth refining beyond the HTTP status
const CODE_RECORD_ALREADY_EXISTS: u32 = 81057;
const CODE_IDENTICAL_RECORD_EXISTS: u32 = 81058;
const CODE_RECORD_NOT_FOUND: u32 = 81044;

pub struct CloudflareProvider {
    http_client: reqwest::Client,
    api_token: String,
    zone_name: String,
    /// Required for tunnel operations only
    account_id: Option<String>,
    base_url: String,
    /// Resolved lazily from the zone name on first use
    zone_id: OnceCell<String>,
}

impl CloudflareProvider {
    pub fn new(api_token: &str, zone_name: &str, account_id: Option<String>) -> Self {
        Self::with_base_url(api_token, zone_name, account_id, DEFAULT_BASE_URL)
    }

    /// Base URL is injectable for tests
    pub fn with_base_url(
        api_token: &str,
        zone_name: &str,
        account_id: Option<String>,
        base_url: &str,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            api_token: api_token.to_string(),
            zone_name: zone_name.to_string(),
            account_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            zone_id: OnceCell::new(),
        }
    }

    async fn zone_id(&self) -> Result<&str, ProviderError> {
        self.zone_id
            .get_or_try_init(|| self.resolve_zone_id())
            .await
            .map(String::as_str)
    }

    async fn resolve_zone_id(&self) -> Result<String, ProviderError> {
        let url = format!("{}/zones?name={}", self.base_url, self.zone_name);
        let zones: Vec<CfZone> = self.get(&url).await?;

        zones
            .into_iter()
            .next()
            .map(|zone| zone.id)
            .ok_or_else(|| {
                ProviderError::NotFound(format!("zone '{}' not found", self.zone_name))
            })
    }

    fn account_id(&self) -> Result<&str, ProviderError> {
        self.account_id.as_deref().ok_or_else(|| {
            ProviderError::Validation("tunnel operations require an account id".to_string())
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ProviderError> {
        let response = self
            .http_client
            .get(url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(classify_transport)?;

        Self::handle_response(response).await
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, ProviderError> {
        let response = self
            .http_client
            .request(method, url)
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;

        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            return Err(Self::refine_error(classify_status(status, &body), &body));
        }

        let envelope: CfResponse<T> = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Internal(format!("unparseable response: {}", e)))?;

        if !envelope.success {
            let message = envelope
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Self::refine_error(ProviderError::Internal(message), &body));
        }

        envelope
            .result
            .ok_or_else(|| ProviderError::Internal("response had no result".to_string()))
    }

    /// Cloudflare reports some conditions through error codes with an
    /// unhelpful HTTP status; refine those.
    fn refine_error(fallback: ProviderError, body: &str) -> ProviderError {
        let Ok(envelope) = serde_json::from_str::<CfResponse<serde_json::Value>>(body) else {
            return fallback;
        };

        for error in &envelope.errors {
            match error.code {
                CODE_RECORD_ALREADY_EXISTS | CODE_IDENTICAL_RECORD_EXISTS => {
                    return ProviderError::Conflict(error.message.clone());
                }
                CODE_RECORD_NOT_FOUND => {
                    return ProviderError::NotFound(error.message.clone());
                }
                _ => {}
            }
        }

        fallback
    }

    fn record_payload(&self, data: &RecordData) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "type": data.record_type,
            "name": data.hostname,
            "content": data.content,
            "ttl": data.ttl,
        });

        if data.record_type.proxyable() {
            payload["proxied"] = serde_json::json!(data.proxied.unwrap_or(false));
        }

        match data.record_type {
            RecordType::Mx => {
                payload["priority"] = serde_json::json!(data.priority.unwrap_or(10));
            }
            RecordType::Srv => {
                // SRV content is canonicalized "priority weight port target"
                let parts: Vec<&str> = data.content.split_whitespace().collect();
                if parts.len() == 4 {
                    payload["data"] = serde_json::json!({
                        "name": data.hostname,
                        "priority": parts[0].parse::<u16>().unwrap_or(0),
                        "weight": parts[1].parse::<u16>().unwrap_or(0),
                        "port": parts[2].parse::<u16>().unwrap_or(0),
                        "target": parts[3],
                    });
                }
            }
            RecordType::Caa => {
                // CAA content is canonicalized "flags tag value"
                let parts: Vec<&str> = data.content.splitn(3, ' ').collect();
                if parts.len() == 3 {
                    payload["data"] = serde_json::json!({
                        "flags": parts[0].parse::<u8>().unwrap_or(0),
                        "tag": parts[1],
                        "value": parts[2].trim_matches('"'),
                    });
                }
            }
            _ => {}
        }

        payload
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    fn provider_type(&self) -> &'static str {
        "cloudflare"
    }

    fn zone(&self) -> &str {
        &self.zone_name
    }

    fn features(&self) -> ProviderFeatures {
        ProviderFeatures {
            proxied: true,
            // TTL 1 means "automatic" on Cloudflare
            ttl_min: 1,
            ttl_max: 86_400,
            supported_types: &RecordType::ALL,
            batch: false,
            txt_chunking: false,
        }
    }

    async fn list_records(&self) -> Result<Vec<ProviderRecord>, ProviderError> {
        let zone_id = self.zone_id().await?;
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let url = format!(
                "{}/zones/{}/dns_records?page={}&per_page={}",
                self.base_url, zone_id, page, PAGE_SIZE
            );
            let batch: Vec<CfDnsRecord> = self.get(&url).await?;
            let batch_len = batch.len();

            records.extend(batch.into_iter().filter_map(CfDnsRecord::into_provider_record));

            if batch_len < PAGE_SIZE {
                return Ok(records);
            }
            page += 1;
        }
    }

    async fn create_record(&self, data: &RecordData) -> Result<String, ProviderError> {
        let zone_id = self.zone_id().await?;
        let url = format!("{}/zones/{}/dns_records", self.base_url, zone_id);

        let created: CfDnsRecord = self
            .send_json(reqwest::Method::POST, &url, &self.record_payload(data))
            .await?;

        Ok(created.id)
    }

    async fn update_record(
        &self,
        external_id: &str,
        data: &RecordData,
    ) -> Result<(), ProviderError> {
        let zone_id = self.zone_id().await?;
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            self.base_url, zone_id, external_id
        );

        let _: CfDnsRecord = self
            .send_json(reqwest::Method::PUT, &url, &self.record_payload(data))
            .await?;

        Ok(())
    }

    async fn delete_record(&self, external_id: &str) -> Result<(), ProviderError> {
        let zone_id = self.zone_id().await?;
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            self.base_url, zone_id, external_id
        );

        let response = self
            .http_client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Self::refine_error(classify_status(status, &body), &body))
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        self.zone_id().await?;
        Ok(())
    }

    fn tunnel_ops(&self) -> Option<&dyn TunnelOps> {
        self.account_id.as_ref().map(|_| self as &dyn TunnelOps)
    }
}

#[async_trait]
impl TunnelOps for CloudflareProvider {
    async fn list_tunnels(&self) -> Result<Vec<TunnelInfo>, ProviderError> {
        let url = format!(
            "{}/accounts/{}/cfd_tunnel?is_deleted=false",
            self.base_url,
            self.account_id()?
        );
        self.get(&url).await
    }

    async fn create_tunnel(&self, name: &str) -> Result<TunnelInfo, ProviderError> {
        let url = format!("{}/accounts/{}/cfd_tunnel", self.base_url, self.account_id()?);
        self.send_json(
            reqwest::Method::POST,
            &url,
            &serde_json::json!({ "name": name, "config_src": "cloudflare" }),
        )
        .await
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/accounts/{}/cfd_tunnel/{}",
            self.base_url,
            self.account_id()?,
            tunnel_id
        );

        let response = self
            .http_client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn get_tunnel_token(&self, tunnel_id: &str) -> Result<String, ProviderError> {
        let url = format!(
            "{}/accounts/{}/cfd_tunnel/{}/token",
            self.base_url,
            self.account_id()?,
            tunnel_id
        );
        self.get(&url).await
    }

    async fn list_ingress(&self, tunnel_id: &str) -> Result<Vec<IngressRule>, ProviderError> {
        let config = self.get_tunnel_config(tunnel_id).await?;
        Ok(config.ingress.into_iter().map(CfIngressRule::into_rule).collect())
    }

    async fn upsert_ingress(
        &self,
        tunnel_id: &str,
        rule: &IngressRule,
    ) -> Result<(), ProviderError> {
        let mut config = self.get_tunnel_config(tunnel_id).await?;

        config
            .ingress
            .retain(|existing| existing.hostname.as_deref() != rule.hostname.as_deref());

        // Insert before the catch-all, which must stay last
        let insert_pos = config
            .ingress
            .iter()
            .position(|r| r.hostname.is_none())
            .unwrap_or(config.ingress.len());
        config.ingress.insert(insert_pos, CfIngressRule::from_rule(rule));

        self.put_tunnel_config(tunnel_id, config).await
    }

    async fn remove_ingress(
        &self,
        tunnel_id: &str,
        hostname: &str,
    ) -> Result<(), ProviderError> {
        let mut config = self.get_tunnel_config(tunnel_id).await?;

        let original_len = config.ingress.len();
        config
            .ingress
            .retain(|rule| rule.hostname.as_deref() != Some(hostname));

        if config.ingress.len() == original_len {
            return Ok(());
        }

        self.put_tunnel_config(tunnel_id, config).await
    }

    async fn deploy_config(
        &self,
        tunnel_id: &str,
        rules: &[IngressRule],
    ) -> Result<(), ProviderError> {
        let mut ingress: Vec<CfIngressRule> =
            rules.iter().map(CfIngressRule::from_rule).collect();

        if !ingress.iter().any(|rule| rule.hostname.is_none()) {
            ingress.push(CfIngressRule::from_rule(&IngressRule::catch_all()));
        }

        // Replace only the ingress table; unmanaged tunnel settings survive
        let mut config = self.get_tunnel_config(tunnel_id).await?;
        config.ingress = ingress;

        self.put_tunnel_config(tunnel_id, config).await
    }
}

impl CloudflareProvider {
    async fn get_tunnel_config(&self, tunnel_id: &str) -> Result<CfTunnelConfig, ProviderError> {
        let url = format!(
            "{}/accounts/{}/cfd_tunnel/{}/configurations",
            self.base_url,
            self.account_id()?,
            tunnel_id
        );
        let envelope: CfTunnelConfigEnvelope = self.get(&url).await?;
        Ok(envelope.config)
    }

    async fn put_tunnel_config(
        &self,
        tunnel_id: &str,
        config: CfTunnelConfig,
    ) -> Result<(), ProviderError> {
        let url = format!(
            "{}/accounts/{}/cfd_tunnel/{}/configurations",
            self.base_url,
            self.account_id()?,
            tunnel_id
        );

        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::PUT,
                &url,
                &serde_json::json!({ "config": config }),
            )
            .await?;

        Ok(())
    }
}

// ==================== API types ====================

#[derive(Debug, Deserialize)]
struct CfResponse<T> {
    #[serde(default)]
    success: bool,
    result: Option<T>,
    #[serde(default)]
    errors: Vec<CfError>,
}

#[derive(Debug, Deserialize)]
struct CfError {
    code: u32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CfZone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CfDnsRecord {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
    ttl: u32,
    #[serde(default)]
    proxied: Option<bool>,
    #[serde(default)]
    priority: Option<u16>,
}

impl CfDnsRecord {
    /// Records of types the engine does not manage are dropped
    fn into_provider_record(self) -> Option<ProviderRecord> {
        let record_type: RecordType = self.record_type.parse().ok()?;

        Some(ProviderRecord {
            external_id: self.id,
            data: RecordData {
                hostname: self.name,
                record_type,
                content: self.content,
                ttl: self.ttl,
                priority: self.priority,
                weight: None,
                port: None,
                flags: None,
                tag: None,
                proxied: self.proxied,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct CfTunnelConfigEnvelope {
    config: CfTunnelConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct CfTunnelConfig {
    #[serde(default)]
    ingress: Vec<CfIngressRule>,
    /// Settings the engine does not manage (warp-routing, origin defaults)
    /// survive the round trip untouched
    #[serde(flatten, default)]
    other: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CfIngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(
        rename = "originRequest",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    origin_request: Option<CfOriginRequest>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CfOriginRequest {
    #[serde(rename = "noTLSVerify", default)]
    no_tls_verify: bool,
    #[serde(rename = "httpHostHeader", skip_serializing_if = "Option::is_none")]
    http_host_header: Option<String>,
}

impl CfIngressRule {
    fn from_rule(rule: &IngressRule) -> Self {
        let origin_request = if rule.origin != OriginOptions::default() {
            Some(CfOriginRequest {
                no_tls_verify: rule.origin.no_tls_verify,
                http_host_header: rule.origin.http_host_header.clone(),
            })
        } else {
            None
        };

        Self {
            hostname: rule.hostname.clone(),
            service: rule.service.clone(),
            path: rule.path.clone(),
            origin_request,
        }
    }

    fn into_rule(self) -> IngressRule {
        let origin = self
            .origin_request
            .map(|origin| OriginOptions {
                no_tls_verify: origin.no_tls_verify,
                http_host_header: origin.http_host_header,
            })
            .unwrap_or_default();

        IngressRule {
            hostname: self.hostname,
            service: self.service,
            path: self.path,
            origin,
        }
    }
}
