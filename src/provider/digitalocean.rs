//! DigitalOcean v2 domains API adapter.
//!
//! DigitalOcean addresses records by relative name within the domain (`@` for
//! the apex) and splits SRV/CAA/MX attributes into separate fields, so this
//! adapter translates both directions to the engine's canonical forms.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    DnsProvider, ProviderError, ProviderRecord, classify_status, classify_transport,
};
use crate::model::{ProviderFeatures, RecordData, RecordType, normalize_hostname};

const DEFAULT_BASE_URL: &str = "https://api.digitalocean.com/v2";
const PAGE_SIZE: usize = 200;

pub struct DigitalOceanProvider {
    http_client: reqwest::Client,
    api_token: String,
    zone_name: String,
    base_url: String,
}

impl DigitalOceanProvider {
    pub fn new(api_token: &str, zone_name: &str) -> Self {
        Self::with_base_url(api_token, zone_name, DEFAULT_BASE_URL)
    }

    /// Base URL is injectable for tests
    pub fn with_base_url(api_token: &str, zone_name: &str, base_url: &str) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            api_token: api_token.to_string(),
            zone_name: normalize_hostname(zone_name),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// FQDN → DigitalOcean relative name (`@` for the apex)
    fn relative_name(&self, hostname: &str) -> String {
        let hostname = normalize_hostname(hostname);
        if hostname == self.zone_name {
            "@".to_string()
        } else {
            hostname
                .strip_suffix(&format!(".{}", self.zone_name))
                .unwrap_or(&hostname)
                .to_string()
        }
    }

    fn absolute_name(&self, relative: &str) -> String {
        if relative == "@" {
            self.zone_name.clone()
        } else {
            format!("{}.{}", relative, self.zone_name)
        }
    }

    fn record_payload(&self, data: &RecordData) -> DoRecordPayload {
        let name = self.relative_name(&data.hostname);

        match data.record_type {
            RecordType::Srv => {
                // canonical "priority weight port target"
                let parts: Vec<&str> = data.content.split_whitespace().collect();
                let (priority, weight, port, target) = match parts.as_slice() {
                    [p, w, o, t] => (
                        p.parse().ok(),
                        w.parse().ok(),
                        o.parse().ok(),
                        (*t).to_string(),
                    ),
                    _ => (None, None, None, data.content.clone()),
                };

                DoRecordPayload {
                    record_type: data.record_type.to_string(),
                    name,
                    data: format!("{}.", target),
                    ttl: data.ttl,
                    priority,
                    weight,
                    port,
                    flags: None,
                    tag: None,
                }
            }
            RecordType::Caa => {
                // canonical "flags tag value"
                let parts: Vec<&str> = data.content.splitn(3, ' ').collect();
                let (flags, tag, value) = match parts.as_slice() {
                    [f, t, v] => (f.parse().ok(), Some((*t).to_string()), *v),
                    _ => (None, None, data.content.as_str()),
                };

                DoRecordPayload {
                    record_type: data.record_type.to_string(),
                    name,
                    data: value.trim_matches('"').to_string(),
                    ttl: data.ttl,
                    priority: None,
                    weight: None,
                    port: None,
                    flags,
                    tag,
                }
            }
            RecordType::Mx => DoRecordPayload {
                record_type: data.record_type.to_string(),
                name,
                data: format!("{}.", data.content),
                ttl: data.ttl,
                priority: data.priority.or(Some(10)),
                weight: None,
                port: None,
                flags: None,
                tag: None,
            },
            RecordType::Cname | RecordType::Ns => DoRecordPayload {
                record_type: data.record_type.to_string(),
                name,
                data: format!("{}.", data.content),
                ttl: data.ttl,
                priority: None,
                weight: None,
                port: None,
                flags: None,
                tag: None,
            },
            _ => DoRecordPayload {
                record_type: data.record_type.to_string(),
                name,
                data: data.content.clone(),
                ttl: data.ttl,
                priority: None,
                weight: None,
                port: None,
                flags: None,
                tag: None,
            },
        }
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&DoRecordPayload>,
    ) -> Result<T, ProviderError> {
        let mut request = self
            .http_client
            .request(method, url)
            .bearer_auth(&self.api_token);

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Internal(format!("unparseable response: {}", e)))
    }
}

#[async_trait]
impl DnsProvider for DigitalOceanProvider {
    fn provider_type(&self) -> &'static str {
        "digitalocean"
    }

    fn zone(&self) -> &str {
        &self.zone_name
    }

    fn features(&self) -> ProviderFeatures {
        ProviderFeatures {
            proxied: false,
            ttl_min: 30,
            ttl_max: 86_400,
            supported_types: &RecordType::ALL,
            batch: false,
            txt_chunking: false,
        }
    }

    async fn list_records(&self) -> Result<Vec<ProviderRecord>, ProviderError> {
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let url = format!(
                "{}/domains/{}/records?page={}&per_page={}",
                self.base_url, self.zone_name, page, PAGE_SIZE
            );
            let response: DoRecordsResponse = self
                .request(reqwest::Method::GET, &url, None)
                .await?;

            let batch_len = response.domain_records.len();
            records.extend(
                response
                    .domain_records
                    .into_iter()
                    .filter_map(|record| record.into_provider_record(self)),
            );

            if batch_len < PAGE_SIZE {
                return Ok(records);
            }
            page += 1;
        }
    }

    async fn create_record(&self, data: &RecordData) -> Result<String, ProviderError> {
        let url = format!("{}/domains/{}/records", self.base_url, self.zone_name);
        let payload = self.record_payload(data);

        let response: DoRecordResponse = self
            .request(reqwest::Method::POST, &url, Some(&payload))
            .await?;

        Ok(response.domain_record.id.to_string())
    }

    async fn update_record(
        &self,
        external_id: &str,
        data: &RecordData,
    ) -> Result<(), ProviderError> {
        let url = format!(
            "{}/domains/{}/records/{}",
            self.base_url, self.zone_name, external_id
        );
        let payload = self.record_payload(data);

        let _: DoRecordResponse = self
            .request(reqwest::Method::PUT, &url, Some(&payload))
            .await?;

        Ok(())
    }

    async fn delete_record(&self, external_id: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/domains/{}/records/{}",
            self.base_url, self.zone_name, external_id
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

    async fn test_connection(&self) -> Result<(), ProviderError> {
        let url = format!("{}/domains/{}", self.base_url, self.zone_name);
        let _: serde_json::Value = self.request(reqwest::Method::GET, &url, None).await?;
        Ok(())
    }
}

// ==================== API types ====================

#[derive(Debug, Serialize)]
struct DoRecordPayload {
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    data: String,
    ttl: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flags: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DoRecordsResponse {
    domain_records: Vec<DoRecord>,
}

#[derive(Debug, Deserialize)]
struct DoRecordResponse {
    domain_record: DoRecord,
}

#[derive(Debug, Deserialize)]
struct DoRecord {
    id: i64,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    data: String,
    ttl: u32,
    #[serde(default)]
    priority: Option<u16>,
    #[serde(default)]
    weight: Option<u16>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    flags: Option<u8>,
    #[serde(default)]
    tag: Option<String>,
}

impl DoRecord {
    /// Rebuild the engine's canonical content from DigitalOcean's split fields
    fn into_provider_record(self, provider: &DigitalOceanProvider) -> Option<ProviderRecord> {
        let record_type: RecordType = self.record_type.parse().ok()?;
        let hostname = provider.absolute_name(&self.name);
        let target = normalize_hostname(&self.data);

        let content = match record_type {
            RecordType::Srv => format!(
                "{} {} {} {}",
                self.priority.unwrap_or(0),
                self.weight.unwrap_or(0),
                self.port.unwrap_or(0),
                target
            ),
            RecordType::Caa => format!(
                "{} {} \"{}\"",
                self.flags.unwrap_or(0),
                self.tag.as_deref().unwrap_or("issue"),
                self.data.trim_matches('"')
            ),
            RecordType::Cname | RecordType::Ns | RecordType::Mx => target,
            _ => self.data.clone(),
        };

        Some(ProviderRecord {
            external_id: self.id.to_string(),
            data: RecordData {
                hostname,
                record_type,
                content,
                ttl: self.ttl,
                priority: self.priority,
                weight: self.weight,
                port: self.port,
                flags: self.flags,
                tag: self.tag,
                proxied: None,
            },
        })
    }
}
