use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::docker::ContainerInfo;
use crate::model::{normalize_hostname, validate_hostname};

/// A router as reported by the Traefik API
#[derive(Debug, Clone, Deserialize)]
pub struct TraefikRouter {
    pub name: String,
    pub rule: String,
    #[serde(default)]
    pub service: String,
}

/// Client for the Traefik routing API
#[derive(Clone)]
pub struct TraefikClient {
    http_client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl TraefikClient {
    pub fn new(base_url: &str, username: Option<String>, password: Option<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
        }
    }

    /// Fetch all HTTP routers
    pub async fn fetch_routers(&self) -> Result<Vec<TraefikRouter>> {
        let url = format!("{}/http/routers", self.base_url);

        let mut request = self.http_client.get(&url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .context("Failed to query Traefik API")?;

        if !response.status().is_success() {
            anyhow::bail!("Traefik API returned status {}", response.status());
        }

        let routers: Vec<TraefikRouter> = response
            .json()
            .await
            .context("Failed to parse Traefik routers response")?;

        Ok(routers)
    }
}

/// Extract hostnames from a Traefik router rule.
///
/// Handles the v2 form `` Host(`a.example.com`) `` (several backticked
/// arguments and several `Host()` clauses allowed) and the v1 form
/// `Host:a.example.com,b.example.com`. Invalid hostnames are dropped.
pub fn hostnames_from_rule(rule: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();

    // v2: every Host(...) clause, backtick-quoted arguments
    let mut rest = rule;
    while let Some(start) = rest.find("Host(") {
        let after = &rest[start + 5..];
        let Some(end) = after.find(')') else { break };

        let args = &after[..end];
        let mut parts = args.split('`');
        // odd-indexed split segments are the quoted values
        parts.next();
        while let (Some(value), skip) = (parts.next(), parts.next()) {
            found.push(value.to_string());
            if skip.is_none() {
                break;
            }
        }

        rest = &after[end..];
    }

    // v1: Host:a,b (terminated by ';' or whitespace)
    if found.is_empty() {
        if let Some(start) = rule.find("Host:") {
            let after = &rule[start + 5..];
            let list = after
                .split(|c: char| c == ';' || c.is_whitespace())
                .next()
                .unwrap_or("");
            found.extend(list.split(',').map(str::to_string));
        }
    }

    let mut seen = std::collections::HashSet::new();
    found
        .into_iter()
        .map(|h| normalize_hostname(&h))
        .filter(|h| !h.is_empty() && validate_hostname(h).is_ok())
        .filter(|h| seen.insert(h.clone()))
        .collect()
}

/// Cross-reference from Traefik router names back to the containers that
/// declared them, so routers inherit the DNS labels of their container.
pub struct RouterIndex<'a> {
    by_router: HashMap<String, &'a ContainerInfo>,
    by_service: HashMap<String, &'a ContainerInfo>,
}

impl<'a> RouterIndex<'a> {
    pub fn build(containers: &'a [ContainerInfo]) -> Self {
        let mut by_router = HashMap::new();
        let mut by_service = HashMap::new();

        for container in containers {
            for key in container.labels.keys() {
                if let Some(router) = label_segment(key, "traefik.http.routers.") {
                    by_router.entry(router).or_insert(container);
                }
                if let Some(service) = label_segment(key, "traefik.http.services.") {
                    by_service.entry(service).or_insert(container);
                }
            }
        }

        Self {
            by_router,
            by_service,
        }
    }

    /// The container backing a router, by router name first, then by the
    /// router's service name.
    pub fn container_for(&self, router: &TraefikRouter) -> Option<&'a ContainerInfo> {
        let router_name = strip_provider(&router.name);
        if let Some(container) = self.by_router.get(router_name) {
            return Some(container);
        }

        let service_name = strip_provider(&router.service);
        self.by_service.get(service_name).copied()
    }
}

/// Router names from the API carry a provider suffix: `app@docker`
fn strip_provider(name: &str) -> &str {
    name.split('@').next().unwrap_or(name)
}

fn label_segment(key: &str, prefix: &str) -> Option<String> {
    key.strip_prefix(prefix)
        .and_then(|rest| rest.split('.').next())
        .map(str::to_string)
}
