//! Public IP discovery.
//!
//! Apex records can't be CNAMEs, so the engine rewrites them to A/AAAA using
//! the host's discovered public addresses. Discovery is HTTP-based and
//! refreshed on a timer; consumers read the cache and never block on the
//! network.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;

const IPV4_LOOKUP_URL: &str = "https://api.ipify.org";
const IPV6_LOOKUP_URL: &str = "https://api6.ipify.org";

/// The host's currently known public addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublicIp {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

/// Shared, periodically refreshed public-IP cache
#[derive(Clone)]
pub struct PublicIpCache {
    http_client: reqwest::Client,
    current: Arc<RwLock<PublicIp>>,
    v4_url: String,
    v6_url: String,
}

impl PublicIpCache {
    pub fn new() -> Self {
        Self::with_urls(IPV4_LOOKUP_URL, IPV6_LOOKUP_URL)
    }

    /// Lookup endpoints are injectable for tests
    pub fn with_urls(v4_url: &str, v6_url: &str) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            current: Arc::new(RwLock::new(PublicIp::default())),
            v4_url: v4_url.to_string(),
            v6_url: v6_url.to_string(),
        }
    }

    pub async fn current(&self) -> PublicIp {
        *self.current.read().await
    }

    /// Re-discover both address families.
    ///
    /// A family that fails to resolve keeps its previous value; plenty of
    /// hosts legitimately have no public IPv6 at all.
    pub async fn refresh(&self) -> Result<PublicIp> {
        let v4 = match self.lookup_v4().await {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::debug!(error = %e, "IPv4 discovery failed");
                self.current.read().await.v4
            }
        };

        let v6 = match self.lookup_v6().await {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::debug!(error = %e, "IPv6 discovery failed");
                self.current.read().await.v6
            }
        };

        let discovered = PublicIp { v4, v6 };

        let mut current = self.current.write().await;
        if *current != discovered {
            tracing::info!(
                ipv4 = ?discovered.v4,
                ipv6 = ?discovered.v6,
                "Public IP changed"
            );
        }
        *current = discovered;

        Ok(discovered)
    }

    async fn lookup_v4(&self) -> Result<Ipv4Addr> {
        let body = self.fetch(&self.v4_url).await?;
        body.trim()
            .parse::<Ipv4Addr>()
            .with_context(|| format!("Lookup service returned non-IPv4 answer '{}'", body.trim()))
    }

    async fn lookup_v6(&self) -> Result<Ipv6Addr> {
        let body = self.fetch(&self.v6_url).await?;
        let answer = body.trim();

        // Some lookup services answer with an IPv4 (or garbage) when the host
        // has no v6 route; anything without a colon is not an address
        if !answer.contains(':') {
            anyhow::bail!("Lookup service returned non-IPv6 answer '{}'", answer);
        }

        answer
            .parse::<Ipv6Addr>()
            .with_context(|| format!("Lookup service returned non-IPv6 answer '{}'", answer))
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("IP lookup returned status {}", response.status());
        }

        Ok(response.text().await.context("Failed to read lookup body")?)
    }
}

impl Default for PublicIpCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_starts_empty() {
        let cache = PublicIpCache::new();
        assert_eq!(cache.current().await, PublicIp::default());
    }
}
