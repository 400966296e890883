use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use derive_more::Display;

/// Bootstrap configuration loaded from the environment.
///
/// Everything that can change at runtime lives in [`Settings`] instead and is
/// persisted in the settings table.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Path to the Docker socket
    pub docker_socket: PathBuf,

    /// Traefik API base URL (e.g., "http://traefik:8080/api")
    pub traefik_api_url: Option<String>,

    /// Optional basic-auth credentials for the Traefik API
    pub traefik_api_username: Option<String>,
    pub traefik_api_password: Option<String>,

    /// Label prefix for the DNS namespace, including the trailing dot
    pub label_prefix: String,

    /// Log output format: "text" or "json"
    pub log_json: bool,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let label_prefix = std::env::var("DNS_LABEL_PREFIX").unwrap_or_else(|_| "dns.".to_string());
        if !label_prefix.ends_with('.') {
            anyhow::bail!(
                "DNS_LABEL_PREFIX must end with a dot, got '{}'",
                label_prefix
            );
        }

        let traefik_api_url = match std::env::var("TRAEFIK_API_URL") {
            Ok(raw) => {
                let parsed = url::Url::parse(&raw)
                    .with_context(|| format!("TRAEFIK_API_URL '{}' is not a valid URL", raw))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    anyhow::bail!("TRAEFIK_API_URL must be http(s), got '{}'", raw);
                }
                Some(raw.trim_end_matches('/').to_string())
            }
            Err(_) => None,
        };

        Ok(Self {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "/data/trafegodns.db".to_string())
                .into(),

            docker_socket: std::env::var("DOCKER_SOCKET")
                .unwrap_or_else(|_| Self::detect_docker_socket())
                .into(),

            traefik_api_url,

            traefik_api_username: std::env::var("TRAEFIK_API_USERNAME").ok(),
            traefik_api_password: std::env::var("TRAEFIK_API_PASSWORD").ok(),

            label_prefix,

            log_json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }

    /// Detect the best available Docker socket.
    ///
    /// Prefers the system socket, falls back to the rootless user socket.
    fn detect_docker_socket() -> String {
        let system_socket = "/var/run/docker.sock";
        if std::path::Path::new(system_socket).exists() {
            return system_socket.to_string();
        }

        // Rootless Docker puts the socket under the user's runtime dir
        // SAFETY: getuid is safe to call and returns the real user ID
        let uid = unsafe { libc::getuid() };
        let user_socket = format!("/run/user/{}/docker.sock", uid);
        if std::path::Path::new(&user_socket).exists() {
            return user_socket;
        }

        // Default to the system socket even if it doesn't exist
        // (will fail with a clear error when used)
        system_socket.to_string()
    }
}

/// How hostnames are observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OperationMode {
    /// Poll the Traefik routing API and cross-reference container labels
    #[display("traefik")]
    Traefik,
    /// Read DNS labels straight off containers
    #[display("direct")]
    Direct,
}

impl FromStr for OperationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "traefik" => Ok(OperationMode::Traefik),
            "direct" => Ok(OperationMode::Direct),
            other => Err(format!("Unknown operation mode: {}", other)),
        }
    }
}

/// How records are routed when several providers are enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RoutingMode {
    /// Everything goes to the default provider
    #[display("primary-only")]
    PrimaryOnly,
    /// Hostnames are distributed across providers in id order
    #[display("round-robin")]
    RoundRobin,
    /// Providers are tried in priority order on failure
    #[display("auto-with-fallback")]
    AutoWithFallback,
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary-only" | "primary_only" => Ok(RoutingMode::PrimaryOnly),
            "round-robin" | "round_robin" => Ok(RoutingMode::RoundRobin),
            "auto-with-fallback" | "auto_with_fallback" => Ok(RoutingMode::AutoWithFallback),
            other => Err(format!("Unknown routing mode: {}", other)),
        }
    }
}

/// Which hostnames get tunnel ingress rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TunnelMode {
    #[display("off")]
    Off,
    /// Every observed hostname
    #[display("all")]
    All,
    /// Only containers carrying the tunnel label
    #[display("labeled")]
    Labeled,
}

impl FromStr for TunnelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(TunnelMode::Off),
            "all" => Ok(TunnelMode::All),
            "labeled" => Ok(TunnelMode::Labeled),
            other => Err(format!("Unknown tunnel mode: {}", other)),
        }
    }
}

/// Runtime settings, persisted in the settings table and re-read at the top
/// of every reconciliation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub operation_mode: OperationMode,
    pub poll_interval_ms: u64,
    pub cleanup_orphaned: bool,
    pub cleanup_grace_period_min: u64,
    pub dns_default_type: String,
    pub dns_default_ttl: u32,
    pub dns_default_proxied: bool,
    pub dns_default_manage: bool,
    pub dns_routing_mode: RoutingMode,
    pub dns_multi_provider_same_zone: bool,
    pub tunnel_mode: TunnelMode,
    pub tunnel_default_tunnel_id: Option<String>,
    pub tunnel_default_service_url: Option<String>,
    pub ip_refresh_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            operation_mode: OperationMode::Traefik,
            poll_interval_ms: 30_000,
            cleanup_orphaned: true,
            cleanup_grace_period_min: 15,
            dns_default_type: "CNAME".to_string(),
            dns_default_ttl: 1,
            dns_default_proxied: true,
            dns_default_manage: true,
            dns_routing_mode: RoutingMode::PrimaryOnly,
            dns_multi_provider_same_zone: false,
            tunnel_mode: TunnelMode::Off,
            tunnel_default_tunnel_id: None,
            tunnel_default_service_url: None,
            ip_refresh_interval_ms: 3_600_000,
        }
    }
}

impl Settings {
    /// Keys recognized in the settings table
    pub const KEYS: [&'static str; 14] = [
        "operation_mode",
        "poll_interval_ms",
        "cleanup_orphaned",
        "cleanup_grace_period_min",
        "dns_default_type",
        "dns_default_ttl",
        "dns_default_proxied",
        "dns_default_manage",
        "dns_routing_mode",
        "dns_multi_provider_same_zone",
        "tunnel_mode",
        "tunnel_default_tunnel_id",
        "tunnel_default_service_url",
        "ip_refresh_interval_ms",
    ];

    /// Build settings from persisted key/value rows.
    ///
    /// Unknown keys are ignored; unparseable values keep the default and log
    /// a warning rather than failing the cycle.
    pub fn from_kv(rows: &HashMap<String, String>) -> Self {
        let mut settings = Settings::default();

        for (key, value) in rows {
            let applied = settings.apply(key, value);
            if !applied {
                tracing::warn!(key = %key, value = %value, "Ignoring unusable setting value");
            }
        }

        // A contradictory combination: round-robin spreads one zone across
        // providers, which same_zone=false forbids. Resolve as primary-only.
        if settings.dns_routing_mode == RoutingMode::RoundRobin
            && !settings.dns_multi_provider_same_zone
        {
            tracing::warn!(
                "dns_routing_mode=round-robin requires dns_multi_provider_same_zone=true; \
                 falling back to primary-only"
            );
            settings.dns_routing_mode = RoutingMode::PrimaryOnly;
        }

        settings
    }

    fn apply(&mut self, key: &str, value: &str) -> bool {
        match key {
            "operation_mode" => set_parsed(&mut self.operation_mode, value),
            "poll_interval_ms" => set_parsed(&mut self.poll_interval_ms, value),
            "cleanup_orphaned" => set_bool(&mut self.cleanup_orphaned, value),
            "cleanup_grace_period_min" => set_parsed(&mut self.cleanup_grace_period_min, value),
            "dns_default_type" => {
                self.dns_default_type = value.to_uppercase();
                true
            }
            "dns_default_ttl" => set_parsed(&mut self.dns_default_ttl, value),
            "dns_default_proxied" => set_bool(&mut self.dns_default_proxied, value),
            "dns_default_manage" => set_bool(&mut self.dns_default_manage, value),
            "dns_routing_mode" => set_parsed(&mut self.dns_routing_mode, value),
            "dns_multi_provider_same_zone" => {
                set_bool(&mut self.dns_multi_provider_same_zone, value)
            }
            "tunnel_mode" => set_parsed(&mut self.tunnel_mode, value),
            "tunnel_default_tunnel_id" => {
                self.tunnel_default_tunnel_id = non_empty(value);
                true
            }
            "tunnel_default_service_url" => {
                self.tunnel_default_service_url = non_empty(value);
                true
            }
            "ip_refresh_interval_ms" => set_parsed(&mut self.ip_refresh_interval_ms, value),
            _ => false,
        }
    }

    /// Environment values used to seed missing settings rows on first boot.
    ///
    /// Persisted values always win afterwards; the environment only fills
    /// gaps so the engine stays 12-factor friendly in containers.
    pub fn env_seed() -> Vec<(String, String)> {
        Self::KEYS
            .iter()
            .filter_map(|key| {
                std::env::var(key.to_uppercase()).ok().map(|value| {
                    (key.to_string(), value)
                })
            })
            .collect()
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cleanup_grace_period_min as i64)
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, value: &str) -> bool {
    match value.trim().parse::<T>() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

fn set_bool(slot: &mut bool, value: &str) -> bool {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => {
            *slot = true;
            true
        }
        "false" | "0" | "no" => {
            *slot = false;
            true
        }
        _ => false,
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_kv(&HashMap::new());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_settings_parse() {
        let settings = Settings::from_kv(&kv(&[
            ("operation_mode", "direct"),
            ("cleanup_grace_period_min", "30"),
            ("dns_default_proxied", "false"),
            ("tunnel_mode", "labeled"),
        ]));
        assert_eq!(settings.operation_mode, OperationMode::Direct);
        assert_eq!(settings.cleanup_grace_period_min, 30);
        assert!(!settings.dns_default_proxied);
        assert_eq!(settings.tunnel_mode, TunnelMode::Labeled);
    }

    #[test]
    fn test_bad_value_keeps_default() {
        let settings = Settings::from_kv(&kv(&[("poll_interval_ms", "soon")]));
        assert_eq!(settings.poll_interval_ms, Settings::default().poll_interval_ms);
    }

    #[test]
    fn test_round_robin_without_same_zone_falls_back() {
        let settings = Settings::from_kv(&kv(&[
            ("dns_routing_mode", "round-robin"),
            ("dns_multi_provider_same_zone", "false"),
        ]));
        assert_eq!(settings.dns_routing_mode, RoutingMode::PrimaryOnly);

        let settings = Settings::from_kv(&kv(&[
            ("dns_routing_mode", "round-robin"),
            ("dns_multi_provider_same_zone", "true"),
        ]));
        assert_eq!(settings.dns_routing_mode, RoutingMode::RoundRobin);
    }
}
