use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// DNS record types the engine can manage
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, sqlx::Type,
)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum RecordType {
    #[display("A")]
    A,
    #[display("AAAA")]
    Aaaa,
    #[display("CNAME")]
    Cname,
    #[display("MX")]
    Mx,
    #[display("TXT")]
    Txt,
    #[display("SRV")]
    Srv,
    #[display("CAA")]
    Caa,
    #[display("NS")]
    Ns,
}

impl RecordType {
    /// All types known to the engine
    pub const ALL: [RecordType; 8] = [
        RecordType::A,
        RecordType::Aaaa,
        RecordType::Cname,
        RecordType::Mx,
        RecordType::Txt,
        RecordType::Srv,
        RecordType::Caa,
        RecordType::Ns,
    ];

    /// Whether Cloudflare-style proxying is meaningful for this type
    pub fn proxyable(&self) -> bool {
        matches!(self, RecordType::A | RecordType::Aaaa | RecordType::Cname)
    }
}

impl FromStr for RecordType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            "CNAME" => Ok(RecordType::Cname),
            "MX" => Ok(RecordType::Mx),
            "TXT" => Ok(RecordType::Txt),
            "SRV" => Ok(RecordType::Srv),
            "CAA" => Ok(RecordType::Caa),
            "NS" => Ok(RecordType::Ns),
            other => Err(ValidationError::UnknownRecordType(other.to_string())),
        }
    }
}

/// Where a desired record originated
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, sqlx::Type,
)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum RecordSource {
    /// Derived from a Traefik router rule
    #[display("traefik")]
    Traefik,
    /// Derived from labels directly on a container
    #[display("container-label")]
    ContainerLabel,
    /// User-authored managed hostname
    #[display("manual")]
    Manual,
    /// Produced by an override patch
    #[display("override")]
    Override,
}

impl FromStr for RecordSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "traefik" => Ok(RecordSource::Traefik),
            "container-label" | "container_label" => Ok(RecordSource::ContainerLabel),
            "manual" => Ok(RecordSource::Manual),
            "override" => Ok(RecordSource::Override),
            other => Err(format!("Unknown record source: {}", other)),
        }
    }
}

/// How a tunnel ingress rule came to exist
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum IngressSource {
    /// Added by a user through the management API; never auto-deleted
    #[display("api")]
    Api,
    /// Derived from container observation; subject to orphan cleanup
    #[display("auto")]
    Auto,
}

/// Validation failures surfaced by canonicalization and per-type checks.
///
/// These are never retried; the offending record is skipped and an error
/// event is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown record type '{0}'")]
    UnknownRecordType(String),
    #[error("'{0}' is not a valid IPv4 address")]
    InvalidIpv4(String),
    #[error("'{0}' is not a valid IPv6 address")]
    InvalidIpv6(String),
    #[error("'{0}' is not a valid hostname")]
    InvalidHostname(String),
    #[error("TXT content is {0} bytes, maximum is 255")]
    TxtTooLong(usize),
    #[error("SRV content '{0}' must be 'priority weight port target'")]
    InvalidSrv(String),
    #[error("CAA content '{0}' must be 'flags tag value'")]
    InvalidCaa(String),
    #[error("record type {record_type} is not supported by provider '{provider}'")]
    UnsupportedType {
        record_type: RecordType,
        provider: String,
    },
    #[error("proxied is only valid on A/AAAA/CNAME records, not {0}")]
    ProxiedNotAllowed(RecordType),
    #[error("record for '{hostname}' has no content and none could be derived")]
    MissingContent { hostname: String },
    #[error("record for '{hostname}' requires a discovered public IP and none is known")]
    ApexWithoutPublicIp { hostname: String },
    #[error("hostname '{hostname}' is claimed by more than one container")]
    DuplicateHostname { hostname: String },
    #[error("{field}: '{value}' is not a valid {expected}")]
    BadLabelValue {
        field: String,
        value: String,
        expected: &'static str,
    },
}

/// The writable attributes of a DNS record, shared by intent and adapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordData {
    pub hostname: String,
    pub record_type: RecordType,
    pub content: String,
    pub ttl: u32,
    pub priority: Option<u16>,
    pub weight: Option<u16>,
    pub port: Option<u16>,
    pub flags: Option<u8>,
    pub tag: Option<String>,
    /// Cloudflare edge proxying; None means "not applicable"
    pub proxied: Option<bool>,
}

impl RecordData {
    /// Compare the attributes that matter for drift detection.
    ///
    /// Hostname, type, content, and TTL are authoritative. The optional
    /// extras compare as "don't care" when either side is absent: providers
    /// echo back only the fields their API models (Cloudflare folds SRV
    /// attributes into content, DigitalOcean splits them out), and a strict
    /// comparison would report drift forever.
    pub fn same_as(&self, other: &RecordData) -> bool {
        self.hostname == other.hostname
            && self.record_type == other.record_type
            && self.content == other.content
            && self.ttl == other.ttl
            && option_eq(self.priority, other.priority)
            && option_eq(self.weight, other.weight)
            && option_eq(self.port, other.port)
            && option_eq(self.flags, other.flags)
            && option_eq(self.tag.as_deref(), other.tag.as_deref())
            && option_eq(self.proxied, other.proxied)
    }
}

fn option_eq<T: PartialEq>(a: Option<T>, b: Option<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Identity of a record within the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub provider_id: i64,
    pub hostname: String,
    pub record_type: RecordType,
}

/// A record the engine wants to exist, derived on every intent rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRecord {
    pub provider_id: i64,
    pub source: RecordSource,
    pub data: RecordData,
}

impl DesiredRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            provider_id: self.provider_id,
            hostname: self.data.hostname.clone(),
            record_type: self.data.record_type,
        }
    }
}

/// Declared capabilities of a DNS provider adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFeatures {
    /// Supports edge proxying (Cloudflare)
    pub proxied: bool,
    pub ttl_min: u32,
    pub ttl_max: u32,
    pub supported_types: &'static [RecordType],
    /// Supports batched writes
    pub batch: bool,
    /// Splits TXT content longer than 255 bytes into strings
    pub txt_chunking: bool,
}

impl ProviderFeatures {
    pub fn supports(&self, record_type: RecordType) -> bool {
        self.supported_types.contains(&record_type)
    }

    /// Clamp a TTL into the provider's accepted range
    pub fn clamp_ttl(&self, ttl: u32) -> u32 {
        ttl.clamp(self.ttl_min, self.ttl_max)
    }
}

/// Lowercase a hostname and strip the trailing dot.
///
/// Idempotent: normalizing an already-normalized hostname is a no-op.
pub fn normalize_hostname(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_lowercase()
}

/// Whether `hostname` is the zone apex (no left-hand label)
pub fn is_apex(hostname: &str, zone: &str) -> bool {
    normalize_hostname(hostname) == normalize_hostname(zone)
}

/// RFC 1035-style hostname check.
///
/// Underscore labels are allowed (SRV and TXT conventions); a single leading
/// `*.` wildcard label is accepted because preserved-hostname patterns and
/// wildcard certificates use it.
pub fn validate_hostname(hostname: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidHostname(hostname.to_string());

    if hostname.is_empty() || hostname.len() > 253 {
        return Err(invalid());
    }

    let rest = hostname.strip_prefix("*.").unwrap_or(hostname);
    if rest.is_empty() || rest.contains('*') {
        return Err(invalid());
    }

    for label in rest.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid());
        }
    }

    Ok(())
}

/// True if `value` parses as an IPv4 literal
pub fn is_ipv4_literal(value: &str) -> bool {
    value.parse::<Ipv4Addr>().is_ok()
}

/// True if `value` parses as an IPv6 literal.
///
/// Values without a colon are rejected outright, so junk like the literal
/// string "true" never sneaks through `Ipv6Addr` parsing paths.
pub fn is_ipv6_literal(value: &str) -> bool {
    value.contains(':') && value.parse::<Ipv6Addr>().is_ok()
}

/// Canonicalize record content per type.
///
/// IPv4 becomes dotted-quad, IPv6 becomes the lowercased compressed form,
/// hostname-valued content is lowercased with the trailing dot stripped.
pub fn canonicalize_content(
    record_type: RecordType,
    content: &str,
) -> Result<String, ValidationError> {
    let content = content.trim();

    match record_type {
        RecordType::A => {
            let ip: Ipv4Addr = content
                .parse()
                .map_err(|_| ValidationError::InvalidIpv4(content.to_string()))?;
            Ok(ip.to_string())
        }
        RecordType::Aaaa => {
            if !content.contains(':') {
                return Err(ValidationError::InvalidIpv6(content.to_string()));
            }
            let ip: Ipv6Addr = content
                .parse()
                .map_err(|_| ValidationError::InvalidIpv6(content.to_string()))?;
            Ok(ip.to_string())
        }
        RecordType::Cname | RecordType::Ns | RecordType::Mx => {
            let target = normalize_hostname(content);
            validate_hostname(&target)?;
            Ok(target)
        }
        RecordType::Txt => Ok(content.to_string()),
        RecordType::Srv => {
            let parts: Vec<&str> = content.split_whitespace().collect();
            if parts.len() != 4 {
                return Err(ValidationError::InvalidSrv(content.to_string()));
            }
            let priority: u16 = parts[0]
                .parse()
                .map_err(|_| ValidationError::InvalidSrv(content.to_string()))?;
            let weight: u16 = parts[1]
                .parse()
                .map_err(|_| ValidationError::InvalidSrv(content.to_string()))?;
            let port: u16 = parts[2]
                .parse()
                .map_err(|_| ValidationError::InvalidSrv(content.to_string()))?;
            let target = normalize_hostname(parts[3]);
            validate_hostname(&target)?;
            Ok(format!("{} {} {} {}", priority, weight, port, target))
        }
        RecordType::Caa => {
            let parts: Vec<&str> = content.splitn(3, ' ').collect();
            if parts.len() != 3 {
                return Err(ValidationError::InvalidCaa(content.to_string()));
            }
            let flags: u8 = parts[0]
                .parse()
                .map_err(|_| ValidationError::InvalidCaa(content.to_string()))?;
            let tag = parts[1];
            if !matches!(tag, "issue" | "issuewild" | "iodef") {
                return Err(ValidationError::InvalidCaa(content.to_string()));
            }
            Ok(format!("{} {} {}", flags, tag, parts[2]))
        }
    }
}

/// Full per-record validation against a provider's declared features
pub fn validate_record(
    data: &RecordData,
    features: &ProviderFeatures,
    provider_name: &str,
) -> Result<(), ValidationError> {
    if !features.supports(data.record_type) {
        return Err(ValidationError::UnsupportedType {
            record_type: data.record_type,
            provider: provider_name.to_string(),
        });
    }

    validate_hostname(&data.hostname)?;
    canonicalize_content(data.record_type, &data.content)?;

    if data.record_type == RecordType::Txt
        && data.content.len() > 255
        && !features.txt_chunking
    {
        return Err(ValidationError::TxtTooLong(data.content.len()));
    }

    if data.proxied == Some(true) && !data.record_type.proxyable() {
        return Err(ValidationError::ProxiedNotAllowed(data.record_type));
    }

    Ok(())
}

/// Match a hostname against a preserved-hostname pattern.
///
/// Patterns are exact hostnames or left-wildcards of the form
/// `*.foo.example.com`, which match any hostname strictly under the suffix.
pub fn hostname_matches_pattern(pattern: &str, hostname: &str) -> bool {
    let pattern = normalize_hostname(pattern);
    let hostname = normalize_hostname(hostname);

    if let Some(suffix) = pattern.strip_prefix("*.") {
        hostname.ends_with(&format!(".{}", suffix))
    } else {
        pattern == hostname
    }
}
