//! Intent building.
//!
//! Deterministically maps raw container observations, user overrides, and
//! manual records to the set of desired records, applying label precedence,
//! provider defaults, apex handling, and per-type validation. The output is
//! keyed by `(provider, hostname, type)`; the reconciler consumes it as-is.

use std::collections::{HashMap, HashSet};

use crate::config::{RoutingMode, Settings};
use crate::db::models::{ManagedHostname, OverrideRow};
use crate::ip::PublicIp;
use crate::labels::DnsLabels;
use crate::model::{
    DesiredRecord, ProviderFeatures, RecordData, RecordKey, RecordSource, RecordType,
    ValidationError, canonicalize_content, is_apex, is_ipv4_literal, is_ipv6_literal,
    validate_record,
};
use crate::provider::{ProviderHandle, ProviderRegistry};
use crate::source::ObservationSet;

/// Provider facts the builder needs; decoupled from live adapters so intent
/// derivation is testable without any I/O.
#[derive(Debug, Clone)]
pub struct ProviderView {
    pub id: i64,
    pub name: String,
    pub provider_type: String,
    pub zone: String,
    /// Per-provider TTL override; None falls back to `dns_default_ttl`
    pub default_ttl: Option<u32>,
    pub priority: i64,
    pub features: ProviderFeatures,
}

impl ProviderView {
    pub fn from_handle(handle: &ProviderHandle) -> Self {
        Self {
            id: handle.row.id,
            name: handle.row.name.clone(),
            provider_type: handle.row.provider_type.clone(),
            zone: handle.row.zone.clone(),
            default_ttl: handle.row.default_ttl,
            priority: handle.row.priority,
            features: handle.adapter.features(),
        }
    }

    pub fn from_registry(registry: &ProviderRegistry) -> Vec<Self> {
        registry
            .in_routing_order()
            .into_iter()
            .map(Self::from_handle)
            .collect()
    }
}

/// A record that failed derivation, with the reason
#[derive(Debug, Clone)]
pub struct RejectedRecord {
    pub hostname: String,
    pub error: ValidationError,
}

/// The complete desired state for one rebuild
#[derive(Debug, Default)]
pub struct IntentSet {
    pub records: HashMap<RecordKey, DesiredRecord>,
    pub rejected: Vec<RejectedRecord>,
}

impl IntentSet {
    pub fn for_provider(&self, provider_id: i64) -> Vec<DesiredRecord> {
        let mut records: Vec<DesiredRecord> = self
            .records
            .values()
            .filter(|record| record.provider_id == provider_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (&a.data.hostname, a.data.record_type.to_string())
                .cmp(&(&b.data.hostname, b.data.record_type.to_string()))
        });
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Builds intent sets from observations
pub struct IntentBuilder {
    /// In routing order (priority, then id)
    providers: Vec<ProviderView>,
    /// Indices into `providers` in plain id order; round-robin distributes
    /// across providers by id, not by priority
    id_order: Vec<usize>,
}

impl IntentBuilder {
    pub fn new(mut providers: Vec<ProviderView>) -> Self {
        providers.sort_by_key(|p| (p.priority, p.id));

        let mut id_order: Vec<usize> = (0..providers.len()).collect();
        id_order.sort_by_key(|&i| providers[i].id);

        Self {
            providers,
            id_order,
        }
    }

    /// Derive the full intent set.
    ///
    /// `degraded` lists providers currently failing; in auto-with-fallback
    /// routing they are passed over in favor of the next healthy provider.
    pub fn build(
        &self,
        observations: &ObservationSet,
        manual: &[ManagedHostname],
        overrides: &[OverrideRow],
        settings: &Settings,
        public_ip: PublicIp,
        degraded: &HashSet<i64>,
    ) -> IntentSet {
        let mut intent = IntentSet::default();

        if self.providers.is_empty() {
            return intent;
        }

        // Cross-container duplicate detection: a hostname claimed by two
        // different containers is skipped entirely
        let claims = self.collect_claims(observations, &mut intent);

        let mut hostnames: Vec<&String> = claims.keys().collect();
        hostnames.sort();

        for (index, hostname) in hostnames.into_iter().enumerate() {
            let labels = &claims[hostname].1;
            let source = claims[hostname].2;

            let provider = self.route(hostname, labels, settings, degraded, index);

            match self.derive_record(hostname, labels, provider, settings, public_ip) {
                Ok(mut record) => {
                    record.source = source;
                    self.finish_record(record, provider, overrides, &mut intent);
                }
                Err(error) => {
                    tracing::warn!(
                        hostname = %hostname,
                        error = %error,
                        "Rejecting desired record"
                    );
                    intent.rejected.push(RejectedRecord {
                        hostname: hostname.clone(),
                        error,
                    });
                }
            }
        }

        self.merge_manual(manual, overrides, settings, &mut intent);

        intent
    }

    /// hostname → (container_id, labels, source), with duplicates across
    /// containers rejected
    fn collect_claims(
        &self,
        observations: &ObservationSet,
        intent: &mut IntentSet,
    ) -> HashMap<String, (String, DnsLabels, RecordSource)> {
        let mut claims: HashMap<String, (String, DnsLabels, RecordSource)> = HashMap::new();
        let mut conflicted: HashSet<String> = HashSet::new();

        for observation in &observations.observations {
            let source = observation.source;

            for hostname in &observation.hostnames {
                match claims.get(hostname) {
                    // Same container listing a hostname twice coalesces
                    Some((owner, _, _)) if *owner == observation.container_id => {}
                    Some(_) => {
                        conflicted.insert(hostname.clone());
                    }
                    None => {
                        claims.insert(
                            hostname.clone(),
                            (
                                observation.container_id.clone(),
                                observation.labels.clone(),
                                source,
                            ),
                        );
                    }
                }
            }
        }

        for hostname in conflicted {
            claims.remove(&hostname);
            tracing::error!(hostname = %hostname, "Hostname claimed by multiple containers");
            intent.rejected.push(RejectedRecord {
                hostname: hostname.clone(),
                error: ValidationError::DuplicateHostname { hostname },
            });
        }

        claims
    }

    /// Pick the owning provider for a hostname.
    ///
    /// Precedence: provider-scoped labels, then an explicit provider label,
    /// then the configured routing mode.
    fn route(
        &self,
        hostname: &str,
        labels: &DnsLabels,
        settings: &Settings,
        degraded: &HashSet<i64>,
        index: usize,
    ) -> &ProviderView {
        // Any dns.<provider_type>.* label pins the hostname to that provider
        for provider in &self.providers {
            let scoped_attrs = ["type", "content", "ttl", "proxied", "priority"];
            if scoped_attrs
                .iter()
                .any(|attr| labels.get(&format!("{}.{}", provider.provider_type, attr)).is_some())
            {
                return provider;
            }
        }

        // Explicit provider selection by name or id
        if let Some(selector) = labels.get("providerId").or_else(|| labels.get("provider")) {
            if let Some(provider) = self.providers.iter().find(|p| {
                p.name == selector || p.id.to_string() == selector
            }) {
                return provider;
            }
            tracing::warn!(
                hostname = %hostname,
                selector = %selector,
                "Provider label matches no configured provider, using routing mode"
            );
        }

        match settings.dns_routing_mode {
            RoutingMode::PrimaryOnly => &self.providers[0],
            RoutingMode::RoundRobin => {
                &self.providers[self.id_order[index % self.id_order.len()]]
            }
            RoutingMode::AutoWithFallback => self
                .providers
                .iter()
                .find(|p| !degraded.contains(&p.id))
                .unwrap_or(&self.providers[0]),
        }
    }

    /// Steps 2–5 of the derivation: type, content, TTL and extras, proxied
    fn derive_record(
        &self,
        hostname: &str,
        labels: &DnsLabels,
        provider: &ProviderView,
        settings: &Settings,
        public_ip: PublicIp,
    ) -> Result<DesiredRecord, ValidationError> {
        let ptype = provider.provider_type.as_str();
        let apex = is_apex(hostname, &provider.zone);

        // Record type: label > apex → A > configured default
        let mut record_type = match labels.scoped(ptype, "type") {
            Some(raw) => raw.parse::<RecordType>()?,
            None if apex => RecordType::A,
            None => settings
                .dns_default_type
                .parse::<RecordType>()
                .unwrap_or(RecordType::Cname),
        };

        // Content: label > apex → discovered public IP > zone apex for CNAME
        let mut content = match labels.scoped(ptype, "content") {
            Some(raw) => raw.to_string(),
            None => match record_type {
                RecordType::A => public_ip
                    .v4
                    .map(|ip| ip.to_string())
                    .ok_or_else(|| ValidationError::ApexWithoutPublicIp {
                        hostname: hostname.to_string(),
                    })?,
                RecordType::Aaaa => public_ip
                    .v6
                    .map(|ip| ip.to_string())
                    .ok_or_else(|| ValidationError::ApexWithoutPublicIp {
                        hostname: hostname.to_string(),
                    })?,
                RecordType::Cname => provider.zone.clone(),
                _ => {
                    return Err(ValidationError::MissingContent {
                        hostname: hostname.to_string(),
                    });
                }
            },
        };

        // Literal IP content under CNAME auto-coerces to A/AAAA
        if record_type == RecordType::Cname {
            if is_ipv4_literal(&content) {
                record_type = RecordType::A;
            } else if is_ipv6_literal(&content) {
                record_type = RecordType::Aaaa;
            }
        }

        // Apex cannot be a CNAME; rewrite using the discovered public IP
        if apex && record_type == RecordType::Cname {
            if let Some(v4) = public_ip.v4 {
                record_type = RecordType::A;
                content = v4.to_string();
            } else if let Some(v6) = public_ip.v6 {
                record_type = RecordType::Aaaa;
                content = v6.to_string();
            } else {
                return Err(ValidationError::ApexWithoutPublicIp {
                    hostname: hostname.to_string(),
                });
            }
        }

        // TTL chain: label > per-provider override > global default
        let ttl = labels
            .scoped_parsed::<u32>(ptype, "ttl", "integer")?
            .or(provider.default_ttl)
            .unwrap_or(settings.dns_default_ttl);

        let proxied = if provider.features.proxied && record_type.proxyable() {
            Some(
                labels
                    .scoped_bool(ptype, "proxied")?
                    .unwrap_or(settings.dns_default_proxied),
            )
        } else {
            None
        };

        let data = RecordData {
            hostname: hostname.to_string(),
            record_type,
            content: canonicalize_content(record_type, &content)?,
            ttl: provider.features.clamp_ttl(ttl),
            priority: labels.scoped_parsed(ptype, "priority", "integer")?,
            weight: labels.scoped_parsed(ptype, "weight", "integer")?,
            port: labels.scoped_parsed(ptype, "port", "integer")?,
            flags: labels.scoped_parsed(ptype, "flags", "integer")?,
            tag: labels.scoped(ptype, "tag").map(str::to_string),
            proxied,
        };

        Ok(DesiredRecord {
            provider_id: provider.id,
            source: RecordSource::ContainerLabel,
            data,
        })
    }

    /// Steps 6–7: override patch, final validation, key insertion.
    ///
    /// Overrides match on hostname alone; every other field is a sparse
    /// patch, so an override can move a record to another provider or change
    /// its type. Validation and clamping run against the provider that will
    /// actually receive the record.
    fn finish_record(
        &self,
        mut record: DesiredRecord,
        provider: &ProviderView,
        overrides: &[OverrideRow],
        intent: &mut IntentSet,
    ) {
        let mut provider = provider;

        for patch in overrides {
            if !patch.matches(&record.data.hostname) {
                continue;
            }

            if let Some(provider_id) = patch.provider_id {
                match self.providers.iter().find(|p| p.id == provider_id) {
                    Some(target) => {
                        provider = target;
                        record.provider_id = provider_id;
                    }
                    None => {
                        tracing::warn!(
                            hostname = %record.data.hostname,
                            provider_id,
                            "Override names an unknown provider, keeping the routed one"
                        );
                    }
                }
            }
            if let Some(record_type) = patch.record_type {
                record.data.record_type = record_type;
            }
            if let Some(content) = &patch.content {
                record.data.content = content.clone();
            }
            if let Some(ttl) = patch.ttl {
                record.data.ttl = ttl;
            }
            if let Some(proxied) = patch.proxied {
                record.data.proxied = Some(proxied);
            }
            record.source = RecordSource::Override;
        }

        // Re-clamp against the effective provider; a patch may have moved the
        // record or changed its TTL
        record.data.ttl = provider.features.clamp_ttl(record.data.ttl);
        if !provider.features.proxied {
            record.data.proxied = None;
        }

        // Re-canonicalize: an override may have replaced the content or type
        match canonicalize_content(record.data.record_type, &record.data.content) {
            Ok(content) => record.data.content = content,
            Err(error) => {
                intent.rejected.push(RejectedRecord {
                    hostname: record.data.hostname.clone(),
                    error,
                });
                return;
            }
        }

        if let Err(error) = validate_record(&record.data, &provider.features, &provider.name) {
            tracing::warn!(
                hostname = %record.data.hostname,
                error = %error,
                "Rejecting desired record"
            );
            intent.rejected.push(RejectedRecord {
                hostname: record.data.hostname.clone(),
                error,
            });
            return;
        }

        // First claim wins within a rebuild
        intent.records.entry(record.key()).or_insert(record);
    }

    /// Fold in user-authored manual records; observed sources win on key
    /// collisions.
    fn merge_manual(
        &self,
        manual: &[ManagedHostname],
        overrides: &[OverrideRow],
        settings: &Settings,
        intent: &mut IntentSet,
    ) {
        for row in manual {
            let provider = row
                .provider_id
                .and_then(|id| self.providers.iter().find(|p| p.id == id))
                .unwrap_or(&self.providers[0]);

            let proxied = if provider.features.proxied && row.record_type.proxyable() {
                Some(row.proxied.unwrap_or(settings.dns_default_proxied))
            } else {
                None
            };

            let record = DesiredRecord {
                provider_id: provider.id,
                source: RecordSource::Manual,
                data: RecordData {
                    hostname: row.hostname.clone(),
                    record_type: row.record_type,
                    content: row.content.clone(),
                    ttl: provider.features.clamp_ttl(
                        row.ttl
                            .or(provider.default_ttl)
                            .unwrap_or(settings.dns_default_ttl),
                    ),
                    priority: row.priority,
                    weight: row.weight,
                    port: row.port,
                    flags: row.flags,
                    tag: row.tag.clone(),
                    proxied,
                },
            };

            if intent.records.contains_key(&record.key()) {
                tracing::debug!(
                    hostname = %record.data.hostname,
                    "Manual record shadowed by observed record"
                );
                continue;
            }

            self.finish_record(record, provider, overrides, intent);
        }
    }
}
