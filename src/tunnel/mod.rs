//! Tunnel ingress reconciliation.
//!
//! When tunnel mode is enabled, observed hostnames become ingress rules on a
//! Cloudflare Zero Trust tunnel. Auto-derived rules share the orphan
//! machinery of DNS records; rules added through the management API are never
//! auto-deleted. The full remote configuration is re-deployed after changes,
//! always ending with the `http_status:404` catch-all.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::{Settings, TunnelMode};
use crate::db::queries;
use crate::events::{EventBus, EventKind};
use crate::model::IngressSource;
use crate::provider::{IngressRule, OriginOptions, ProviderHandle, TunnelOps};
use crate::source::ObservationSet;

/// An ingress rule the engine wants on the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredIngress {
    pub hostname: String,
    pub service: String,
    pub path: Option<String>,
    pub no_tls_verify: bool,
    pub http_host_header: Option<String>,
}

/// Derive desired ingress rules from the current observations.
///
/// `all` mode covers every observed hostname; `labeled` mode only containers
/// carrying `tunnel=true`. The origin service comes from the
/// `tunnel.service` label, falling back to the configured default; hostnames
/// with neither are skipped.
pub fn desired_ingress(observations: &ObservationSet, settings: &Settings) -> Vec<DesiredIngress> {
    if settings.tunnel_mode == TunnelMode::Off {
        return Vec::new();
    }

    let mut rules: Vec<DesiredIngress> = Vec::new();

    for observation in &observations.observations {
        let labels = &observation.labels;

        if settings.tunnel_mode == TunnelMode::Labeled && labels.flag("tunnel") != Some(true) {
            continue;
        }

        let service = labels
            .get("tunnel.service")
            .map(str::to_string)
            .or_else(|| settings.tunnel_default_service_url.clone());

        let Some(service) = service else {
            tracing::warn!(
                container = %observation.container_name,
                "Tunnel enabled but no service URL configured, skipping"
            );
            continue;
        };

        for hostname in &observation.hostnames {
            if rules.iter().any(|rule| rule.hostname == *hostname) {
                continue;
            }

            rules.push(DesiredIngress {
                hostname: hostname.clone(),
                service: service.clone(),
                path: labels.get("tunnel.path").map(str::to_string),
                no_tls_verify: labels.flag("tunnel.notlsverify") == Some(true),
                http_host_header: labels.get("tunnel.httphostheader").map(str::to_string),
            });
        }
    }

    rules.sort_by(|a, b| a.hostname.cmp(&b.hostname));
    rules
}

/// Per-cycle outcome of an ingress reconciliation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngressSyncStats {
    pub added: usize,
    pub updated: usize,
    pub orphaned: usize,
    pub restored: usize,
}

impl IngressSyncStats {
    pub fn mutations(&self) -> usize {
        self.added + self.updated + self.orphaned + self.restored
    }
}

/// Reconciles tracked ingress state against the tunnel configuration
pub struct TunnelReconciler {
    pool: SqlitePool,
    bus: EventBus,
}

impl TunnelReconciler {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Bring the tunnel's ingress configuration in line with `desired`.
    ///
    /// Tracked rows are the source of truth for what the engine owns; the
    /// remote config is replaced wholesale after row updates so `api`-sourced
    /// rules survive untouched.
    pub async fn reconcile(
        &self,
        handle: &ProviderHandle,
        tunnel_id: &str,
        desired: &[DesiredIngress],
    ) -> Result<IngressSyncStats> {
        let Some(ops) = handle.adapter.tunnel_ops() else {
            anyhow::bail!(
                "provider '{}' does not support tunnel operations",
                handle.row.name
            );
        };

        let provider_id = handle.row.id;
        let tracked = queries::list_ingress(&self.pool, tunnel_id).await?;
        let mut stats = IngressSyncStats::default();

        for rule in desired {
            let existing = tracked.iter().find(|row| row.hostname == rule.hostname);

            match existing {
                None => {
                    let mut tx = self.pool.begin().await?;
                    let now = Utc::now();
                    let id = queries::insert_ingress(
                        &mut tx,
                        provider_id,
                        tunnel_id,
                        &rule.hostname,
                        &rule.service,
                        rule.path.as_deref(),
                        rule.no_tls_verify,
                        rule.http_host_header.as_deref(),
                        IngressSource::Auto,
                        now,
                    )
                    .await?;
                    queries::append_audit(
                        &mut tx,
                        "system",
                        "tunnel.ingress.create",
                        "tunnel_ingress",
                        &id.to_string(),
                        None,
                        Some(&serde_json::json!({
                            "hostname": rule.hostname,
                            "service": rule.service,
                        })),
                        now,
                    )
                    .await?;
                    tx.commit().await?;

                    stats.added += 1;
                    self.bus.publish(
                        EventKind::TunnelCreated,
                        serde_json::json!({
                            "tunnel_id": tunnel_id,
                            "hostname": rule.hostname,
                            "service": rule.service,
                        }),
                    );
                }
                Some(row) => {
                    let drifted = row.service != rule.service
                        || row.path != rule.path
                        || row.no_tls_verify != rule.no_tls_verify
                        || row.http_host_header != rule.http_host_header;
                    let was_orphaned = row.is_orphaned();

                    if drifted || was_orphaned {
                        let mut tx = self.pool.begin().await?;
                        let now = Utc::now();
                        queries::update_ingress(
                            &mut tx,
                            row.id,
                            &rule.service,
                            rule.path.as_deref(),
                            rule.no_tls_verify,
                            rule.http_host_header.as_deref(),
                            now,
                        )
                        .await?;
                        queries::append_audit(
                            &mut tx,
                            "system",
                            "tunnel.ingress.update",
                            "tunnel_ingress",
                            &row.id.to_string(),
                            Some(&serde_json::json!({ "service": row.service })),
                            Some(&serde_json::json!({ "service": rule.service })),
                            now,
                        )
                        .await?;
                        tx.commit().await?;

                        if was_orphaned {
                            stats.restored += 1;
                        } else {
                            stats.updated += 1;
                        }
                    }
                }
            }
        }

        // Auto rules no longer observed become orphans; api rules are kept
        for row in &tracked {
            if row.source != IngressSource::Auto || row.is_orphaned() {
                continue;
            }
            if desired.iter().any(|rule| rule.hostname == row.hostname) {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            let now = Utc::now();
            queries::set_ingress_orphaned(&mut tx, row.id, now).await?;
            queries::append_audit(
                &mut tx,
                "system",
                "tunnel.ingress.orphan",
                "tunnel_ingress",
                &row.id.to_string(),
                None,
                None,
                now,
            )
            .await?;
            tx.commit().await?;

            stats.orphaned += 1;
        }

        if stats.mutations() > 0 {
            self.deploy(ops, tunnel_id).await?;
            self.bus.publish(
                EventKind::TunnelDeployed,
                serde_json::json!({
                    "tunnel_id": tunnel_id,
                    "added": stats.added,
                    "updated": stats.updated,
                    "orphaned": stats.orphaned,
                    "restored": stats.restored,
                }),
            );
        }

        Ok(stats)
    }

    /// Push the full ingress configuration from tracked rows.
    ///
    /// Orphaned rules remain deployed until the orphan sweep deletes them;
    /// a rule disappearing and reappearing within the grace period never
    /// loses traffic.
    async fn deploy(&self, ops: &dyn TunnelOps, tunnel_id: &str) -> Result<()> {
        let rows = queries::list_ingress(&self.pool, tunnel_id).await?;

        let rules: Vec<IngressRule> = rows
            .iter()
            .map(|row| IngressRule {
                hostname: Some(row.hostname.clone()),
                service: row.service.clone(),
                path: row.path.clone(),
                origin: OriginOptions {
                    no_tls_verify: row.no_tls_verify,
                    http_host_header: row.http_host_header.clone(),
                },
            })
            .collect();

        ops.deploy_config(tunnel_id, &rules)
            .await
            .context("Failed to deploy tunnel configuration")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::DnsLabels;
    use crate::model::RecordSource;
    use crate::source::Observation;

    fn observation(hostname: &str, labels: &[(&str, &str)]) -> Observation {
        Observation {
            container_id: hostname.to_string(),
            container_name: hostname.to_string(),
            hostnames: vec![hostname.to_string()],
            labels: DnsLabels::from_pairs(labels),
            source: RecordSource::ContainerLabel,
        }
    }

    fn settings(mode: TunnelMode) -> Settings {
        Settings {
            tunnel_mode: mode,
            tunnel_default_service_url: Some("http://web:80".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn test_off_mode_produces_nothing() {
        let set = ObservationSet {
            observations: vec![observation("a.example.com", &[])],
        };
        assert!(desired_ingress(&set, &settings(TunnelMode::Off)).is_empty());
    }

    #[test]
    fn test_all_mode_covers_every_hostname() {
        let set = ObservationSet {
            observations: vec![
                observation("a.example.com", &[]),
                observation("b.example.com", &[("tunnel.service", "http://api:8080")]),
            ],
        };

        let rules = desired_ingress(&set, &settings(TunnelMode::All));
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].service, "http://web:80");
        assert_eq!(rules[1].service, "http://api:8080");
    }

    #[test]
    fn test_labeled_mode_requires_label() {
        let set = ObservationSet {
            observations: vec![
                observation("a.example.com", &[]),
                observation(
                    "b.example.com",
                    &[("tunnel", "true"), ("tunnel.notlsverify", "true")],
                ),
            ],
        };

        let rules = desired_ingress(&set, &settings(TunnelMode::Labeled));
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].hostname, "b.example.com");
        assert!(rules[0].no_tls_verify);
    }

    #[test]
    fn test_no_service_url_skips() {
        let set = ObservationSet {
            observations: vec![observation("a.example.com", &[])],
        };
        let mut settings = settings(TunnelMode::All);
        settings.tunnel_default_service_url = None;

        assert!(desired_ingress(&set, &settings).is_empty());
    }
}
