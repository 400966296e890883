//! Deferred deletion of orphaned records and ingress rules.
//!
//! Records whose hostnames disappeared from intent sit in the orphaned state
//! until the grace period elapses; the sweep then deletes them at the
//! provider and drops the tracked row. Preserved hostnames are never deleted,
//! and with `cleanup_orphaned=false` the sweep only observes.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::Settings;
use crate::db::models::PreservedHostname;
use crate::db::queries;
use crate::events::{EventBus, EventKind};
use crate::provider::{ProviderError, ProviderRegistry};

/// Outcome of one sweep pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub records_deleted: usize,
    pub ingress_deleted: usize,
    pub preserved: usize,
    pub waiting: usize,
    pub failed: usize,
}

pub struct OrphanSweeper {
    pool: SqlitePool,
    bus: EventBus,
}

impl OrphanSweeper {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// One pass over everything currently orphaned
    pub async fn sweep(
        &self,
        registry: &ProviderRegistry,
        settings: &Settings,
    ) -> Result<SweepStats> {
        let preserved = queries::list_preserved_hostnames(&self.pool).await?;
        let mut stats = SweepStats::default();

        self.sweep_records(registry, settings, &preserved, &mut stats)
            .await?;
        self.sweep_ingress(registry, settings, &preserved, &mut stats)
            .await?;

        if stats.records_deleted > 0 || stats.ingress_deleted > 0 || stats.failed > 0 {
            tracing::info!(
                records_deleted = stats.records_deleted,
                ingress_deleted = stats.ingress_deleted,
                preserved = stats.preserved,
                waiting = stats.waiting,
                failed = stats.failed,
                "Orphan sweep completed"
            );
        }

        Ok(stats)
    }

    async fn sweep_records(
        &self,
        registry: &ProviderRegistry,
        settings: &Settings,
        preserved: &[PreservedHostname],
        stats: &mut SweepStats,
    ) -> Result<()> {
        let orphans = queries::list_orphaned_records(&self.pool).await?;
        let now = Utc::now();
        let grace = settings.grace_period();

        for record in orphans {
            if preserved.iter().any(|rule| rule.matches(&record.hostname)) {
                stats.preserved += 1;
                continue;
            }

            if !settings.cleanup_orphaned {
                // Track-only mode: orphan state is kept, nothing is deleted
                stats.waiting += 1;
                continue;
            }

            let Some(orphaned_at) = record.orphaned_at else {
                continue;
            };
            if now - orphaned_at < grace {
                stats.waiting += 1;
                continue;
            }

            let Some(handle) = registry.get(record.provider_id) else {
                tracing::warn!(
                    hostname = %record.hostname,
                    provider_id = record.provider_id,
                    "Orphaned record belongs to an unavailable provider, skipping"
                );
                stats.failed += 1;
                continue;
            };

            // Provider delete first; the row only goes once the provider
            // confirmed (not-found counts as confirmed)
            if let Some(external_id) = &record.external_id {
                match handle.adapter.delete_record(external_id).await {
                    Ok(()) | Err(ProviderError::NotFound(_)) => {}
                    Err(e) => {
                        tracing::error!(
                            hostname = %record.hostname,
                            provider = %handle.row.name,
                            error = %e,
                            "Failed to delete orphaned record, will retry next sweep"
                        );
                        stats.failed += 1;
                        continue;
                    }
                }
            }

            let mut tx = self.pool.begin().await?;
            queries::delete_record(&mut tx, record.id).await?;
            queries::append_audit(
                &mut tx,
                "system",
                "dns.record.delete",
                "record",
                &record.id.to_string(),
                Some(&serde_json::json!({
                    "hostname": record.hostname,
                    "type": record.record_type,
                    "content": record.content,
                })),
                None,
                Utc::now(),
            )
            .await?;
            tx.commit().await?;

            tracing::info!(
                hostname = %record.hostname,
                provider = %handle.row.name,
                "Orphaned record deleted after grace period"
            );
            self.bus.publish_record(
                EventKind::RecordDeleted,
                record.provider_id,
                record.source,
                &record.data(),
            );
            stats.records_deleted += 1;
        }

        Ok(())
    }

    async fn sweep_ingress(
        &self,
        registry: &ProviderRegistry,
        settings: &Settings,
        preserved: &[PreservedHostname],
        stats: &mut SweepStats,
    ) -> Result<()> {
        // Only auto-sourced rules are ever listed here; api rules are exempt
        let orphans = queries::list_orphaned_ingress(&self.pool).await?;
        let now = Utc::now();
        let grace = settings.grace_period();

        for rule in orphans {
            if preserved.iter().any(|p| p.matches(&rule.hostname)) {
                stats.preserved += 1;
                continue;
            }

            if !settings.cleanup_orphaned {
                stats.waiting += 1;
                continue;
            }

            let Some(orphaned_at) = rule.orphaned_at else {
                continue;
            };
            if now - orphaned_at < grace {
                stats.waiting += 1;
                continue;
            }

            let ops = registry
                .get(rule.provider_id)
                .and_then(|handle| handle.adapter.tunnel_ops());
            let Some(ops) = ops else {
                tracing::warn!(
                    hostname = %rule.hostname,
                    provider_id = rule.provider_id,
                    "Orphaned ingress rule has no tunnel-capable provider, skipping"
                );
                stats.failed += 1;
                continue;
            };

            if let Err(e) = ops.remove_ingress(&rule.tunnel_id, &rule.hostname).await {
                tracing::error!(
                    hostname = %rule.hostname,
                    tunnel_id = %rule.tunnel_id,
                    error = %e,
                    "Failed to remove orphaned ingress rule, will retry next sweep"
                );
                stats.failed += 1;
                continue;
            }

            let mut tx = self.pool.begin().await?;
            queries::delete_ingress(&mut tx, rule.id).await?;
            queries::append_audit(
                &mut tx,
                "system",
                "tunnel.ingress.delete",
                "tunnel_ingress",
                &rule.id.to_string(),
                Some(&serde_json::json!({
                    "hostname": rule.hostname,
                    "service": rule.service,
                })),
                None,
                Utc::now(),
            )
            .await?;
            tx.commit().await?;

            tracing::info!(
                hostname = %rule.hostname,
                tunnel_id = %rule.tunnel_id,
                "Orphaned ingress rule removed after grace period"
            );
            self.bus.publish(
                EventKind::TunnelDeleted,
                serde_json::json!({
                    "tunnel_id": rule.tunnel_id,
                    "hostname": rule.hostname,
                }),
            );
            stats.ingress_deleted += 1;
        }

        Ok(())
    }
}
