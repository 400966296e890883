//! Record reconciliation.
//!
//! Each provider gets its own reconciler, serialized per provider. A cycle
//! lists provider state (through a freshness-window cache), classifies it
//! against the tracked store, computes a minimal action plan, and executes it
//! with per-item failure isolation. Tracked-store mutations and their audit
//! entries commit in one transaction.
//!
//! Action order within a cycle is deterministic (creates, updates, restores,
//! then orphan marking) so a rename never loses its availability window.
//! Deletes happen later, in the orphan sweep, once the grace period elapses.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::time::Instant;

use crate::db::models::TrackedRecord;
use crate::db::queries;
use crate::events::{EventBus, EventKind, SyncCounts};
use crate::model::{DesiredRecord, RecordData, RecordType};
use crate::provider::{ProviderError, ProviderHandle, ProviderRecord};

pub mod orphan;

/// Tuning knobs for provider calls within a cycle
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Timeout for a single provider request (default: 60 seconds)
    pub request_timeout: Duration,
    /// Retry attempts for retryable errors within one cycle
    pub max_retries: u32,
    /// Initial retry delay (doubles each retry, up to max_delay)
    pub initial_retry_delay: Duration,
    /// Maximum retry delay
    pub max_retry_delay: Duration,
    /// Freshness window for the provider record list
    pub cache_ttl: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(30),
        }
    }
}

struct RecordCache {
    records: Vec<ProviderRecord>,
    fetched_at: Instant,
}

/// The classified work for one cycle
#[derive(Debug, Default)]
pub struct ActionPlan {
    pub creates: Vec<DesiredRecord>,
    /// Tracked record plus the data the provider should converge to
    pub updates: Vec<(TrackedRecord, DesiredRecord)>,
    /// Orphaned tracked records whose key reappeared in intent
    pub restores: Vec<(TrackedRecord, DesiredRecord)>,
    pub orphans: Vec<TrackedRecord>,
}

impl ActionPlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.restores.is_empty()
            && self.orphans.is_empty()
    }
}

/// Classify desired records against the tracked store and the provider's
/// current records.
///
/// Unmanaged rows (and provider records with no tracked counterpart) are
/// never planned for mutation.
pub fn compute_plan(
    desired: &[DesiredRecord],
    tracked: &[TrackedRecord],
    provider_records: &[ProviderRecord],
) -> ActionPlan {
    let mut plan = ActionPlan::default();

    let mut active: HashMap<(String, RecordType), &TrackedRecord> = HashMap::new();
    let mut orphaned: HashMap<(String, RecordType), &TrackedRecord> = HashMap::new();
    for record in tracked {
        let key = (record.hostname.clone(), record.record_type);
        if record.is_orphaned() {
            orphaned.insert(key, record);
        } else {
            active.insert(key, record);
        }
    }

    let provider_by_key: HashMap<(String, RecordType), &ProviderRecord> = provider_records
        .iter()
        .map(|record| {
            (
                (record.data.hostname.clone(), record.data.record_type),
                record,
            )
        })
        .collect();

    let mut desired_keys: std::collections::HashSet<(String, RecordType)> =
        std::collections::HashSet::new();

    for want in desired {
        let key = (want.data.hostname.clone(), want.data.record_type);
        desired_keys.insert(key.clone());

        if let Some(row) = active.get(&key) {
            let at_provider = provider_by_key.get(&key);

            // Managed-missing: tracked but gone at the provider → recreate.
            // Managed-drifted: provider content no longer matches intent.
            let needs_write = match at_provider {
                None => true,
                Some(provider_record) => !want.data.same_as(&provider_record.data),
            };
            let tracking_stale = !want.data.same_as(&row.data());

            if needs_write || tracking_stale {
                plan.updates.push(((*row).clone(), want.clone()));
            }
        } else if let Some(row) = orphaned.get(&key) {
            plan.restores.push(((*row).clone(), want.clone()));
        } else {
            plan.creates.push(want.clone());
        }
    }

    for row in tracked {
        if row.is_orphaned() || !row.managed {
            continue;
        }
        let key = (row.hostname.clone(), row.record_type);
        if !desired_keys.contains(&key) {
            plan.orphans.push(row.clone());
        }
    }

    plan
}

/// Per-provider reconciliation worker state
pub struct Reconciler {
    handle: ProviderHandle,
    pool: SqlitePool,
    bus: EventBus,
    config: ReconcilerConfig,
    cache: Option<RecordCache>,
    degraded: bool,
}

impl Reconciler {
    pub fn new(
        handle: ProviderHandle,
        pool: SqlitePool,
        bus: EventBus,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            handle,
            pool,
            bus,
            config,
            cache: None,
            degraded: false,
        }
    }

    pub fn provider_id(&self) -> i64 {
        self.handle.row.id
    }

    /// Whether the provider is currently failing persistently
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Run one reconciliation cycle against this provider.
    ///
    /// Individual item failures are isolated; the cycle always finishes and
    /// reports counts. Listing failure is the exception: with no provider
    /// view nothing can be done safely, so the provider goes degraded.
    pub async fn reconcile(&mut self, desired: &[DesiredRecord]) -> Result<SyncCounts> {
        let provider_name = self.handle.row.name.clone();

        let provider_records = match self.list_records(false).await {
            Ok(records) => records,
            Err(e) => {
                self.mark_degraded(&format!("listing records failed: {}", e));
                anyhow::bail!("provider '{}' degraded: {}", provider_name, e);
            }
        };

        if self.degraded {
            tracing::info!(provider = %provider_name, "Provider recovered");
        }
        self.degraded = false;

        let tracked = queries::list_records(&self.pool, self.handle.row.id).await?;
        let plan = compute_plan(desired, &tracked, &provider_records);

        if plan.is_empty() {
            tracing::debug!(provider = %provider_name, "Nothing to reconcile");
        }

        let mut counts = SyncCounts::default();

        for record in &plan.creates {
            if self.degraded {
                counts.failed += 1;
                continue;
            }
            match self.execute_create(record, &provider_records).await {
                Ok(()) => counts.created += 1,
                Err(e) => {
                    counts.failed += 1;
                    self.handle_item_error("create", &record.data.hostname, e);
                }
            }
        }

        for (row, want) in &plan.updates {
            if self.degraded {
                counts.failed += 1;
                continue;
            }
            match self.execute_update(row, want, &provider_records).await {
                Ok(()) => counts.updated += 1,
                Err(e) => {
                    counts.failed += 1;
                    self.handle_item_error("update", &row.hostname, e);
                }
            }
        }

        for (row, want) in &plan.restores {
            if self.degraded {
                counts.failed += 1;
                continue;
            }
            match self.execute_restore(row, want, &provider_records).await {
                Ok(updated) => {
                    counts.restored += 1;
                    if updated {
                        counts.updated += 1;
                    }
                }
                Err(e) => {
                    counts.failed += 1;
                    self.handle_item_error("restore", &row.hostname, e);
                }
            }
        }

        // Orphan marking is tracked-store only; provider failures can't stop it
        for row in &plan.orphans {
            match self.execute_mark_orphaned(row).await {
                Ok(()) => counts.orphaned += 1,
                Err(e) => {
                    counts.failed += 1;
                    tracing::error!(
                        provider = %provider_name,
                        hostname = %row.hostname,
                        error = %e,
                        "Failed to mark record orphaned"
                    );
                }
            }
        }

        tracing::info!(
            provider = %provider_name,
            created = counts.created,
            updated = counts.updated,
            orphaned = counts.orphaned,
            restored = counts.restored,
            failed = counts.failed,
            "Reconciliation cycle completed"
        );
        self.bus
            .publish_sync_completed(self.handle.row.id, &counts);

        Ok(counts)
    }

    /// Fetch provider records through the freshness-window cache
    async fn list_records(&mut self, force: bool) -> Result<Vec<ProviderRecord>, ProviderError> {
        if !force {
            if let Some(cache) = &self.cache {
                if cache.fetched_at.elapsed() < self.config.cache_ttl {
                    return Ok(cache.records.clone());
                }
            }
        }

        let adapter = self.handle.adapter.clone();
        let records = self
            .call_provider("list", || {
                let adapter = adapter.clone();
                async move { adapter.list_records().await }
            })
            .await?;

        self.cache = Some(RecordCache {
            records: records.clone(),
            fetched_at: Instant::now(),
        });

        Ok(records)
    }

    async fn execute_create(
        &mut self,
        record: &DesiredRecord,
        provider_records: &[ProviderRecord],
    ) -> Result<(), ProviderError> {
        let adapter = self.handle.adapter.clone();
        let data = record.data.clone();

        let created = self
            .call_provider("create", || {
                let adapter = adapter.clone();
                let data = data.clone();
                async move { adapter.create_record(&data).await }
            })
            .await;

        let external_id = match created {
            Ok(id) => id,
            // Idempotent upsert: a collision means the record already exists;
            // adopt its id and update in place
            Err(ProviderError::Conflict(_)) => {
                let existing = self
                    .find_at_provider(&record.data, provider_records)
                    .await?;
                self.update_at_provider(&existing, &record.data).await?;
                existing
            }
            Err(e) => return Err(e),
        };

        self.invalidate_cache();

        let mut tx = self.pool.begin().await.map_err(internal)?;
        let now = Utc::now();
        let id = queries::insert_record(
            &mut tx,
            record.provider_id,
            &record.data,
            Some(&external_id),
            record.source,
            true,
            now,
        )
        .await
        .map_err(internal)?;
        queries::append_audit(
            &mut tx,
            "system",
            "dns.record.create",
            "record",
            &id.to_string(),
            None,
            Some(&record_json(&record.data)),
            now,
        )
        .await
        .map_err(internal)?;
        tx.commit().await.map_err(internal)?;

        self.bus.publish_record(
            EventKind::RecordCreated,
            record.provider_id,
            record.source,
            &record.data,
        );

        Ok(())
    }

    async fn execute_update(
        &mut self,
        row: &TrackedRecord,
        want: &DesiredRecord,
        provider_records: &[ProviderRecord],
    ) -> Result<(), ProviderError> {
        // The provider's identifier wins as identity; re-resolve it when the
        // tracked one is missing or stale
        let external_id = match &row.external_id {
            Some(id)
                if provider_records
                    .iter()
                    .any(|record| record.external_id == *id) =>
            {
                id.clone()
            }
            _ => match self.find_at_provider(&want.data, provider_records).await {
                Ok(id) => id,
                Err(ProviderError::NotFound(_)) => {
                    // Managed-missing: recreate at the provider
                    let adapter = self.handle.adapter.clone();
                    let data = want.data.clone();
                    self.call_provider("create", || {
                        let adapter = adapter.clone();
                        let data = data.clone();
                        async move { adapter.create_record(&data).await }
                    })
                    .await?
                }
                Err(e) => return Err(e),
            },
        };

        // Only touch the provider when its view actually drifted
        let provider_matches = provider_records.iter().any(|record| {
            record.external_id == external_id && want.data.same_as(&record.data)
        });
        if !provider_matches {
            match self.update_at_provider(&external_id, &want.data).await {
                Ok(()) => {}
                Err(ProviderError::NotFound(_)) => {
                    // Deleted out from under us between list and write
                    let adapter = self.handle.adapter.clone();
                    let data = want.data.clone();
                    let new_id = self
                        .call_provider("create", || {
                            let adapter = adapter.clone();
                            let data = data.clone();
                            async move { adapter.create_record(&data).await }
                        })
                        .await?;
                    return self.commit_update(row, want, &new_id).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.commit_update(row, want, &external_id).await
    }

    async fn commit_update(
        &mut self,
        row: &TrackedRecord,
        want: &DesiredRecord,
        external_id: &str,
    ) -> Result<(), ProviderError> {
        self.invalidate_cache();

        let mut tx = self.pool.begin().await.map_err(internal)?;
        let now = Utc::now();
        queries::update_record(&mut tx, row.id, &want.data, Some(external_id), now)
            .await
            .map_err(internal)?;
        queries::append_audit(
            &mut tx,
            "system",
            "dns.record.update",
            "record",
            &row.id.to_string(),
            Some(&record_json(&row.data())),
            Some(&record_json(&want.data)),
            now,
        )
        .await
        .map_err(internal)?;
        tx.commit().await.map_err(internal)?;

        self.bus.publish_record(
            EventKind::RecordUpdated,
            want.provider_id,
            want.source,
            &want.data,
        );

        Ok(())
    }

    /// Clear orphan state; returns whether a content update was also needed
    async fn execute_restore(
        &mut self,
        row: &TrackedRecord,
        want: &DesiredRecord,
        provider_records: &[ProviderRecord],
    ) -> Result<bool, ProviderError> {
        let needs_update = !want.data.same_as(&row.data())
            || !provider_records
                .iter()
                .any(|record| want.data.same_as(&record.data));

        let mut tx = self.pool.begin().await.map_err(internal)?;
        let now = Utc::now();
        queries::clear_record_orphaned(&mut tx, row.id, now)
            .await
            .map_err(internal)?;
        queries::append_audit(
            &mut tx,
            "system",
            "dns.record.restore",
            "record",
            &row.id.to_string(),
            None,
            Some(&record_json(&row.data())),
            now,
        )
        .await
        .map_err(internal)?;
        tx.commit().await.map_err(internal)?;

        tracing::info!(
            provider = %self.handle.row.name,
            hostname = %row.hostname,
            "Orphaned record restored"
        );

        if needs_update {
            let restored = TrackedRecord {
                orphaned_at: None,
                ..row.clone()
            };
            self.execute_update(&restored, want, provider_records).await?;
            return Ok(true);
        }

        let mut conn = self.pool.acquire().await.map_err(internal)?;
        queries::touch_record_synced(&mut conn, row.id, Utc::now())
            .await
            .map_err(internal)?;

        Ok(false)
    }

    async fn execute_mark_orphaned(&mut self, row: &TrackedRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        queries::set_record_orphaned(&mut tx, row.id, now).await?;
        queries::append_audit(
            &mut tx,
            "system",
            "dns.record.orphan",
            "record",
            &row.id.to_string(),
            Some(&record_json(&row.data())),
            None,
            now,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            provider = %self.handle.row.name,
            hostname = %row.hostname,
            "Record orphaned, deletion deferred to grace period"
        );
        self.bus.publish_record(
            EventKind::RecordOrphaned,
            row.provider_id,
            row.source,
            &row.data(),
        );

        Ok(())
    }

    /// Resolve a record's external id from the provider view, re-listing if
    /// the cache predates the collision.
    async fn find_at_provider(
        &mut self,
        data: &RecordData,
        provider_records: &[ProviderRecord],
    ) -> Result<String, ProviderError> {
        let matches = |records: &[ProviderRecord]| {
            records
                .iter()
                .find(|record| {
                    record.data.hostname == data.hostname
                        && record.data.record_type == data.record_type
                })
                .map(|record| record.external_id.clone())
        };

        if let Some(id) = matches(provider_records) {
            return Ok(id);
        }

        let fresh = self.list_records(true).await?;
        matches(&fresh).ok_or_else(|| {
            ProviderError::NotFound(format!(
                "{} {} not found at provider",
                data.hostname, data.record_type
            ))
        })
    }

    async fn update_at_provider(
        &mut self,
        external_id: &str,
        data: &RecordData,
    ) -> Result<(), ProviderError> {
        let adapter = self.handle.adapter.clone();
        let external_id = external_id.to_string();
        let data = data.clone();

        self.call_provider("update", || {
            let adapter = adapter.clone();
            let external_id = external_id.clone();
            let data = data.clone();
            async move { adapter.update_record(&external_id, &data).await }
        })
        .await
    }

    /// Run a provider call with per-request timeout and bounded exponential
    /// backoff on retryable errors.
    async fn call_provider<T, F, Fut>(
        &self,
        label: &str,
        mut operation: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut delay = self.config.initial_retry_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match tokio::time::timeout(self.config.request_timeout, operation()).await
            {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Transient("request timed out".to_string()),
            };

            if !error.is_retryable() || attempt > self.config.max_retries {
                return Err(error);
            }

            let wait = match &error {
                ProviderError::RateLimited {
                    retry_after: Some(after),
                } => *after,
                _ => delay,
            };

            tracing::debug!(
                provider = %self.handle.row.name,
                operation = label,
                attempt = attempt,
                retry_in_ms = wait.as_millis() as u64,
                error = %error,
                "Retrying provider call"
            );

            tokio::time::sleep(wait).await;
            delay = std::cmp::min(delay * 2, self.config.max_retry_delay);
        }
    }

    fn handle_item_error(&mut self, action: &str, hostname: &str, error: ProviderError) {
        tracing::error!(
            provider = %self.handle.row.name,
            action = action,
            hostname = %hostname,
            error = %error,
            "Provider action failed, item left in previous state"
        );

        match &error {
            // Credentials are bad for every subsequent call too
            ProviderError::Auth(_) => {
                self.mark_degraded(&format!("authentication failed: {}", error));
            }
            ProviderError::RateLimited { .. } | ProviderError::Transient(_) => {
                self.mark_degraded(&error.to_string());
            }
            _ => {}
        }
    }

    fn mark_degraded(&mut self, reason: &str) {
        if !self.degraded {
            tracing::error!(
                provider = %self.handle.row.name,
                reason = %reason,
                "Provider degraded"
            );
            self.bus.publish_error(
                &format!("provider:{}", self.handle.row.name),
                reason,
            );
        }
        self.degraded = true;
    }

    fn invalidate_cache(&mut self) {
        self.cache = None;
    }
}

fn record_json(data: &RecordData) -> serde_json::Value {
    serde_json::json!({
        "hostname": data.hostname,
        "type": data.record_type,
        "content": data.content,
        "ttl": data.ttl,
        "proxied": data.proxied,
    })
}

fn internal(e: impl std::fmt::Display) -> ProviderError {
    ProviderError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordSource;
    use chrono::Utc;

    fn data(hostname: &str, record_type: RecordType, content: &str) -> RecordData {
        RecordData {
            hostname: hostname.into(),
            record_type,
            content: content.into(),
            ttl: 300,
            priority: None,
            weight: None,
            port: None,
            flags: None,
            tag: None,
            proxied: None,
        }
    }

    fn desired(hostname: &str, content: &str) -> DesiredRecord {
        DesiredRecord {
            provider_id: 1,
            source: RecordSource::Traefik,
            data: data(hostname, RecordType::A, content),
        }
    }

    fn tracked(id: i64, hostname: &str, content: &str, orphaned: bool) -> TrackedRecord {
        let now = Utc::now();
        TrackedRecord {
            id,
            provider_id: 1,
            external_id: Some(format!("ext-{}", id)),
            hostname: hostname.into(),
            record_type: RecordType::A,
            content: content.into(),
            ttl: 300,
            priority: None,
            weight: None,
            port: None,
            flags: None,
            tag: None,
            proxied: None,
            managed: true,
            source: RecordSource::Traefik,
            orphaned_at: orphaned.then_some(now),
            created_at: now,
            updated_at: now,
            last_synced_at: None,
        }
    }

    fn at_provider(id: &str, hostname: &str, content: &str) -> ProviderRecord {
        ProviderRecord {
            external_id: id.into(),
            data: data(hostname, RecordType::A, content),
        }
    }

    #[test]
    fn test_plan_create_for_new_record() {
        let plan = compute_plan(&[desired("a.example.com", "10.0.0.1")], &[], &[]);
        assert_eq!(plan.creates.len(), 1);
        assert!(plan.updates.is_empty());
        assert!(plan.orphans.is_empty());
    }

    #[test]
    fn test_plan_empty_when_converged() {
        let plan = compute_plan(
            &[desired("a.example.com", "10.0.0.1")],
            &[tracked(1, "a.example.com", "10.0.0.1", false)],
            &[at_provider("ext-1", "a.example.com", "10.0.0.1")],
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_update_on_provider_drift() {
        // Tracked matches intent, but the provider was changed out-of-band
        let mut provider = at_provider("ext-1", "a.example.com", "10.0.0.1");
        provider.data.ttl = 60;

        let plan = compute_plan(
            &[desired("a.example.com", "10.0.0.1")],
            &[tracked(1, "a.example.com", "10.0.0.1", false)],
            &[provider],
        );
        assert_eq!(plan.updates.len(), 1);
    }

    #[test]
    fn test_plan_update_on_intent_change() {
        let plan = compute_plan(
            &[desired("a.example.com", "10.0.0.2")],
            &[tracked(1, "a.example.com", "10.0.0.1", false)],
            &[at_provider("ext-1", "a.example.com", "10.0.0.1")],
        );
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].1.data.content, "10.0.0.2");
    }

    #[test]
    fn test_plan_recreate_when_missing_at_provider() {
        let plan = compute_plan(
            &[desired("a.example.com", "10.0.0.1")],
            &[tracked(1, "a.example.com", "10.0.0.1", false)],
            &[],
        );
        assert_eq!(plan.updates.len(), 1);
    }

    #[test]
    fn test_plan_orphan_for_vanished_intent() {
        let plan = compute_plan(
            &[],
            &[tracked(1, "old.example.com", "10.0.0.1", false)],
            &[at_provider("ext-1", "old.example.com", "10.0.0.1")],
        );
        assert_eq!(plan.orphans.len(), 1);
        assert_eq!(plan.orphans[0].hostname, "old.example.com");
    }

    #[test]
    fn test_plan_restore_for_reappeared_intent() {
        let plan = compute_plan(
            &[desired("back.example.com", "10.0.0.1")],
            &[tracked(1, "back.example.com", "10.0.0.1", true)],
            &[at_provider("ext-1", "back.example.com", "10.0.0.1")],
        );
        assert_eq!(plan.restores.len(), 1);
        assert!(plan.creates.is_empty());
        assert!(plan.orphans.is_empty());
    }

    #[test]
    fn test_plan_never_touches_unmanaged() {
        let mut unmanaged = tracked(1, "external.example.com", "192.0.2.1", false);
        unmanaged.managed = false;

        let plan = compute_plan(
            &[],
            &[unmanaged],
            &[at_provider("ext-1", "external.example.com", "192.0.2.1")],
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_already_orphaned_not_reorphaned() {
        let plan = compute_plan(&[], &[tracked(1, "gone.example.com", "10.0.0.1", true)], &[]);
        assert!(plan.orphans.is_empty());
    }
}
