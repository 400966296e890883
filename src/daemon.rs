//! Engine wiring and lifecycle.
//!
//! One watcher task observes the hostname source, one reconciler worker runs
//! per enabled provider (serialized per provider, parallel across providers),
//! one orphan sweep runs periodically, and one task refreshes the public IP.
//! A trigger from the watcher rebuilds the intent set and fans it out to the
//! workers through watch channels, which coalesce re-runs naturally: a
//! trigger landing mid-cycle is picked up once the cycle ends.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::{AppConfig, Settings, TunnelMode};
use crate::db::queries;
use crate::events::EventBus;
use crate::intent::{IntentBuilder, ProviderView};
use crate::ip::PublicIpCache;
use crate::model::DesiredRecord;
use crate::provider::ProviderRegistry;
use crate::reconcile::orphan::OrphanSweeper;
use crate::reconcile::{Reconciler, ReconcilerConfig};
use crate::secrets::{EnvSecretStore, SecretStore};
use crate::source::{ObservationSet, SourceWatcher, docker::DockerSource, run_watcher};
use crate::tunnel::{TunnelReconciler, desired_ingress};

const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Run the engine until SIGINT/SIGTERM
pub async fn run(config: AppConfig) -> Result<()> {
    let pool = crate::db::connect(&config.database_path).await?;

    // Environment seeds missing settings on first boot; persisted values win
    for (key, value) in Settings::env_seed() {
        queries::seed_setting(&pool, &key, &value).await?;
    }
    let settings = Settings::from_kv(&queries::load_settings(&pool).await?);

    seed_provider_from_env(&pool).await?;

    let secrets = EnvSecretStore::new();
    let bus = EventBus::default();

    let registry = build_registry(&pool, &secrets, &bus).await?;
    probe_providers(&registry, &bus).await;

    let docker = DockerSource::connect(&config.docker_socket)?;
    docker.ping().await.context("Docker is not reachable")?;

    let ip_cache = PublicIpCache::new();
    if let Err(e) = ip_cache.refresh().await {
        tracing::warn!(error = %e, "Initial public IP discovery failed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (settings_tx, settings_rx) = watch::channel(settings.clone());
    let (observations_tx, observations_rx) = watch::channel(ObservationSet::default());
    let (trigger_tx, trigger_rx) = mpsc::channel::<()>(4);

    let mut tasks = JoinSet::new();

    // Source watcher
    let watcher = SourceWatcher::new(&config, docker.clone());
    tasks.spawn(run_watcher(
        watcher,
        settings_rx.clone(),
        observations_tx,
        trigger_tx.clone(),
        shutdown_rx.clone(),
    ));

    // Public IP refresher
    tasks.spawn(run_ip_refresher(
        ip_cache.clone(),
        settings_rx.clone(),
        trigger_tx.clone(),
        shutdown_rx.clone(),
    ));

    // Per-provider reconciler workers
    let mut intent_txs: HashMap<i64, watch::Sender<Vec<DesiredRecord>>> = HashMap::new();
    let mut degraded_flags: HashMap<i64, Arc<AtomicBool>> = HashMap::new();

    for handle in registry.in_routing_order() {
        let (intent_tx, intent_rx) = watch::channel(Vec::new());
        let degraded = Arc::new(AtomicBool::new(false));

        let reconciler = Reconciler::new(
            handle.clone(),
            pool.clone(),
            bus.clone(),
            ReconcilerConfig::default(),
        );

        intent_txs.insert(handle.row.id, intent_tx);
        degraded_flags.insert(handle.row.id, degraded.clone());
        tasks.spawn(run_provider_worker(
            reconciler,
            intent_rx,
            degraded,
            shutdown_rx.clone(),
        ));
    }

    // Orphan sweep
    let sweeper = OrphanSweeper::new(pool.clone(), bus.clone());
    let sweep_registry = registry.clone();
    let sweep_settings_rx = settings_rx.clone();
    let mut sweep_shutdown_rx = shutdown_rx.clone();
    tasks.spawn(async move {
        let mut interval = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let settings = sweep_settings_rx.borrow().clone();
                    if let Err(e) = sweeper.sweep(&sweep_registry, &settings).await {
                        tracing::error!(error = %e, "Orphan sweep failed");
                    }
                }
                _ = sweep_shutdown_rx.changed() => return,
            }
        }
    });

    tracing::info!(
        providers = registry.len(),
        mode = %settings.operation_mode,
        "TrafegoDNS engine started"
    );

    // Coordinator: rebuild intent on every trigger and fan out
    run_coordinator(CoordinatorContext {
        pool: pool.clone(),
        bus: bus.clone(),
        registry: registry.clone(),
        ip_cache,
        settings_tx,
        observations_rx,
        trigger_rx,
        intent_txs,
        degraded_flags,
    })
    .await;

    // Shutdown: stop scheduling new work, let in-flight writes finish
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        tracing::warn!("Some tasks did not stop within the shutdown grace period");
    }

    Ok(())
}

struct CoordinatorContext {
    pool: SqlitePool,
    bus: EventBus,
    registry: ProviderRegistry,
    ip_cache: PublicIpCache,
    settings_tx: watch::Sender<Settings>,
    observations_rx: watch::Receiver<ObservationSet>,
    trigger_rx: mpsc::Receiver<()>,
    intent_txs: HashMap<i64, watch::Sender<Vec<DesiredRecord>>>,
    degraded_flags: HashMap<i64, Arc<AtomicBool>>,
}

async fn run_coordinator(mut ctx: CoordinatorContext) {
    let tunnel_reconciler = TunnelReconciler::new(ctx.pool.clone(), ctx.bus.clone());

    loop {
        tokio::select! {
            maybe = ctx.trigger_rx.recv() => {
                if maybe.is_none() {
                    return;
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
                return;
            }
        }

        if let Err(e) = run_cycle(&mut ctx, &tunnel_reconciler).await {
            tracing::error!(error = %e, "Intent rebuild failed");
            ctx.bus.publish_error("coordinator", &e.to_string());
        }
    }
}

async fn run_cycle(
    ctx: &mut CoordinatorContext,
    tunnel_reconciler: &TunnelReconciler,
) -> Result<()> {
    // Settings are re-read every cycle so dashboard edits apply live
    let settings = Settings::from_kv(&queries::load_settings(&ctx.pool).await?);
    ctx.settings_tx.send_if_modified(|current| {
        if *current != settings {
            *current = settings.clone();
            true
        } else {
            false
        }
    });

    let observations = ctx.observations_rx.borrow().clone();
    let manual = queries::list_managed_hostnames(&ctx.pool).await?;
    let overrides = queries::list_overrides(&ctx.pool).await?;
    let public_ip = ctx.ip_cache.current().await;

    let degraded: HashSet<i64> = ctx
        .degraded_flags
        .iter()
        .filter(|(_, flag)| flag.load(Ordering::Relaxed))
        .map(|(id, _)| *id)
        .collect();

    let builder = IntentBuilder::new(ProviderView::from_registry(&ctx.registry));
    let intent = builder.build(
        &observations,
        &manual,
        &overrides,
        &settings,
        public_ip,
        &degraded,
    );

    for rejected in &intent.rejected {
        ctx.bus.publish_error(
            "validation",
            &format!("{}: {}", rejected.hostname, rejected.error),
        );
    }

    tracing::debug!(
        desired = intent.len(),
        rejected = intent.rejected.len(),
        "Intent set rebuilt"
    );

    for (provider_id, intent_tx) in &ctx.intent_txs {
        let _ = intent_tx.send(intent.for_provider(*provider_id));
    }

    reconcile_tunnel(ctx, tunnel_reconciler, &observations, &settings).await;

    Ok(())
}

async fn reconcile_tunnel(
    ctx: &CoordinatorContext,
    tunnel_reconciler: &TunnelReconciler,
    observations: &ObservationSet,
    settings: &Settings,
) {
    if settings.tunnel_mode == TunnelMode::Off {
        return;
    }

    let Some(tunnel_id) = &settings.tunnel_default_tunnel_id else {
        tracing::warn!("Tunnel mode enabled but tunnel_default_tunnel_id is not set");
        return;
    };

    let Some(handle) = ctx
        .registry
        .in_routing_order()
        .into_iter()
        .find(|handle| handle.adapter.tunnel_ops().is_some())
    else {
        tracing::warn!("Tunnel mode enabled but no tunnel-capable provider is configured");
        return;
    };

    let desired = desired_ingress(observations, settings);
    if let Err(e) = tunnel_reconciler
        .reconcile(handle, tunnel_id, &desired)
        .await
    {
        tracing::error!(error = %e, "Tunnel ingress reconciliation failed");
        ctx.bus.publish_error("tunnel", &e.to_string());
    }
}

/// One worker per provider; the watch channel hands it the latest intent and
/// coalesces triggers that arrive while a cycle is in flight.
async fn run_provider_worker(
    mut reconciler: Reconciler,
    mut intent_rx: watch::Receiver<Vec<DesiredRecord>>,
    degraded: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = intent_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown_rx.changed() => return,
        }

        let desired = intent_rx.borrow_and_update().clone();
        if let Err(e) = reconciler.reconcile(&desired).await {
            tracing::error!(
                provider_id = reconciler.provider_id(),
                error = %e,
                "Reconciliation cycle failed"
            );
        }
        degraded.store(reconciler.is_degraded(), Ordering::Relaxed);
    }
}

async fn run_ip_refresher(
    ip_cache: PublicIpCache,
    settings_rx: watch::Receiver<Settings>,
    trigger_tx: mpsc::Sender<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let interval =
            Duration::from_millis(settings_rx.borrow().ip_refresh_interval_ms.max(60_000));

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let before = ip_cache.current().await;
                match ip_cache.refresh().await {
                    Ok(after) if after != before => {
                        // Apex records derive from the public IP
                        let _ = trigger_tx.try_send(());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Public IP refresh failed"),
                }
            }
            _ = shutdown_rx.changed() => return,
        }
    }
}

async fn build_registry(
    pool: &SqlitePool,
    secrets: &dyn SecretStore,
    bus: &EventBus,
) -> Result<ProviderRegistry> {
    let rows = queries::list_enabled_providers(pool).await?;
    if rows.is_empty() {
        anyhow::bail!(
            "no providers configured; set DNS_PROVIDER/DNS_ZONE or add one to the store"
        );
    }

    let (registry, failures) = ProviderRegistry::build(rows, secrets).await;
    for (name, reason) in failures {
        bus.publish_error(&format!("provider:{}", name), &reason);
    }

    if registry.is_empty() {
        anyhow::bail!("no provider could be initialized");
    }

    Ok(registry)
}

async fn probe_providers(registry: &ProviderRegistry, bus: &EventBus) {
    for handle in registry.in_routing_order() {
        match handle.adapter.test_connection().await {
            Ok(()) => {
                tracing::info!(
                    provider = %handle.row.name,
                    zone = %handle.row.zone,
                    "Provider connection verified"
                );
            }
            Err(e) => {
                tracing::error!(
                    provider = %handle.row.name,
                    error = %e,
                    "Provider connection check failed"
                );
                bus.publish_error(&format!("provider:{}", handle.row.name), &e.to_string());
            }
        }
    }
}

/// First-boot convenience: create a provider row from the environment when
/// the store has none.
async fn seed_provider_from_env(pool: &SqlitePool) -> Result<()> {
    if queries::count_providers(pool).await? > 0 {
        return Ok(());
    }

    let Ok(provider_type) = std::env::var("DNS_PROVIDER") else {
        return Ok(());
    };
    let zone = std::env::var("DNS_ZONE")
        .context("DNS_ZONE is required when DNS_PROVIDER is set")?;

    let credential_ref = std::env::var("DNS_CREDENTIAL_REF")
        .unwrap_or_else(|_| format!("{}_api_token", provider_type));
    let account_ref = std::env::var("DNS_ACCOUNT_REF").ok();
    let default_ttl: Option<u32> = std::env::var("DNS_DEFAULT_TTL")
        .ok()
        .and_then(|v| v.parse().ok());

    let tunnel_capable = provider_type == "cloudflare" && account_ref.is_some();

    let id = queries::insert_provider(
        pool,
        &provider_type,
        &provider_type,
        &zone,
        default_ttl,
        100,
        Some(&credential_ref),
        account_ref.as_deref(),
        tunnel_capable,
    )
    .await?;

    tracing::info!(
        provider = %provider_type,
        zone = %zone,
        id = id,
        "Seeded provider from environment"
    );

    Ok(())
}

/// `validate-config`: check the store, providers, and Docker connectivity
/// without starting any workers.
pub async fn validate(config: AppConfig) -> Result<()> {
    let pool = crate::db::connect(&config.database_path).await?;
    seed_provider_from_env(&pool).await?;

    let secrets = EnvSecretStore::new();
    let bus = EventBus::default();
    let registry = build_registry(&pool, &secrets, &bus).await?;

    let mut failed = 0;
    for handle in registry.in_routing_order() {
        match handle.adapter.test_connection().await {
            Ok(()) => println!("provider '{}' ({}): ok", handle.row.name, handle.row.zone),
            Err(e) => {
                println!("provider '{}' ({}): {}", handle.row.name, handle.row.zone, e);
                failed += 1;
            }
        }
    }

    match DockerSource::connect(&config.docker_socket) {
        Ok(docker) => match docker.ping().await {
            Ok(()) => println!("docker: ok"),
            Err(e) => {
                println!("docker: {}", e);
                failed += 1;
            }
        },
        Err(e) => {
            println!("docker: {}", e);
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} check(s) failed", failed);
    }

    Ok(())
}
