//! Hostname sources.
//!
//! The watcher produces a stream of observations (hostnames with the DNS
//! labels of the container they came from), either by polling the Traefik
//! routing API or by reading labels straight off containers. Docker lifecycle
//! events trigger immediate rebuilds in both modes.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};

use crate::config::{AppConfig, OperationMode, Settings};
use crate::labels::DnsLabels;
use crate::model::RecordSource;

pub mod docker;
pub mod traefik;

/// Docker event bursts are coalesced within this window before a rebuild
const EVENT_DEBOUNCE: Duration = Duration::from_millis(500);

/// One container's contribution to the intent: which hostnames it advertises
/// and the DNS labels that shape their records.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub container_id: String,
    pub container_name: String,
    pub hostnames: Vec<String>,
    pub labels: DnsLabels,
    /// Which strategy produced this observation
    pub source: RecordSource,
}

/// The full set of observations from one source pass
#[derive(Debug, Clone, Default)]
pub struct ObservationSet {
    pub observations: Vec<Observation>,
}

/// Observes the configured hostname source and publishes observation sets.
pub struct SourceWatcher {
    docker: docker::DockerSource,
    traefik: Option<traefik::TraefikClient>,
    label_prefix: String,
    /// Retained across failed polls so a flaky source API never empties the
    /// intent and triggers mass orphaning
    last_good: ObservationSet,
}

impl SourceWatcher {
    pub fn new(config: &AppConfig, docker: docker::DockerSource) -> Self {
        let traefik = config
            .traefik_api_url
            .as_deref()
            .map(|url| {
                traefik::TraefikClient::new(
                    url,
                    config.traefik_api_username.clone(),
                    config.traefik_api_password.clone(),
                )
            });

        Self {
            docker,
            traefik,
            label_prefix: config.label_prefix.clone(),
            last_good: ObservationSet::default(),
        }
    }

    /// Produce the current observation set, honoring the operation mode.
    ///
    /// On source failure the previous good set is returned; no destructive
    /// action may fire from a failed observation.
    pub async fn observe(&mut self, settings: &Settings) -> ObservationSet {
        let result = match settings.operation_mode {
            OperationMode::Direct => self.observe_direct(settings).await,
            OperationMode::Traefik => self.observe_traefik(settings).await,
        };

        match result {
            Ok(set) => {
                self.last_good = set.clone();
                set
            }
            Err(e) => {
                tracing::warn!(
                    mode = %settings.operation_mode,
                    error = %e,
                    "Source observation failed, keeping last good set"
                );
                self.last_good.clone()
            }
        }
    }

    async fn observe_direct(&self, settings: &Settings) -> Result<ObservationSet> {
        let containers = self.docker.list_containers().await?;

        let observations = containers
            .into_iter()
            .filter_map(|container| {
                let labels =
                    DnsLabels::from_container_labels(&container.labels, &self.label_prefix);

                if !container_included(&labels, settings) {
                    return None;
                }

                let hostnames = labels.hostnames();
                if hostnames.is_empty() {
                    return None;
                }

                Some(Observation {
                    container_id: container.id,
                    container_name: container.name,
                    hostnames,
                    labels,
                    source: RecordSource::ContainerLabel,
                })
            })
            .collect();

        Ok(ObservationSet { observations })
    }

    async fn observe_traefik(&self, settings: &Settings) -> Result<ObservationSet> {
        let traefik = self
            .traefik
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("operation_mode=traefik but TRAEFIK_API_URL is not set"))?;

        let routers = traefik.fetch_routers().await?;
        let containers = self.docker.list_containers().await?;
        let router_index = traefik::RouterIndex::build(&containers);

        let mut observations: Vec<Observation> = Vec::new();

        for router in routers {
            let hostnames = traefik::hostnames_from_rule(&router.rule);
            if hostnames.is_empty() {
                continue;
            }

            // Inherit DNS labels from the container backing this router
            let container = router_index.container_for(&router);

            let labels = container
                .map(|c| DnsLabels::from_container_labels(&c.labels, &self.label_prefix))
                .unwrap_or_default();

            if !container_included(&labels, settings) {
                continue;
            }

            observations.push(Observation {
                container_id: container.map(|c| c.id.clone()).unwrap_or_default(),
                container_name: container
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| router.name.clone()),
                hostnames,
                labels,
                source: RecordSource::Traefik,
            });
        }

        Ok(ObservationSet { observations })
    }
}

/// Apply the `skip` / `manage` policy labels
fn container_included(labels: &DnsLabels, settings: &Settings) -> bool {
    if labels.flag("skip") == Some(true) {
        return false;
    }

    if !settings.dns_default_manage {
        // Opt-in policy: containers must carry manage=true
        return labels.flag("manage") == Some(true);
    }

    labels.flag("manage") != Some(false)
}

/// Run the watcher loop until shutdown.
///
/// Rebuilds happen on every poll tick and on Docker container events, the
/// latter debounced so a burst (compose up) becomes one rebuild. Each rebuild
/// publishes to `observations_tx` and bumps the reconcile trigger.
pub async fn run_watcher(
    mut watcher: SourceWatcher,
    settings_rx: watch::Receiver<Settings>,
    observations_tx: watch::Sender<ObservationSet>,
    trigger_tx: mpsc::Sender<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut docker_events = watcher.docker.container_events();

    loop {
        let settings = settings_rx.borrow().clone();
        let poll_interval = Duration::from_millis(settings.poll_interval_ms.max(1_000));

        let set = watcher.observe(&settings).await;
        let changed = observations_tx.send_if_modified(|current| {
            if current.observations != set.observations {
                *current = set;
                true
            } else {
                false
            }
        });

        // The reconciler re-runs on every pass; an unchanged observation set
        // still needs drift repair against the provider
        let _ = trigger_tx.try_send(());
        if changed {
            tracing::debug!("Observation set changed");
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            event = docker_events.recv() => {
                if event.is_some() {
                    // Coalesce the burst before rebuilding
                    tokio::time::sleep(EVENT_DEBOUNCE).await;
                    while docker_events.try_recv().is_ok() {}
                    tracing::debug!("Docker event triggered rebuild");
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("Source watcher stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_manage(default_manage: bool) -> Settings {
        Settings {
            dns_default_manage: default_manage,
            ..Settings::default()
        }
    }

    #[test]
    fn test_skip_label_excludes() {
        let labels = DnsLabels::from_pairs(&[("skip", "true"), ("hostname", "a.example.com")]);
        assert!(!container_included(&labels, &settings_with_manage(true)));
    }

    #[test]
    fn test_opt_in_policy() {
        let unlabeled = DnsLabels::from_pairs(&[("hostname", "a.example.com")]);
        assert!(!container_included(&unlabeled, &settings_with_manage(false)));

        let managed = DnsLabels::from_pairs(&[("manage", "true")]);
        assert!(container_included(&managed, &settings_with_manage(false)));
    }

    #[test]
    fn test_opt_out_policy() {
        let unlabeled = DnsLabels::from_pairs(&[]);
        assert!(container_included(&unlabeled, &settings_with_manage(true)));

        let opted_out = DnsLabels::from_pairs(&[("manage", "false")]);
        assert!(!container_included(&opted_out, &settings_with_manage(true)));
    }
}
