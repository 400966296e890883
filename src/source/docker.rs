use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::Docker;
use bollard::container::ListContainersOptions;
use bollard::system::EventsOptions;
use futures::StreamExt;
use tokio::sync::mpsc;

/// A running container as seen by the watcher
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Docker Engine API access for container listing and lifecycle events
#[derive(Clone)]
pub struct DockerSource {
    docker: Docker,
}

impl DockerSource {
    pub fn connect(socket: &Path) -> Result<Self> {
        let docker = Docker::connect_with_unix(
            socket
                .to_str()
                .context("Docker socket path is not valid UTF-8")?,
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .context("Failed to connect to Docker")?;

        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await.context("Docker ping failed")?;
        Ok(())
    }

    /// Running containers with their full label maps
    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        let infos = containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.chars().take(12).collect());

                Some(ContainerInfo {
                    id,
                    name,
                    labels: summary.labels.unwrap_or_default(),
                })
            })
            .collect();

        Ok(infos)
    }

    /// Stream of container lifecycle event actions (create/start/stop/die/destroy).
    ///
    /// The underlying stream is re-established after errors; the receiver
    /// only ever closes on shutdown.
    pub fn container_events(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(64);
        let docker = self.docker.clone();

        tokio::spawn(async move {
            loop {
                let options = EventsOptions::<String> {
                    filters: HashMap::from([
                        ("type".to_string(), vec!["container".to_string()]),
                        (
                            "event".to_string(),
                            vec![
                                "create".to_string(),
                                "start".to_string(),
                                "stop".to_string(),
                                "die".to_string(),
                                "destroy".to_string(),
                            ],
                        ),
                    ]),
                    ..Default::default()
                };

                let mut stream = docker.events(Some(options));

                while let Some(event) = stream.next().await {
                    match event {
                        Ok(message) => {
                            let action = message.action.unwrap_or_default();
                            if tx.send(action).await.is_err() {
                                // Receiver dropped: watcher shut down
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Docker event stream error");
                            break;
                        }
                    }
                }

                if tx.is_closed() {
                    return;
                }

                tracing::debug!("Reconnecting Docker event stream");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        rx
    }
}
