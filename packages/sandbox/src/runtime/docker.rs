// ABOUTME: Docker runtime implementation for sandbox containers
// ABOUTME: Uses the bollard library to build sandbox images and manage their containers

use super::{
    ContainerRuntime, ManagedContainer, Result, RunSpec, RuntimeError, MANAGED_LABEL,
    OWNER_ID_LABEL, SANDBOX_ID_LABEL,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions, TopOptions,
    },
    errors::Error as BollardError,
    image::{BuildImageOptions, RemoveImageOptions},
    models::HostConfig,
    Docker,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Name of the script inside the build context
const DOCKERFILE_NAME: &str = "Dockerfile";

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect using the platform defaults (DOCKER_HOST or the local socket)
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?;

        Ok(Self { client })
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    /// Force-remove a container whose start failed. Returns whether it is gone.
    async fn discard_unstarted(&self, container_id: &str) -> bool {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => true,
            Err(e) if is_status(&e, 404) => true,
            Err(e) => {
                warn!(
                    "Failed to remove unstarted container {}: {}",
                    container_id, e
                );
                false
            }
        }
    }

    /// Convert a run spec to a bollard container config
    fn to_bollard_config(spec: &RunSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let host_config = HostConfig {
            privileged: Some(spec.privileged),
            network_mode: Some(spec.network_mode.clone()),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            tty: Some(spec.interactive),
            open_stdin: Some(spec.interactive),
            attach_stdin: Some(spec.interactive),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Pick the command column out of a `top` listing
    fn command_column(titles: &[String]) -> Option<usize> {
        titles
            .iter()
            .position(|t| t == "CMD" || t == "COMMAND")
    }
}

/// Build context holding just the provisioning script
fn create_build_context(script: &[u8]) -> std::io::Result<Vec<u8>> {
    use tar::{Builder, Header};

    let mut archive = Builder::new(Vec::new());

    let mut header = Header::new_gnu();
    header.set_size(script.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, DOCKERFILE_NAME, script)?;

    archive.into_inner()
}

/// Docker takes the stop grace period as a signed integer
fn stop_timeout_arg(timeout_secs: u64) -> i64 {
    i64::try_from(timeout_secs).unwrap_or(i64::MAX)
}

fn is_status(e: &BollardError, code: u16) -> bool {
    matches!(e, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn build_image(&self, script_path: &Path, tag: &str) -> Result<String> {
        info!("Building image {} from {}", tag, script_path.display());

        let script = tokio::fs::read(script_path).await?;
        let context = create_build_context(&script)?;

        let options = BuildImageOptions {
            dockerfile: DOCKERFILE_NAME.to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = Box::pin(self.client.build_image(options, None, Some(context.into())));

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(line) = info.stream.as_deref().map(str::trim_end) {
                        if !line.is_empty() {
                            debug!("[build {}] {}", tag, line);
                        }
                    }
                    if let Some(err) = info.error {
                        error!("Build of {} failed: {}", tag, err);
                        return Err(RuntimeError::ImageError(err));
                    }
                }
                Err(e) => {
                    error!("Build of {} failed: {}", tag, e);
                    return Err(RuntimeError::ImageError(e.to_string()));
                }
            }
        }

        info!("Built image {}", tag);
        Ok(tag.to_string())
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<String> {
        info!("Creating container {} from {}", spec.name, spec.image);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);

        if let Err(e) = self
            .client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            // A created-but-unstarted container would hold the deterministic name
            self.discard_unstarted(&container.id).await;
            return Err(RuntimeError::ContainerError(e.to_string()));
        }

        info!("Started container {} ({})", spec.name, container.id);
        Ok(container.id)
    }

    async fn stop_container(&self, container_ref: &str, timeout_secs: u64) -> Result<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            container_ref, timeout_secs
        );

        let options = StopContainerOptions {
            t: stop_timeout_arg(timeout_secs),
        };

        match self
            .client
            .stop_container(container_ref, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 304) => {
                debug!("Container {} already stopped", container_ref);
                Ok(())
            }
            Err(e) if is_status(&e, 404) => {
                debug!("Container {} no longer exists", container_ref);
                Ok(())
            }
            Err(e) => Err(RuntimeError::ContainerError(e.to_string())),
        }
    }

    async fn remove_container(&self, container_ref: &str) -> Result<()> {
        info!("Removing container: {}", container_ref);

        let options = RemoveContainerOptions {
            v: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_ref, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => {
                debug!("Container {} already removed", container_ref);
                Ok(())
            }
            Err(e) => Err(RuntimeError::ContainerError(e.to_string())),
        }
    }

    async fn remove_image(&self, image_ref: &str) -> Result<()> {
        info!("Removing image: {}", image_ref);

        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        match self
            .client
            .remove_image(image_ref, Some(options), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => {
                debug!("Image {} already removed", image_ref);
                Ok(())
            }
            Err(e) => Err(RuntimeError::ImageError(e.to_string())),
        }
    }

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let label = |key: &str| {
                    c.labels
                        .as_ref()
                        .and_then(|labels| labels.get(key).cloned())
                };
                Some(ManagedContainer {
                    sandbox_id: label(SANDBOX_ID_LABEL),
                    owner_id: label(OWNER_ID_LABEL),
                    name: c
                        .names
                        .unwrap_or_default()
                        .first()
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_else(|| id.clone()),
                    state: c.state.unwrap_or_default(),
                    created_at: c
                        .created
                        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                        .unwrap_or_else(Utc::now),
                    id,
                })
            })
            .collect())
    }

    async fn list_processes(&self, container_ref: &str) -> Result<Vec<String>> {
        let top = self
            .client
            .top_processes(container_ref, None::<TopOptions<String>>)
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))?;

        let titles = top.titles.unwrap_or_default();
        let column = Self::command_column(&titles);

        Ok(top
            .processes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|mut row| match column {
                Some(i) if i < row.len() => Some(row.swap_remove(i)),
                _ => row.pop(),
            })
            .collect())
    }
}
