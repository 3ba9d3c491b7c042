// ABOUTME: Container runtime trait consumed by the provisioning and lifecycle engines
// ABOUTME: Defines image build, container run/stop/remove and inspection operations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

pub mod docker;

pub use docker::DockerRuntime;

/// Label marking containers created by ChunkHost
pub const MANAGED_LABEL: &str = "chunkhost.managed";
/// Label carrying the sandbox id of a container
pub const SANDBOX_ID_LABEL: &str = "chunkhost.sandbox_id";
/// Label carrying the owning tenant of a container
pub const OWNER_ID_LABEL: &str = "chunkhost.owner_id";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Image tag for a sandbox
pub fn image_tag_for(sandbox_id: &str) -> String {
    format!("chunkhost_image_{}", sandbox_id)
}

/// Container name for a sandbox
pub fn container_name_for(sandbox_id: &str) -> String {
    format!("chunkhost_{}", sandbox_id)
}

/// How to start a sandbox container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub hostname: String,
    pub network_mode: String,
    pub privileged: bool,
    /// Allocate a TTY and keep stdin open
    pub interactive: bool,
    pub labels: HashMap<String, String>,
}

/// A container carrying the managed label
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub sandbox_id: Option<String>,
    pub owner_id: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

/// Container runtime backend.
///
/// Implementations must be safe to share across concurrent requests. Stopping an
/// already-stopped container and removing a missing container or image succeed.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check if the runtime daemon is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Build an image from the provisioning script at `script_path`, tagged `tag`.
    /// Returns the image reference.
    async fn build_image(&self, script_path: &Path, tag: &str) -> Result<String>;

    /// Create and start a container. Returns the container reference.
    ///
    /// On error, any container this call created has already been removed.
    async fn run_container(&self, spec: &RunSpec) -> Result<String>;

    /// Stop a running container, waiting up to `timeout_secs` before killing it
    async fn stop_container(&self, container_ref: &str, timeout_secs: u64) -> Result<()>;

    /// Remove a stopped container and its anonymous volumes
    async fn remove_container(&self, container_ref: &str) -> Result<()>;

    /// Remove an image
    async fn remove_image(&self, image_ref: &str) -> Result<()>;

    /// List all containers (running or not) carrying the managed label
    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>>;

    /// Command lines of the processes running inside a container
    async fn list_processes(&self, container_ref: &str) -> Result<Vec<String>>;
}
