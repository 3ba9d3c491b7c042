// ABOUTME: Shared fixtures for sandbox integration tests
// ABOUTME: In-memory container runtime with failure switches plus manager setup helpers

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chunkhost_sandbox::runtime::{self, OWNER_ID_LABEL, SANDBOX_ID_LABEL};
use chunkhost_sandbox::{
    ContainerRuntime, IdentitySource, ManagedContainer, RunSpec, RuntimeError, Sandbox,
    SandboxIdentity, SandboxManager, SandboxSettings, SandboxStorage,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub sandbox_id: Option<String>,
    pub owner_id: Option<String>,
    pub hostname: String,
    pub privileged: bool,
    pub running: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MockState {
    pub images: HashSet<String>,
    pub containers: Vec<MockContainer>,
    /// Script paths handed to `build_image`, in call order
    pub script_paths: Vec<PathBuf>,
    /// Script contents read during `build_image`
    pub scripts: Vec<String>,
    /// Process listings keyed by container id
    pub processes: HashMap<String, Vec<String>>,

    pub fail_build: bool,
    pub fail_run: bool,
    pub fail_stop: bool,
    pub fail_remove: bool,
    pub fail_remove_image: bool,
    pub build_delay: Option<Duration>,
    /// Delay after the container is created, before `run_container` returns
    pub run_delay: Option<Duration>,

    /// Store that `run_container` writes a conflicting record into, simulating a racing insert
    pub race_insert: Option<SandboxStorage>,

    next_id: usize,
}

/// Container runtime that keeps images and containers in memory
#[derive(Default)]
pub struct MockRuntime {
    pub state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn container_count(&self) -> usize {
        self.with_state(|s| s.containers.len())
    }

    pub fn has_container_for(&self, sandbox_id: &str) -> bool {
        self.with_state(|s| {
            s.containers
                .iter()
                .any(|c| c.sandbox_id.as_deref() == Some(sandbox_id))
        })
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.with_state(|s| s.images.contains(tag))
    }

    pub fn has_container_named(&self, name: &str) -> bool {
        self.with_state(|s| s.containers.iter().any(|c| c.name == name))
    }

    /// Insert a running container for `sandbox_id` created by another tenant's request
    pub fn add_foreign_container(&self, sandbox_id: &str, owner_id: &str) -> String {
        self.with_state(|s| {
            s.next_id += 1;
            let id = format!("foreign-{}", s.next_id);
            s.containers.push(MockContainer {
                id: id.clone(),
                name: runtime::container_name_for(sandbox_id),
                image: runtime::image_tag_for(sandbox_id),
                sandbox_id: Some(sandbox_id.to_string()),
                owner_id: Some(owner_id.to_string()),
                hostname: format!("chunkhost-{}", sandbox_id),
                privileged: true,
                running: true,
                created_at: Utc::now(),
            });
            s.images.insert(runtime::image_tag_for(sandbox_id));
            id
        })
    }

    /// Insert a managed container that no record references
    pub fn add_stray_container(&self, sandbox_id: &str, age: Duration) -> String {
        self.with_state(|s| {
            s.next_id += 1;
            let id = format!("stray-{}", s.next_id);
            s.containers.push(MockContainer {
                id: id.clone(),
                name: runtime::container_name_for(sandbox_id),
                image: runtime::image_tag_for(sandbox_id),
                sandbox_id: Some(sandbox_id.to_string()),
                owner_id: Some("stray".to_string()),
                hostname: format!("chunkhost-{}", sandbox_id),
                privileged: true,
                running: true,
                created_at: Utc::now() - chrono::Duration::from_std(age).unwrap(),
            });
            s.images.insert(runtime::image_tag_for(sandbox_id));
            id
        })
    }

    fn find(state: &MockState, container_ref: &str) -> Option<usize> {
        state
            .containers
            .iter()
            .position(|c| c.id == container_ref || c.name == container_ref)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn is_available(&self) -> runtime::Result<bool> {
        Ok(true)
    }

    async fn build_image(&self, script_path: &Path, tag: &str) -> runtime::Result<String> {
        let script = std::fs::read_to_string(script_path)?;
        let delay = self.with_state(|s| {
            s.script_paths.push(script_path.to_path_buf());
            s.scripts.push(script);
            s.build_delay
        });

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.with_state(|s| {
            if s.fail_build {
                return Err(RuntimeError::ImageError(
                    "step 3/9 exited with code 100".to_string(),
                ));
            }
            s.images.insert(tag.to_string());
            Ok(tag.to_string())
        })
    }

    async fn run_container(&self, spec: &RunSpec) -> runtime::Result<String> {
        let (id, race, delay) = self.with_state(|s| {
            if !s.images.contains(&spec.image) {
                return Err(RuntimeError::ContainerError(format!(
                    "No such image: {}",
                    spec.image
                )));
            }
            if s.containers.iter().any(|c| c.name == spec.name) {
                return Err(RuntimeError::ContainerError(format!(
                    "Conflict: name {} in use",
                    spec.name
                )));
            }
            // Like Docker, a container whose start fails is removed before erroring
            if s.fail_run {
                return Err(RuntimeError::ContainerError(
                    "OCI runtime create failed".to_string(),
                ));
            }

            s.next_id += 1;
            let id = format!("mock-{:04}", s.next_id);
            let sandbox_id = spec.labels.get(SANDBOX_ID_LABEL).cloned();

            s.containers.push(MockContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                sandbox_id: sandbox_id.clone(),
                owner_id: spec.labels.get(OWNER_ID_LABEL).cloned(),
                hostname: spec.hostname.clone(),
                privileged: spec.privileged,
                running: true,
                created_at: Utc::now(),
            });

            Ok((id, s.race_insert.clone().zip(sandbox_id), s.run_delay))
        })?;

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some((storage, sandbox_id)) = race {
            storage
                .add_sandbox(&Sandbox {
                    sandbox_id,
                    owner_id: "racer".to_string(),
                    runtime_ref: "racer-container".to_string(),
                    image_ref: "racer-image".to_string(),
                    login_user: "user9999".to_string(),
                    login_secret: "RacerSecret1".to_string(),
                    created_at: Utc::now(),
                })
                .await
                .expect("Failed to insert racing record");
        }

        Ok(id)
    }

    async fn stop_container(&self, container_ref: &str, _timeout_secs: u64) -> runtime::Result<()> {
        self.with_state(|s| {
            if s.fail_stop {
                return Err(RuntimeError::ContainerError(
                    "daemon did not respond".to_string(),
                ));
            }
            if let Some(i) = Self::find(s, container_ref) {
                s.containers[i].running = false;
            }
            Ok(())
        })
    }

    async fn remove_container(&self, container_ref: &str) -> runtime::Result<()> {
        self.with_state(|s| {
            if s.fail_remove {
                return Err(RuntimeError::ContainerError(
                    "removal already in progress".to_string(),
                ));
            }
            if let Some(i) = Self::find(s, container_ref) {
                s.containers.remove(i);
            }
            Ok(())
        })
    }

    async fn remove_image(&self, image_ref: &str) -> runtime::Result<()> {
        self.with_state(|s| {
            if s.fail_remove_image {
                return Err(RuntimeError::ImageError(
                    "image is being used by a stopped container".to_string(),
                ));
            }
            s.images.remove(image_ref);
            Ok(())
        })
    }

    async fn list_managed_containers(&self) -> runtime::Result<Vec<ManagedContainer>> {
        Ok(self.with_state(|s| {
            s.containers
                .iter()
                .map(|c| ManagedContainer {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    sandbox_id: c.sandbox_id.clone(),
                    owner_id: c.owner_id.clone(),
                    state: if c.running { "running" } else { "exited" }.to_string(),
                    created_at: c.created_at,
                })
                .collect()
        }))
    }

    async fn list_processes(&self, container_ref: &str) -> runtime::Result<Vec<String>> {
        self.with_state(|s| match Self::find(s, container_ref) {
            Some(i) => Ok(s
                .processes
                .get(&s.containers[i].id)
                .cloned()
                .unwrap_or_else(|| vec!["/sbin/init".to_string()])),
            None => Err(RuntimeError::ContainerError(format!(
                "No such container: {}",
                container_ref
            ))),
        })
    }
}

/// Hands out queued identities, then random ones
#[derive(Default)]
pub struct QueuedIdentities {
    queue: Mutex<VecDeque<SandboxIdentity>>,
}

impl QueuedIdentities {
    pub fn with_ids(ids: &[&str]) -> Self {
        let queue = ids
            .iter()
            .map(|id| SandboxIdentity {
                sandbox_id: id.to_string(),
                ..SandboxIdentity::generate()
            })
            .collect();
        Self {
            queue: Mutex::new(queue),
        }
    }
}

impl IdentitySource for QueuedIdentities {
    fn next_identity(&self) -> SandboxIdentity {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(SandboxIdentity::generate)
    }
}

/// Stored record for `sandbox_id` owned by `owner_id`
pub fn record_for(sandbox_id: &str, owner_id: &str) -> Sandbox {
    Sandbox {
        sandbox_id: sandbox_id.to_string(),
        owner_id: owner_id.to_string(),
        runtime_ref: format!("{}-container", sandbox_id),
        image_ref: runtime::image_tag_for(sandbox_id),
        login_user: "user1234".to_string(),
        login_secret: "StoredSecret".to_string(),
        created_at: Utc::now(),
    }
}

pub struct TestEnv {
    pub manager: SandboxManager,
    pub runtime: Arc<MockRuntime>,
    pub storage: SandboxStorage,
    pub build_dir: TempDir,
}

pub fn test_settings(max_per_tenant: usize, build_dir: &Path) -> SandboxSettings {
    SandboxSettings {
        max_per_tenant,
        build_dir: build_dir.to_path_buf(),
        build_timeout: Duration::from_secs(5),
        run_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(1),
        ..SandboxSettings::default()
    }
}

pub async fn setup(max_per_tenant: usize) -> TestEnv {
    let build_dir = TempDir::new().expect("Failed to create build dir");
    setup_with(test_settings(max_per_tenant, build_dir.path()), build_dir).await
}

/// Like `setup`, with the given sandbox ids handed out first
pub async fn setup_with_ids(max_per_tenant: usize, ids: &[&str]) -> TestEnv {
    let mut env = setup(max_per_tenant).await;
    env.manager = env
        .manager
        .with_identity_source(Arc::new(QueuedIdentities::with_ids(ids)));
    env
}

pub async fn setup_with(settings: SandboxSettings, build_dir: TempDir) -> TestEnv {
    let pool = chunkhost_storage::in_memory()
        .await
        .expect("Failed to create in-memory database");
    let storage = SandboxStorage::new(pool);
    let runtime = Arc::new(MockRuntime::new());

    let manager = SandboxManager::new(
        storage.clone(),
        runtime.clone() as Arc<dyn ContainerRuntime>,
        settings,
    );

    TestEnv {
        manager,
        runtime,
        storage,
        build_dir,
    }
}

/// Files left behind in a build directory
pub fn leftover_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .expect("Failed to read build dir")
        .map(|entry| entry.expect("Failed to read entry").path())
        .collect()
}
