// ABOUTME: Sandbox manager exposing create, list and delete to the command layer
// ABOUTME: Also reclaims orphaned images and removes containers no record references

use crate::credentials::IdentitySource;
use crate::error::Result;
use crate::lifecycle::{release_image, teardown_container, LifecycleManager};
use crate::provisioner::{ProvisioningEngine, SandboxSummary};
use crate::runtime::{image_tag_for, ContainerRuntime};
use crate::settings::SandboxSettings;
use crate::storage::SandboxStorage;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// What a tenant sees when listing their sandboxes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxListing {
    pub sandbox_id: String,
    pub login_user: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub reclaimed: Vec<String>,
    pub remaining: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub orphaned: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

pub struct SandboxManager {
    storage: SandboxStorage,
    runtime: Arc<dyn ContainerRuntime>,
    settings: Arc<SandboxSettings>,
    provisioner: ProvisioningEngine,
    lifecycle: LifecycleManager,
}

impl SandboxManager {
    pub fn new(
        storage: SandboxStorage,
        runtime: Arc<dyn ContainerRuntime>,
        settings: SandboxSettings,
    ) -> Self {
        let settings = Arc::new(settings);
        let provisioner =
            ProvisioningEngine::new(storage.clone(), runtime.clone(), settings.clone());
        let lifecycle =
            LifecycleManager::new(storage.clone(), runtime.clone(), settings.stop_timeout);

        Self {
            storage,
            runtime,
            settings,
            provisioner,
            lifecycle,
        }
    }

    /// Draw new sandbox identities from `identities` instead of the OS CSPRNG
    pub fn with_identity_source(mut self, identities: Arc<dyn IdentitySource>) -> Self {
        self.provisioner = self.provisioner.with_identity_source(identities);
        self
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn storage(&self) -> &SandboxStorage {
        &self.storage
    }

    pub async fn create_sandbox(&self, owner_id: &str) -> Result<SandboxSummary> {
        self.provisioner.create_sandbox(owner_id).await
    }

    /// Sandboxes of `owner_id` in creation order, without secrets
    pub async fn list_sandboxes(&self, owner_id: &str) -> Result<Vec<SandboxListing>> {
        let sandboxes = self.storage.list_by_owner(owner_id).await?;
        Ok(sandboxes
            .into_iter()
            .map(|s| SandboxListing {
                sandbox_id: s.sandbox_id,
                login_user: s.login_user,
                created_at: s.created_at,
            })
            .collect())
    }

    pub async fn delete_sandbox(&self, owner_id: &str, sandbox_id: &str) -> Result<()> {
        self.lifecycle.delete_sandbox(owner_id, sandbox_id).await
    }

    /// Retry removal of every image in the orphaned-image ledger
    pub async fn reclaim_orphaned_images(&self) -> Result<ReclaimReport> {
        let orphans = self.storage.list_orphaned_images().await?;
        info!("Reclaiming {} orphaned images", orphans.len());

        let mut report = ReclaimReport::default();
        for orphan in orphans {
            match self.runtime.remove_image(&orphan.image_ref).await {
                Ok(()) => {
                    self.storage.remove_orphaned_image(&orphan.image_ref).await?;
                    info!("Reclaimed image {}", orphan.image_ref);
                    report.reclaimed.push(orphan.image_ref);
                }
                Err(e) => {
                    warn!("Image {} still not removable: {}", orphan.image_ref, e);
                    report.remaining.push(orphan.image_ref);
                }
            }
        }

        Ok(report)
    }

    /// Remove managed containers that no stored sandbox references.
    ///
    /// Containers younger than the build plus run timeout are skipped since
    /// their create may still be in flight.
    pub async fn cleanup_orphaned_containers(&self, dry_run: bool) -> Result<CleanupReport> {
        let containers = self.runtime.list_managed_containers().await?;
        let sandboxes = self.storage.list_all().await?;
        info!(
            "Checking {} managed containers against {} stored sandboxes",
            containers.len(),
            sandboxes.len()
        );

        let known_refs: HashSet<&str> = sandboxes.iter().map(|s| s.runtime_ref.as_str()).collect();
        let known_ids: HashSet<&str> = sandboxes.iter().map(|s| s.sandbox_id.as_str()).collect();

        let grace = ChronoDuration::from_std(self.settings.orphan_grace_period())
            .unwrap_or_else(|_| ChronoDuration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(grace)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = CleanupReport::default();

        for container in containers {
            let referenced = known_refs.contains(container.id.as_str())
                || known_refs.contains(container.name.as_str())
                || container
                    .sandbox_id
                    .as_deref()
                    .is_some_and(|id| known_ids.contains(id));
            if referenced || container.created_at > cutoff {
                continue;
            }

            report.orphaned += 1;
            warn!(
                "Found orphaned container: {} (name: {}, state: {})",
                container.id, container.name, container.state
            );

            if dry_run {
                continue;
            }

            match teardown_container(
                self.runtime.as_ref(),
                &container.id,
                self.settings.stop_timeout,
            )
            .await
            {
                Ok(()) => {
                    info!("Removed orphaned container: {}", container.id);
                    report.removed += 1;
                    if let Some(sandbox_id) = container.sandbox_id.as_deref() {
                        release_image(
                            self.runtime.as_ref(),
                            &self.storage,
                            &image_tag_for(sandbox_id),
                            sandbox_id,
                            "orphaned container removed",
                        )
                        .await;
                    }
                }
                Err(e) => {
                    let message = format!(
                        "Failed to remove orphaned container {}: {}",
                        container.id, e
                    );
                    warn!("{}", message);
                    report.errors.push(message);
                }
            }
        }

        if dry_run {
            info!(
                "Dry run complete: found {} orphaned containers (none removed)",
                report.orphaned
            );
        } else {
            info!(
                "Cleanup complete: found {} orphaned containers, removed {} (failed: {})",
                report.orphaned,
                report.removed,
                report.errors.len()
            );
        }

        Ok(report)
    }
}
