// ABOUTME: Sandbox deletion with ownership checks and idempotent teardown
// ABOUTME: Also hosts the container and image release helpers shared with provisioning

use crate::error::{Result, SandboxError};
use crate::runtime::{self, ContainerRuntime};
use crate::storage::{SandboxStorage, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct LifecycleManager {
    storage: SandboxStorage,
    runtime: Arc<dyn ContainerRuntime>,
    stop_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        storage: SandboxStorage,
        runtime: Arc<dyn ContainerRuntime>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            runtime,
            stop_timeout,
        }
    }

    /// Delete a sandbox owned by `owner_id`.
    ///
    /// An unknown id and an id owned by someone else fail identically. If the
    /// container cannot be torn down the record is kept, so the call can be retried.
    pub async fn delete_sandbox(&self, owner_id: &str, sandbox_id: &str) -> Result<()> {
        let sandbox = match self.storage.get_sandbox(sandbox_id).await {
            Ok(sandbox) if sandbox.owner_id == owner_id => sandbox,
            Ok(_) => {
                warn!(
                    "Tenant {} attempted to delete sandbox {} it does not own",
                    owner_id, sandbox_id
                );
                return Err(SandboxError::NotFoundOrNotOwned(sandbox_id.to_string()));
            }
            Err(StorageError::NotFound(_)) => {
                return Err(SandboxError::NotFoundOrNotOwned(sandbox_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        info!("Deleting sandbox {} for {}", sandbox_id, owner_id);

        if let Err(e) =
            teardown_container(self.runtime.as_ref(), &sandbox.runtime_ref, self.stop_timeout)
                .await
        {
            error!(
                "Teardown of sandbox {} ({}) failed, keeping record: {}",
                sandbox_id, sandbox.runtime_ref, e
            );
            return Err(SandboxError::TeardownFailed(e.to_string()));
        }

        match self.storage.remove_sandbox(sandbox_id).await {
            Ok(()) => {}
            // A concurrent delete of the same sandbox finished first
            Err(StorageError::NotFound(_)) => {
                return Err(SandboxError::NotFoundOrNotOwned(sandbox_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        release_image(
            self.runtime.as_ref(),
            &self.storage,
            &sandbox.image_ref,
            sandbox_id,
            "sandbox deleted",
        )
        .await;

        info!("Deleted sandbox {}", sandbox_id);
        Ok(())
    }
}

/// Stop and remove a container. Already stopped or already missing counts as success.
pub(crate) async fn teardown_container(
    runtime: &dyn ContainerRuntime,
    container_ref: &str,
    stop_timeout: Duration,
) -> runtime::Result<()> {
    runtime
        .stop_container(container_ref, stop_timeout.as_secs())
        .await?;
    runtime.remove_container(container_ref).await
}

/// Remove an image, falling back to the orphaned-image ledger when removal fails
pub(crate) async fn release_image(
    runtime: &dyn ContainerRuntime,
    storage: &SandboxStorage,
    image_ref: &str,
    sandbox_id: &str,
    reason: &str,
) {
    match runtime.remove_image(image_ref).await {
        Ok(()) => debug!("Removed image {}", image_ref),
        Err(e) => {
            warn!(
                "Could not remove image {} of sandbox {}, recording for reclaim: {}",
                image_ref, sandbox_id, e
            );
            record_orphan(storage, image_ref, sandbox_id, &format!("{}: {}", reason, e)).await;
        }
    }
}

pub(crate) async fn record_orphan(
    storage: &SandboxStorage,
    image_ref: &str,
    sandbox_id: &str,
    reason: &str,
) {
    if let Err(e) = storage
        .record_orphaned_image(image_ref, sandbox_id, reason)
        .await
    {
        error!("Failed to record orphaned image {}: {}", image_ref, e);
    }
}
