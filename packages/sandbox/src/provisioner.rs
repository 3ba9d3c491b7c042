// ABOUTME: Provisioning engine that turns a create request into a running sandbox
// ABOUTME: Quota, identity, script render, image build, container run and record persistence

use crate::credentials::{IdentitySource, RandomIdentities, SandboxIdentity};
use crate::error::{Result, SandboxError};
use crate::lifecycle::{record_orphan, release_image, teardown_container};
use crate::quota::QuotaEnforcer;
use crate::runtime::{
    container_name_for, image_tag_for, ContainerRuntime, ManagedContainer, RunSpec,
    OWNER_ID_LABEL, SANDBOX_ID_LABEL,
};
use crate::settings::SandboxSettings;
use crate::storage::{Sandbox, SandboxStorage, StorageError};
use crate::template::{self, hostname_for, TemplateParams};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Identity draws before giving up on finding an unused sandbox id
const MAX_IDENTITY_ATTEMPTS: usize = 3;

/// Returned once to the requester. The secrets are not retrievable later.
#[derive(Clone)]
pub struct SandboxSummary {
    pub sandbox_id: String,
    pub login_user: String,
    pub login_secret: String,
    pub root_secret: String,
}

impl fmt::Debug for SandboxSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxSummary")
            .field("sandbox_id", &self.sandbox_id)
            .field("login_user", &self.login_user)
            .field("login_secret", &"<redacted>")
            .field("root_secret", &"<redacted>")
            .finish()
    }
}

pub struct ProvisioningEngine {
    storage: SandboxStorage,
    runtime: Arc<dyn ContainerRuntime>,
    quota: QuotaEnforcer,
    settings: Arc<SandboxSettings>,
    identities: Arc<dyn IdentitySource>,
}

impl ProvisioningEngine {
    pub fn new(
        storage: SandboxStorage,
        runtime: Arc<dyn ContainerRuntime>,
        settings: Arc<SandboxSettings>,
    ) -> Self {
        let quota = QuotaEnforcer::new(storage.clone(), settings.max_per_tenant);
        Self {
            storage,
            runtime,
            quota,
            settings,
            identities: Arc::new(RandomIdentities),
        }
    }

    /// Replace the source new sandbox identities are drawn from
    pub fn with_identity_source(mut self, identities: Arc<dyn IdentitySource>) -> Self {
        self.identities = identities;
        self
    }

    /// Provision a sandbox for `owner_id`.
    ///
    /// On success the record is stored and the container is running. On any
    /// failure no record is written and the container is gone.
    pub async fn create_sandbox(&self, owner_id: &str) -> Result<SandboxSummary> {
        let _reservation = self.quota.check_and_reserve(owner_id).await?;

        let identity = self.fresh_identity().await?;
        let sandbox_id = identity.sandbox_id.as_str();
        info!("Provisioning sandbox {} for {}", sandbox_id, owner_id);

        let script = template::render(&TemplateParams {
            base_image: &self.settings.base_image,
            root_secret: &identity.root_secret,
            username: &identity.login_user,
            user_secret: &identity.login_secret,
            welcome_text: &self.settings.welcome_text,
            watermark_text: &self.settings.watermark_text,
            sandbox_id,
            hardware: &self.settings.hardware,
        })?;

        let image_ref = self.build(sandbox_id, &script).await?;
        let runtime_ref = self.run(sandbox_id, owner_id, &image_ref).await?;

        let record = Sandbox {
            sandbox_id: sandbox_id.to_string(),
            owner_id: owner_id.to_string(),
            runtime_ref: runtime_ref.clone(),
            image_ref: image_ref.clone(),
            login_user: identity.login_user.clone(),
            login_secret: identity.login_secret.clone(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.storage.add_sandbox(&record).await {
            self.roll_back(sandbox_id, &runtime_ref, &image_ref).await;
            return Err(match e {
                StorageError::DuplicateId(id) => {
                    error!(
                        "Sandbox id {} was taken between the existence check and the insert",
                        id
                    );
                    SandboxError::InternalDuplicate(id)
                }
                other => other.into(),
            });
        }

        info!(
            "Sandbox {} ready for {} (container {})",
            sandbox_id, owner_id, runtime_ref
        );

        Ok(SandboxSummary {
            sandbox_id: identity.sandbox_id.clone(),
            login_user: identity.login_user.clone(),
            login_secret: identity.login_secret.clone(),
            root_secret: identity.root_secret.clone(),
        })
    }

    async fn fresh_identity(&self) -> Result<SandboxIdentity> {
        let mut identity = self.identities.next_identity();
        for attempt in 1..=MAX_IDENTITY_ATTEMPTS {
            if !self.storage.sandbox_exists(&identity.sandbox_id).await? {
                return Ok(identity);
            }
            warn!(
                "Sandbox id {} already in use (attempt {}/{}), regenerating",
                identity.sandbox_id, attempt, MAX_IDENTITY_ATTEMPTS
            );
            identity = self.identities.next_identity();
        }

        error!(
            "No unused sandbox id after {} attempts",
            MAX_IDENTITY_ATTEMPTS
        );
        Err(SandboxError::InternalDuplicate(identity.sandbox_id))
    }

    /// Build the image from a transient script file that is deleted on every path
    async fn build(&self, sandbox_id: &str, script: &str) -> Result<String> {
        let script_file = self
            .write_script(sandbox_id, script)
            .map_err(|e| SandboxError::BuildFailed(format!("could not write script: {}", e)))?;

        let tag = image_tag_for(sandbox_id);
        let outcome = timeout(
            self.settings.build_timeout,
            self.runtime.build_image(script_file.path(), &tag),
        )
        .await;

        if let Err(e) = script_file.close() {
            warn!("Failed to delete provisioning script for {}: {}", sandbox_id, e);
        }

        match outcome {
            Ok(Ok(image_ref)) => Ok(image_ref),
            Ok(Err(e)) => {
                error!("Build failed for sandbox {}: {}", sandbox_id, e);
                Err(SandboxError::BuildFailed(e.to_string()))
            }
            Err(_) => {
                let secs = self.settings.build_timeout.as_secs();
                error!("Build of sandbox {} timed out after {}s", sandbox_id, secs);
                // The daemon may still finish and tag the image
                record_orphan(&self.storage, &tag, sandbox_id, "build timed out").await;
                Err(SandboxError::BuildFailed(format!("timed out after {}s", secs)))
            }
        }
    }

    fn write_script(&self, sandbox_id: &str, script: &str) -> std::io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("Dockerfile_{}_", sandbox_id))
            .tempfile_in(&self.settings.build_dir)?;
        file.write_all(script.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    async fn run(&self, sandbox_id: &str, owner_id: &str, image_ref: &str) -> Result<String> {
        let spec = RunSpec {
            image: image_ref.to_string(),
            name: container_name_for(sandbox_id),
            hostname: hostname_for(sandbox_id),
            network_mode: self.settings.network_mode.clone(),
            privileged: true,
            interactive: true,
            labels: HashMap::from([
                (SANDBOX_ID_LABEL.to_string(), sandbox_id.to_string()),
                (OWNER_ID_LABEL.to_string(), owner_id.to_string()),
            ]),
        };

        let cause = match timeout(self.settings.run_timeout, self.runtime.run_container(&spec))
            .await
        {
            Ok(Ok(runtime_ref)) => return Ok(runtime_ref),
            // run_container removes whatever it created before returning an error, and
            // the name may belong to a concurrent create that drew the same id
            Ok(Err(e)) => e.to_string(),
            Err(_) => {
                self.remove_timed_out_container(&spec, sandbox_id, owner_id)
                    .await;
                format!("timed out after {}s", self.settings.run_timeout.as_secs())
            }
        };

        error!("Container start failed for sandbox {}: {}", sandbox_id, cause);
        self.release_unused_image(sandbox_id, image_ref).await;

        Err(SandboxError::RunFailed(cause))
    }

    /// Tear down the container a cancelled run may have left, if its labels say
    /// this request created it
    async fn remove_timed_out_container(&self, spec: &RunSpec, sandbox_id: &str, owner_id: &str) {
        let containers = match self.runtime.list_managed_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                error!(
                    "Could not list containers after run timeout for sandbox {}: {}",
                    sandbox_id, e
                );
                return;
            }
        };

        for container in containers.iter().filter(|c| c.name == spec.name) {
            if !created_by(container, sandbox_id, owner_id) {
                warn!(
                    "Container {} holds name {} but was not created by this request, leaving it",
                    container.id, spec.name
                );
                continue;
            }
            if let Err(e) =
                teardown_container(self.runtime.as_ref(), &container.id, self.settings.stop_timeout)
                    .await
            {
                error!(
                    "Could not remove container {} after run timeout: {}",
                    container.id, e
                );
            }
        }
    }

    /// Release the image unless a container labelled with this sandbox id still exists
    async fn release_unused_image(&self, sandbox_id: &str, image_ref: &str) {
        match self.runtime.list_managed_containers().await {
            Ok(containers)
                if containers
                    .iter()
                    .any(|c| c.sandbox_id.as_deref() == Some(sandbox_id)) =>
            {
                warn!(
                    "Image {} is still used by a container labelled {}, keeping it",
                    image_ref, sandbox_id
                );
            }
            Ok(_) => {
                release_image(
                    self.runtime.as_ref(),
                    &self.storage,
                    image_ref,
                    sandbox_id,
                    "container start failed",
                )
                .await
            }
            Err(e) => {
                warn!("Could not check containers using image {}: {}", image_ref, e);
                record_orphan(&self.storage, image_ref, sandbox_id, "container start failed")
                    .await;
            }
        }
    }

    async fn roll_back(&self, sandbox_id: &str, runtime_ref: &str, image_ref: &str) {
        warn!("Rolling back sandbox {} after store failure", sandbox_id);

        if let Err(e) =
            teardown_container(self.runtime.as_ref(), runtime_ref, self.settings.stop_timeout)
                .await
        {
            error!(
                "Could not remove container {} during rollback: {}",
                runtime_ref, e
            );
        }
        release_image(
            self.runtime.as_ref(),
            &self.storage,
            image_ref,
            sandbox_id,
            "record could not be stored",
        )
        .await;
    }
}

fn created_by(container: &ManagedContainer, sandbox_id: &str, owner_id: &str) -> bool {
    container.sandbox_id.as_deref() == Some(sandbox_id)
        && container.owner_id.as_deref() == Some(owner_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(sandbox_id: Option<&str>, owner_id: Option<&str>) -> ManagedContainer {
        ManagedContainer {
            id: "c1".to_string(),
            name: container_name_for("k3v9q0za"),
            sandbox_id: sandbox_id.map(str::to_string),
            owner_id: owner_id.map(str::to_string),
            state: "created".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_created_by_requires_both_labels() {
        assert!(created_by(&container(Some("k3v9q0za"), Some("u1")), "k3v9q0za", "u1"));
        assert!(!created_by(&container(Some("k3v9q0za"), Some("u2")), "k3v9q0za", "u1"));
        assert!(!created_by(&container(Some("zzzz0000"), Some("u1")), "k3v9q0za", "u1"));
        assert!(!created_by(&container(None, None), "k3v9q0za", "u1"));
    }
}
