// ABOUTME: ChunkHost sandbox provisioning engine
// ABOUTME: Creates, lists and deletes per-tenant container sandboxes under a per-tenant quota

pub mod credentials;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod monitor;
pub mod provisioner;
pub mod quota;
pub mod runtime;
pub mod settings;
pub mod storage;
pub mod template;

pub use credentials::{IdentitySource, RandomIdentities, SandboxIdentity};
pub use error::{Result, SandboxError};
pub use lifecycle::LifecycleManager;
pub use manager::{CleanupReport, ReclaimReport, SandboxListing, SandboxManager};
pub use monitor::{AbuseFlag, AbuseMonitor};
pub use provisioner::{ProvisioningEngine, SandboxSummary};
pub use quota::{QuotaEnforcer, QuotaReservation};
pub use runtime::{ContainerRuntime, DockerRuntime, ManagedContainer, RunSpec, RuntimeError};
pub use settings::{ConfigError, SandboxSettings};
pub use storage::{OrphanedImage, Sandbox, SandboxStorage, StorageError};
pub use template::{HardwareProfile, TemplateError, TemplateParams};
