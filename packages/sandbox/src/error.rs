// ABOUTME: Error taxonomy surfaced by sandbox create, list and delete operations
// ABOUTME: Wraps template, storage and runtime failures with the stage that failed

use crate::runtime::RuntimeError;
use crate::storage::StorageError;
use crate::template::TemplateError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox limit reached ({current}/{max})")]
    QuotaExceeded { current: usize, max: usize },

    #[error("Image build failed: {0}")]
    BuildFailed(String),

    #[error("Container start failed: {0}")]
    RunFailed(String),

    #[error("Duplicate sandbox id: {0}")]
    InternalDuplicate(String),

    #[error("Sandbox not found: {0}")]
    NotFoundOrNotOwned(String),

    #[error("Container teardown failed: {0}")]
    TeardownFailed(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    /// Short message safe to show to the requesting tenant
    pub fn user_message(&self) -> String {
        match self {
            SandboxError::QuotaExceeded { max, .. } => format!(
                "You already have the maximum of {} sandboxes. Delete one before creating another.",
                max
            ),
            SandboxError::BuildFailed(cause) => {
                format!("Could not build your sandbox image ({}). Please try again.", cause)
            }
            SandboxError::RunFailed(cause) => {
                format!("Could not start your sandbox ({}). Please try again.", cause)
            }
            SandboxError::NotFoundOrNotOwned(id) => {
                format!("No sandbox with id {} was found on your account.", id)
            }
            SandboxError::TeardownFailed(cause) => format!(
                "Could not stop your sandbox ({}). It has been kept; please retry the delete.",
                cause
            ),
            SandboxError::InternalDuplicate(_)
            | SandboxError::Template(_)
            | SandboxError::Storage(_)
            | SandboxError::Runtime(_)
            | SandboxError::Io(_) => {
                "An internal error occurred. Please contact an administrator.".to_string()
            }
        }
    }

    /// Whether repeating the same request may succeed without user action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::BuildFailed(_)
                | SandboxError::RunFailed(_)
                | SandboxError::TeardownFailed(_)
        )
    }
}
