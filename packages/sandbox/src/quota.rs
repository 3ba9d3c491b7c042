// ABOUTME: Per-tenant sandbox quota enforcement
// ABOUTME: Serializes create operations per owner so the count check and the insert cannot interleave

use crate::error::{Result, SandboxError};
use crate::storage::SandboxStorage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Held for the whole of a create; dropping it lets the owner's next create proceed
pub struct QuotaReservation {
    owner_id: String,
    current: usize,
    _guard: OwnedMutexGuard<()>,
}

impl QuotaReservation {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Sandboxes the owner held when the reservation was granted
    pub fn current(&self) -> usize {
        self.current
    }
}

#[derive(Clone)]
pub struct QuotaEnforcer {
    storage: SandboxStorage,
    max_per_tenant: usize,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl QuotaEnforcer {
    pub fn new(storage: SandboxStorage, max_per_tenant: usize) -> Self {
        Self {
            storage,
            max_per_tenant,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn max_per_tenant(&self) -> usize {
        self.max_per_tenant
    }

    /// Wait for the owner's create lock, then check the stored count against the cap.
    ///
    /// Creates from different owners never wait on each other.
    pub async fn check_and_reserve(&self, owner_id: &str) -> Result<QuotaReservation> {
        let lock = self.lock_for(owner_id);
        let guard = lock.lock_owned().await;

        let current = self.storage.count_by_owner(owner_id).await?;
        if current >= self.max_per_tenant {
            info!(
                "Quota exceeded for {}: {}/{}",
                owner_id, current, self.max_per_tenant
            );
            return Err(SandboxError::QuotaExceeded {
                current,
                max: self.max_per_tenant,
            });
        }

        debug!(
            "Quota reserved for {}: {}/{}",
            owner_id, current, self.max_per_tenant
        );
        Ok(QuotaReservation {
            owner_id: owner_id.to_string(),
            current,
            _guard: guard,
        })
    }

    fn lock_for(&self, owner_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Drop locks nobody is holding or waiting on
        locks.retain(|owner, lock| owner == owner_id || Arc::strong_count(lock) > 1);

        locks
            .entry(owner_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn tracked_owners(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
