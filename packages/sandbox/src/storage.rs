// ABOUTME: Durable state store for sandbox ownership records and orphaned images
// ABOUTME: Provides atomic add/get/list/remove over SQLite with global sandbox id uniqueness

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Sandbox id already exists: {0}")]
    DuplicateId(String),
    #[error("Sandbox not found: {0}")]
    NotFound(String),
    #[error("Invalid timestamp {value}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One provisioned environment owned by a tenant
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    pub sandbox_id: String,
    pub owner_id: String,
    /// Runtime handle of the backing container
    pub runtime_ref: String,
    /// Image the container was started from
    pub image_ref: String,
    pub login_user: String,
    #[serde(skip_serializing)]
    pub login_secret: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("sandbox_id", &self.sandbox_id)
            .field("owner_id", &self.owner_id)
            .field("runtime_ref", &self.runtime_ref)
            .field("image_ref", &self.image_ref)
            .field("login_user", &self.login_user)
            .field("login_secret", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Image whose removal failed and that is awaiting reclamation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedImage {
    pub image_ref: String,
    pub sandbox_id: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// SQLite-backed store; every mutation is a single atomic statement.
#[derive(Clone)]
pub struct SandboxStorage {
    pool: SqlitePool,
}

impl SandboxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // SANDBOX OPERATIONS
    // ========================================================================

    /// Persist a new sandbox. Fails with `DuplicateId` rather than overwriting.
    pub async fn add_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO sandboxes (
                sandbox_id, owner_id, runtime_ref, image_ref,
                login_user, login_secret, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&sandbox.sandbox_id)
        .bind(&sandbox.owner_id)
        .bind(&sandbox.runtime_ref)
        .bind(&sandbox.image_ref)
        .bind(&sandbox.login_user)
        .bind(&sandbox.login_secret)
        .bind(sandbox.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateId(sandbox.sandbox_id.clone()))
            }
            Err(e) => Err(StorageError::Database(e)),
        }
    }

    pub async fn get_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        let row = sqlx::query(
            r#"
            SELECT sandbox_id, owner_id, runtime_ref, image_ref,
                   login_user, login_secret, created_at
            FROM sandboxes
            WHERE sandbox_id = ?1
            "#,
        )
        .bind(sandbox_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_sandbox(row),
            None => Err(StorageError::NotFound(sandbox_id.to_string())),
        }
    }

    pub async fn sandbox_exists(&self, sandbox_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sandboxes WHERE sandbox_id = ?1")
            .bind(sandbox_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// All sandboxes of `owner_id` in creation order
    pub async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(
            r#"
            SELECT sandbox_id, owner_id, runtime_ref, image_ref,
                   login_user, login_secret, created_at
            FROM sandboxes
            WHERE owner_id = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_sandbox).collect()
    }

    /// Every sandbox in the store, in creation order
    pub async fn list_all(&self) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(
            r#"
            SELECT sandbox_id, owner_id, runtime_ref, image_ref,
                   login_user, login_secret, created_at
            FROM sandboxes
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_sandbox).collect()
    }

    pub async fn count_by_owner(&self, owner_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sandboxes WHERE owner_id = ?1")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn remove_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sandboxes WHERE sandbox_id = ?1")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(sandbox_id.to_string()));
        }

        Ok(())
    }

    // ========================================================================
    // ORPHANED IMAGE LEDGER
    // ========================================================================

    /// Record an image that still needs removing; re-recording updates the reason
    pub async fn record_orphaned_image(
        &self,
        image_ref: &str,
        sandbox_id: &str,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orphaned_images (image_ref, sandbox_id, reason, recorded_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (image_ref) DO UPDATE SET
                reason = excluded.reason,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(image_ref)
        .bind(sandbox_id)
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_orphaned_images(&self) -> Result<Vec<OrphanedImage>> {
        let rows = sqlx::query(
            r#"
            SELECT image_ref, sandbox_id, reason, recorded_at
            FROM orphaned_images
            ORDER BY recorded_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let recorded_at: String = row.get("recorded_at");
                Ok(OrphanedImage {
                    image_ref: row.get("image_ref"),
                    sandbox_id: row.get("sandbox_id"),
                    reason: row.get("reason"),
                    recorded_at: parse_timestamp(&recorded_at)?,
                })
            })
            .collect()
    }

    /// Forget an orphaned image once it has been reclaimed; absent entries are ignored
    pub async fn remove_orphaned_image(&self, image_ref: &str) -> Result<()> {
        sqlx::query("DELETE FROM orphaned_images WHERE image_ref = ?1")
            .bind(image_ref)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn row_to_sandbox(row: sqlx::sqlite::SqliteRow) -> Result<Sandbox> {
    let created_at: String = row.get("created_at");

    Ok(Sandbox {
        sandbox_id: row.get("sandbox_id"),
        owner_id: row.get("owner_id"),
        runtime_ref: row.get("runtime_ref"),
        image_ref: row.get("image_ref"),
        login_user: row.get("login_user"),
        login_secret: row.get("login_secret"),
        created_at: parse_timestamp(&created_at)?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_storage() -> SandboxStorage {
        let pool = chunkhost_storage::in_memory()
            .await
            .expect("Failed to create in-memory database");
        SandboxStorage::new(pool)
    }

    fn sandbox(sandbox_id: &str, owner_id: &str) -> Sandbox {
        Sandbox {
            sandbox_id: sandbox_id.to_string(),
            owner_id: owner_id.to_string(),
            runtime_ref: format!("container-{}", sandbox_id),
            image_ref: format!("chunkhost_image_{}", sandbox_id),
            login_user: "user1234".to_string(),
            login_secret: "Secret123456".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_add_and_get_sandbox() {
        let storage = setup_storage().await;
        let record = sandbox("aaaa1111", "u1");

        storage.add_sandbox(&record).await.unwrap();

        let fetched = storage.get_sandbox("aaaa1111").await.unwrap();
        assert_eq!(fetched.owner_id, "u1");
        assert_eq!(fetched.runtime_ref, "container-aaaa1111");
        assert_eq!(fetched.login_secret, "Secret123456");
        assert_eq!(
            fetched.created_at.timestamp_micros(),
            record.created_at.timestamp_micros()
        );
        assert!(storage.sandbox_exists("aaaa1111").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_id_does_not_overwrite() {
        let storage = setup_storage().await;
        storage.add_sandbox(&sandbox("dup00001", "u1")).await.unwrap();

        let mut intruder = sandbox("dup00001", "u2");
        intruder.runtime_ref = "other-container".to_string();
        let result = storage.add_sandbox(&intruder).await;

        assert!(matches!(result, Err(StorageError::DuplicateId(id)) if id == "dup00001"));
        let kept = storage.get_sandbox("dup00001").await.unwrap();
        assert_eq!(kept.owner_id, "u1");
        assert_eq!(kept.runtime_ref, "container-dup00001");
    }

    #[tokio::test]
    async fn test_list_by_owner_in_creation_order() {
        let storage = setup_storage().await;
        for (id, owner) in [("zzzz0001", "u1"), ("aaaa0002", "u2"), ("mmmm0003", "u1")] {
            storage.add_sandbox(&sandbox(id, owner)).await.unwrap();
        }

        let ids: Vec<String> = storage
            .list_by_owner("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.sandbox_id)
            .collect();
        assert_eq!(ids, vec!["zzzz0001", "mmmm0003"]);
        assert_eq!(storage.count_by_owner("u1").await.unwrap(), 2);
        assert_eq!(storage.count_by_owner("nobody").await.unwrap(), 0);
        assert_eq!(storage.list_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_get_and_remove_missing() {
        let storage = setup_storage().await;

        assert!(matches!(
            storage.get_sandbox("missing1").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.remove_sandbox("missing1").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_sandbox() {
        let storage = setup_storage().await;
        storage.add_sandbox(&sandbox("gone0001", "u1")).await.unwrap();

        storage.remove_sandbox("gone0001").await.unwrap();

        assert!(!storage.sandbox_exists("gone0001").await.unwrap());
        assert!(storage.list_by_owner("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_image_ledger() {
        let storage = setup_storage().await;

        storage
            .record_orphaned_image("chunkhost_image_a", "a", "run failed")
            .await
            .unwrap();
        storage
            .record_orphaned_image("chunkhost_image_a", "a", "retry failed")
            .await
            .unwrap();

        let images = storage.list_orphaned_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].reason, "retry failed");

        storage
            .remove_orphaned_image("chunkhost_image_a")
            .await
            .unwrap();
        assert!(storage.list_orphaned_images().await.unwrap().is_empty());
    }

    #[test]
    fn test_debug_redacts_login_secret() {
        let record = sandbox("dbg00001", "u1");
        assert!(!format!("{:?}", record).contains("Secret123456"));
    }
}
