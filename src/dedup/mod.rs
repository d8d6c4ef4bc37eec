//! # Cross-Process Dedup Locks
//!
//! Mutual-exclusion claims against shared storage, keyed by request type and a
//! digest of the payload. Acquisition is a single attempt: contention means
//! another executor already owns this unit of work, not "retry later". The
//! router releases on every exit path, so a crash mid-handler is the only way
//! a claim outlives its execution.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;

use crate::protocol::RequestType;

/// Derive the lock key and token for one work request
///
/// Key shape: `"<request_type>_<sha256(payload)>"`. The hex digest itself is
/// the release token, so only the acquiring execution can release the claim.
pub fn lock_key(request_type: RequestType, payload: &Value) -> (String, String) {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    (format!("{request_type}_{digest}"), digest)
}

/// Named mutual-exclusion claims in shared storage
#[async_trait]
pub trait DedupLockStore: Send + Sync {
    /// Try to claim `key` with `token`. `Ok(false)` means another executor
    /// holds it; there is no waiting.
    async fn acquire(&self, key: &str, token: &str) -> Result<bool, DedupError>;

    /// Release `key` if still held with `token`. `Ok(false)` means the claim
    /// was not ours (or already gone).
    async fn release(&self, key: &str, token: &str) -> Result<bool, DedupError>;
}

/// Postgres-backed lock store shared by all API server processes
pub struct PostgresDedupStore {
    pool: PgPool,
}

impl PostgresDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupLockStore for PostgresDedupStore {
    async fn acquire(&self, key: &str, token: &str) -> Result<bool, DedupError> {
        let result = sqlx::query(
            "INSERT INTO work_intake_locks (lock_key, lock_token, acquired_at) \
             VALUES ($1, $2, now()) ON CONFLICT (lock_key) DO NOTHING",
        )
        .bind(key)
        .bind(token)
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(lock_key = key, acquired, "dedup lock acquire");
        Ok(acquired)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, DedupError> {
        let result =
            sqlx::query("DELETE FROM work_intake_locks WHERE lock_key = $1 AND lock_token = $2")
                .bind(key)
                .bind(token)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// In-memory lock store for tests and single-node deployments
#[derive(Default)]
pub struct InMemoryDedupStore {
    held: DashMap<String, String>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of claims currently held
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[async_trait]
impl DedupLockStore for InMemoryDedupStore {
    async fn acquire(&self, key: &str, token: &str) -> Result<bool, DedupError> {
        match self.held.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(token.to_string());
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, DedupError> {
        Ok(self
            .held
            .remove_if(key, |_, held_token| held_token == token)
            .is_some())
    }
}

/// Lock storage errors
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("lock storage error: {message}")]
    Storage { message: String },
}

impl From<sqlx::Error> for DedupError {
    fn from(err: sqlx::Error) -> Self {
        DedupError::Storage {
            message: err.to_string(),
        }
    }
}
