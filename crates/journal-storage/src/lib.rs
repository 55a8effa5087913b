//! Target store contract for the normalized journal schema, plus its Postgres and in-memory backends.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use journal_core::{LookupCategory, LookupRecord, NewChange, NewLetter, NewUser};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryTargetStore;
pub use postgres::PgTargetStore;

/// Name of the single run marker guarding concurrent migrations.
pub const RUN_MARKER_NAME: &str = "legacy-migration";

/// Entity types addressable by the generic count/delete operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetEntity {
    Users,
    Letters,
    Changes,
    Lookup(LookupCategory),
}

impl fmt::Display for TargetEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetEntity::Users => f.write_str("users"),
            TargetEntity::Letters => f.write_str("letters"),
            TargetEntity::Changes => f.write_str("changes"),
            TargetEntity::Lookup(category) => write!(f, "{category}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Schema(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} with {field} = {value:?} already exists")]
    Duplicate {
        entity: TargetEntity,
        field: &'static str,
        value: String,
    },
    #[error("{entity}.{field} references missing id {id}")]
    MissingReference {
        entity: TargetEntity,
        field: &'static str,
        id: i64,
    },
    #[error("migration run {run_id} has held the run marker since {started_at}")]
    RunInProgress {
        run_id: Uuid,
        started_at: DateTime<Utc>,
    },
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Create / find / delete operations the migration needs from the normalized target.
///
/// Implementations never create roles: the authenticated role is a prerequisite of the target.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn count(&self, entity: TargetEntity) -> Result<u64, StoreError>;

    /// Deletes every row of `entity`, returning the number removed.
    async fn delete_all(&self, entity: TargetEntity) -> Result<u64, StoreError>;

    async fn find_role_id(&self, role_type: &str) -> Result<Option<i64>, StoreError>;

    /// `(username, id)` for every user already in the target.
    async fn existing_users(&self) -> Result<Vec<(String, i64)>, StoreError>;

    async fn create_user(&self, user: &NewUser) -> Result<i64, StoreError>;

    /// Natural keys already present for `category`.
    async fn lookup_keys(&self, category: LookupCategory) -> Result<Vec<String>, StoreError>;

    async fn create_lookup(&self, record: &LookupRecord) -> Result<i64, StoreError>;

    async fn create_letter(&self, letter: &NewLetter) -> Result<i64, StoreError>;

    async fn create_change(&self, change: &NewChange) -> Result<i64, StoreError>;

    /// Claims the run marker; fails with [`StoreError::RunInProgress`] when another run holds it.
    async fn acquire_run_marker(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Releases the marker if `run_id` still holds it.
    async fn release_run_marker(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Removes whatever marker is present. Returns whether one existed.
    async fn clear_run_marker(&self) -> Result<bool, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file's contents, used to identify which legacy store a report came from.
pub async fn fingerprint_file(path: &Path) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {} for fingerprint", path.display()))?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn file_fingerprint_matches_content_hash() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.db");
        tokio::fs::write(&path, b"hello world").await.expect("write");

        let fingerprint = fingerprint_file(&path).await.expect("fingerprint");
        assert_eq!(fingerprint, sha256_hex(b"hello world"));

        let missing = fingerprint_file(&dir.path().join("absent.db")).await;
        assert!(missing.is_err());
    }

    #[test]
    fn entity_names_render_for_messages() {
        assert_eq!(TargetEntity::Letters.to_string(), "letters");
        assert_eq!(
            TargetEntity::Lookup(LookupCategory::HelpTypes).to_string(),
            "help-types"
        );
    }
}
