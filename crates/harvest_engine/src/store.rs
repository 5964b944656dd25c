//! Metadata store seen by the harvesting worker.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use harvest_core::{Network, NetworkId, RecordMetadata, Snapshot, SnapshotId, SnapshotStatus, TransitionError};
use sha2::{Digest, Sha256};

/// Record row as persisted under a snapshot. Deletions are kept as markers so
/// an incremental run can tell "deleted here" from "not seen".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub identifier: String,
    pub datestamp: DateTime<Utc>,
    pub set_specs: Vec<String>,
    pub format: String,
    pub metadata: String,
    /// Hex SHA-256 of `metadata`.
    pub hash: String,
    pub deleted: bool,
}

impl StoredRecord {
    pub fn from_metadata(record: RecordMetadata) -> Self {
        let hash = sha256_hex(&record.metadata);
        Self {
            identifier: record.identifier,
            datestamp: record.datestamp,
            set_specs: record.set_specs,
            format: record.format,
            metadata: record.metadata,
            hash,
            deleted: false,
        }
    }

    pub fn deletion(identifier: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            datestamp: at,
            set_specs: Vec::new(),
            format: String::new(),
            metadata: String::new(),
            hash: String::new(),
            deleted: true,
        }
    }
}

pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),
    #[error("record {identifier} rejected: {reason}")]
    RecordRejected { identifier: String, reason: String },
    #[error("transaction already closed")]
    TransactionClosed,
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persists a new INITIALIZED snapshot with `started_at` as its start time.
    async fn create_snapshot(
        &self,
        network: &Network,
        started_at: DateTime<Utc>,
    ) -> Result<Snapshot, StoreError>;

    async fn load_snapshot(&self, id: SnapshotId) -> Result<Snapshot, StoreError>;

    /// Fails with [`StoreError::Transition`] when the stored snapshot is
    /// terminal and `snapshot` carries a different status.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Out-of-band status change; refused when it would reopen a terminal snapshot.
    async fn force_status(
        &self,
        id: SnapshotId,
        status: SnapshotStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Most recent HARVESTING_FINISHED_VALID snapshot of the network.
    async fn find_last_good_known_snapshot(
        &self,
        network_id: NetworkId,
    ) -> Result<Option<Snapshot>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Copies every non-deleted record of `from` whose identifier `to` does not
    /// hold yet. Returns the number of records copied.
    async fn copy_forward_records(&self, from: SnapshotId, to: SnapshotId) -> Result<u64, StoreError>;

    /// Non-deleted records held by the snapshot.
    async fn count_records(&self, id: SnapshotId) -> Result<u64, StoreError>;
}

/// Unit of work for one event. Dropping it without `commit` discards it.
#[async_trait::async_trait]
pub trait StoreTransaction: Send {
    /// Returns `true` when the identifier was not yet present in the snapshot.
    async fn upsert_record(
        &mut self,
        snapshot_id: SnapshotId,
        record: StoredRecord,
    ) -> Result<bool, StoreError>;

    async fn mark_deleted(
        &mut self,
        snapshot_id: SnapshotId,
        identifier: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// All or nothing; a snapshot write refused as in
    /// [`SnapshotStore::save_snapshot`] fails the whole commit.
    async fn commit(&mut self) -> Result<(), StoreError>;
}
