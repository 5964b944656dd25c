//! Collaborators of a harvesting run that live outside this crate: the
//! per-snapshot run log and the record prevalidator.

use chrono::{DateTime, Utc};
use harvest_core::{RecordMetadata, SnapshotId, ValidatorRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLogLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogEntry {
    pub snapshot_id: SnapshotId,
    pub level: RunLogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Operator-facing log attached to a snapshot.
#[async_trait::async_trait]
pub trait RunLog: Send + Sync {
    async fn append(&self, entry: RunLogEntry);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("cannot load validator '{name}': {reason}")]
    Load { name: String, reason: String },
    #[error("validation of {identifier} failed: {reason}")]
    Record { identifier: String, reason: String },
}

/// Accept/reject filter applied to every harvested record before it is stored.
pub trait Prevalidator: Send + Sync {
    fn validate(&self, record: &RecordMetadata) -> Result<bool, ValidationError>;
}

pub trait PrevalidatorFactory: Send + Sync {
    fn build(&self, validator: &ValidatorRef) -> Result<Box<dyn Prevalidator>, ValidationError>;
}
