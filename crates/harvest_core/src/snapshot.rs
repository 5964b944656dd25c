use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::truncate_cursor;
use crate::network::NetworkId;

pub type SnapshotId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    #[default]
    Initialized,
    Harvesting,
    Retrying,
    HarvestingFinishedValid,
    HarvestingFinishedError,
    HarvestingStopped,
}

impl SnapshotStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SnapshotStatus::HarvestingFinishedValid
                | SnapshotStatus::HarvestingFinishedError
                | SnapshotStatus::HarvestingStopped
        )
    }

    pub fn is_error(&self) -> bool {
        *self == SnapshotStatus::HarvestingFinishedError
    }

    /// Re-asserting the current status is always allowed; leaving a terminal
    /// status or returning to `Initialized` never is.
    pub fn can_transition_to(&self, next: SnapshotStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() || next == SnapshotStatus::Initialized {
            return false;
        }
        true
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Initialized => "INITIALIZED",
            SnapshotStatus::Harvesting => "HARVESTING",
            SnapshotStatus::Retrying => "RETRYING",
            SnapshotStatus::HarvestingFinishedValid => "HARVESTING_FINISHED_VALID",
            SnapshotStatus::HarvestingFinishedError => "HARVESTING_FINISHED_ERROR",
            SnapshotStatus::HarvestingStopped => "HARVESTING_STOPPED",
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    #[default]
    Untouched,
    Indexed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("snapshot {snapshot_id}: illegal status transition {from} -> {to}")]
pub struct TransitionError {
    pub snapshot_id: SnapshotId,
    pub from: SnapshotStatus,
    pub to: SnapshotStatus,
}

/// Persisted state of one harvesting run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub network_id: NetworkId,
    status: SnapshotStatus,
    pub index_status: IndexStatus,
    /// Records created in this snapshot (deletion markers excluded).
    pub size: u64,
    pub valid_size: u64,
    pub transformed_size: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_incremental_time: Option<DateTime<Utc>>,
    pub previous_snapshot_id: Option<SnapshotId>,
    resumption_token: Option<String>,
}

impl Snapshot {
    pub fn new(id: SnapshotId, network_id: NetworkId, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            network_id,
            status: SnapshotStatus::Initialized,
            index_status: IndexStatus::Untouched,
            size: 0,
            valid_size: 0,
            transformed_size: 0,
            start_time,
            end_time: None,
            last_incremental_time: None,
            previous_snapshot_id: None,
            resumption_token: None,
        }
    }

    pub fn status(&self) -> SnapshotStatus {
        self.status
    }

    pub fn transition(&mut self, next: SnapshotStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                snapshot_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.end_time = Some(at);
    }

    pub fn resumption_token(&self) -> Option<&str> {
        self.resumption_token.as_deref()
    }

    /// Stores the cursor truncated to what the metadata store accepts.
    pub fn set_resumption_token(&mut self, token: Option<&str>) {
        self.resumption_token = token.map(|t| truncate_cursor(t).to_string());
    }
}
