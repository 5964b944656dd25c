//! Pure decisions behind one harvesting run. The engine applies them against
//! the metadata store; nothing here performs IO.

use chrono::{DateTime, Utc};

use crate::event::EventStatus;
use crate::granularity::format_with_granularity;
use crate::snapshot::{SnapshotId, SnapshotStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    Incremental,
}

impl RunMode {
    pub fn is_incremental(&self) -> bool {
        *self == RunMode::Incremental
    }
}

/// Last successfully completed snapshot of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviousSnapshot {
    pub id: SnapshotId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub mode: RunMode,
    pub previous: Option<PreviousSnapshot>,
    pub from: Option<String>,
}

/// Incremental only when requested, not overridden, and a good snapshot exists.
/// Anything else is a full run with no `from`.
pub fn plan_run(
    incremental_requested: bool,
    force_full: bool,
    last_good: Option<PreviousSnapshot>,
    granularity: &str,
) -> RunPlan {
    match last_good {
        Some(previous) if incremental_requested && !force_full => RunPlan {
            mode: RunMode::Incremental,
            from: Some(format_with_granularity(&previous.started_at, granularity)),
            previous: Some(previous),
        },
        _ => RunPlan {
            mode: RunMode::Full,
            previous: None,
            from: None,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    pub mode: RunMode,
    pub by_set: bool,
    /// Records persisted so far in this run.
    pub records_so_far: u64,
}

/// Snapshot status an event moves the run to; `None` leaves it unchanged.
pub fn status_after_event(status: EventStatus, ctx: &EventContext) -> Option<SnapshotStatus> {
    match status {
        EventStatus::Ok => Some(SnapshotStatus::Harvesting),
        EventStatus::NoMatchingQuery if ctx.by_set => None,
        EventStatus::NoMatchingQuery => Some(match ctx.mode {
            RunMode::Incremental => SnapshotStatus::HarvestingFinishedValid,
            RunMode::Full => SnapshotStatus::HarvestingFinishedError,
        }),
        EventStatus::ErrorRetry => Some(SnapshotStatus::Retrying),
        EventStatus::ErrorFatal => Some(SnapshotStatus::HarvestingFinishedError),
        EventStatus::StopSignalReceived => Some(if ctx.records_so_far > 0 {
            SnapshotStatus::HarvestingFinishedValid
        } else {
            SnapshotStatus::HarvestingFinishedError
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    /// Full run that produced nothing.
    NoRecords,
    /// An error was already recorded; leave it.
    AlreadyFailed,
    /// Mark valid, carrying forward from `carry_forward_from` first when set.
    Complete {
        carry_forward_from: Option<SnapshotId>,
    },
}

pub fn finalize_run(
    current: SnapshotStatus,
    mode: RunMode,
    records: u64,
    previous: Option<SnapshotId>,
) -> Finalization {
    if records == 0 && !mode.is_incremental() {
        return Finalization::NoRecords;
    }
    if current.is_error() {
        return Finalization::AlreadyFailed;
    }
    Finalization::Complete {
        carry_forward_from: previous.filter(|_| mode.is_incremental()),
    }
}
