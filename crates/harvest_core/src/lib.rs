//! Harvest core: OAI-PMH value types and pure run-lifecycle decisions.
mod backoff;
mod event;
mod granularity;
mod lifecycle;
mod network;
mod snapshot;

pub use backoff::{Backoff, RetryDecision, RetryPolicy};
pub use event::{
    truncate_cursor, EventStatus, HarvestingEvent, RecordMetadata, MAX_PERSISTED_CURSOR_CHARS,
};
pub use granularity::{
    format_with_granularity, parse_datestamp, DatestampError, Granularity, DEFAULT_GRANULARITY,
};
pub use lifecycle::{
    finalize_run, plan_run, status_after_event, EventContext, Finalization, PreviousSnapshot,
    RunMode, RunPlan,
};
pub use network::{
    Network, NetworkId, ValidatorRef, DISCOVER_CAPABILITIES, FORCE_FULL_HARVESTING,
};
pub use snapshot::{IndexStatus, Snapshot, SnapshotId, SnapshotStatus, TransitionError};
