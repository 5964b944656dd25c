//! Orchestrates one harvesting run of one network: plans full vs incremental,
//! drives the harvester over the network's sets, turns every page event into a
//! store transaction and settles the snapshot once the harvester is done.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvest_core::{
    finalize_run, plan_run, status_after_event, EventContext, EventStatus, Finalization,
    Granularity, HarvestingEvent, Network, PreviousSnapshot, RecordMetadata, RetryPolicy,
    RunPlan, Snapshot, SnapshotId, SnapshotStatus, DEFAULT_GRANULARITY,
};
use harvest_logging::{harvest_debug, harvest_error, harvest_info, harvest_warn};
use tokio_util::sync::CancellationToken;

use crate::engine::WorkerHandle;
use crate::harvester::{HarvestListener, HarvestRequest, Harvester, ListenerError};
use crate::services::{Prevalidator, PrevalidatorFactory, RunLog, RunLogEntry, RunLogLevel};
use crate::store::{SnapshotStore, StoreError, StoreTransaction, StoredRecord};

pub const INITIALIZING: &str = "Initializing...";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Harvest incrementally when a previous good snapshot allows it.
    pub incremental: bool,
    pub retry: RetryPolicy,
    /// Grace period between `stop()` and aborting the run's task.
    pub settle_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            incremental: false,
            retry: RetryPolicy::default(),
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// Run progress readable from outside the running task.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    snapshot_id: Mutex<Option<SnapshotId>>,
    records: AtomicU64,
}

impl Progress {
    fn start(&self, snapshot_id: SnapshotId) {
        *self.snapshot_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot_id);
        self.records.store(0, Ordering::Relaxed);
    }

    fn set_records(&self, records: u64) {
        self.records.store(records, Ordering::Relaxed);
    }

    pub(crate) fn snapshot_id(&self) -> Option<SnapshotId> {
        *self.snapshot_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn status(&self) -> String {
        match self.snapshot_id() {
            None => INITIALIZING.to_string(),
            Some(_) => format!("Harvested {} records", self.records.load(Ordering::Relaxed)),
        }
    }
}

/// Writes to the snapshot's run log and the process log.
#[derive(Clone)]
pub(crate) struct SnapshotLog {
    run_log: Arc<dyn RunLog>,
    snapshot_id: SnapshotId,
}

impl SnapshotLog {
    pub(crate) fn new(run_log: Arc<dyn RunLog>, snapshot_id: SnapshotId) -> Self {
        Self {
            run_log,
            snapshot_id,
        }
    }

    pub(crate) async fn info(&self, message: impl Into<String>) {
        let message = message.into();
        harvest_info!(snapshot = self.snapshot_id; "{message}");
        self.append(RunLogLevel::Info, message).await;
    }

    pub(crate) async fn error(&self, message: impl Into<String>) {
        let message = message.into();
        harvest_error!(snapshot = self.snapshot_id; "{message}");
        self.append(RunLogLevel::Error, message).await;
    }

    async fn append(&self, level: RunLogLevel, message: String) {
        self.run_log
            .append(RunLogEntry {
                snapshot_id: self.snapshot_id,
                level,
                message,
                at: Utc::now(),
            })
            .await;
    }
}

struct RunState {
    snapshot: Snapshot,
    plan: RunPlan,
    prevalidator: Option<Box<dyn Prevalidator>>,
    by_set: bool,
    current_set: Option<String>,
    /// Set when an event could not be recorded; the run ends in error.
    aborted: Option<String>,
    log: SnapshotLog,
}

impl RunState {
    /// True once no further set should be harvested.
    async fn concluded(&self) -> bool {
        if let Some(reason) = self.aborted.as_deref() {
            self.log
                .info(format!("Remaining sets are skipped after: {reason}"))
                .await;
            return true;
        }
        let status = self.snapshot.status();
        if status.is_terminal() {
            self.log
                .info(format!("Snapshot is {status}, remaining sets are skipped"))
                .await;
            return true;
        }
        false
    }

    async fn apply_status(&self, snapshot: &mut Snapshot, next: SnapshotStatus) {
        let from = snapshot.status();
        if from == next {
            return;
        }
        match snapshot.transition(next) {
            Ok(()) => self.log.info(format!("Status: {from} -> {next}")).await,
            Err(err) => self.log.error(err.to_string()).await,
        }
    }

    async fn accepts(&self, record: &RecordMetadata) -> bool {
        let Some(validator) = self.prevalidator.as_ref() else {
            return true;
        };
        match validator.validate(record) {
            Ok(true) => true,
            Ok(false) => {
                harvest_debug!(
                    snapshot = self.log.snapshot_id;
                    "Record {} rejected by prevalidation",
                    record.identifier
                );
                false
            }
            Err(err) => {
                self.log
                    .error(format!("Error prevalidating record {}: {err}", record.identifier))
                    .await;
                false
            }
        }
    }

    async fn persist_page(
        &self,
        tx: &mut dyn StoreTransaction,
        snapshot: &mut Snapshot,
        event: &mut HarvestingEvent,
        now: DateTime<Utc>,
    ) {
        if event.is_record_missing() {
            let missing: Vec<&str> = event.missing_identifiers().iter().map(String::as_str).collect();
            self.log
                .error(format!(
                    "Some record metadata is missing (resumption token: {}): {}",
                    event.resumption_token().unwrap_or("-"),
                    missing.join(", ")
                ))
                .await;
        }

        if self.plan.mode.is_incremental() {
            for identifier in event.deleted_identifiers() {
                if let Err(err) = tx.mark_deleted(snapshot.id, identifier, now).await {
                    self.log
                        .error(format!("Error deleting record {identifier}: {err}"))
                        .await;
                }
            }
        }

        let mut created = 0u64;
        for record in event.take_records() {
            if !self.accepts(&record).await {
                continue;
            }
            let identifier = record.identifier.clone();
            match tx
                .upsert_record(snapshot.id, StoredRecord::from_metadata(record))
                .await
            {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(err) => {
                    self.log
                        .error(format!("Error persisting record {identifier}: {err}"))
                        .await;
                }
            }
        }

        snapshot.size += created;
        snapshot.set_resumption_token(event.resumption_token());
        harvest_debug!(
            snapshot = snapshot.id;
            "{created} new records, {} deleted",
            event.deleted_identifiers().len()
        );
    }

    async fn log_event(&self, event: &HarvestingEvent) {
        let detail = event.message.as_deref().unwrap_or("no detail");
        match event.status {
            EventStatus::Ok => {}
            EventStatus::NoMatchingQuery if self.by_set => {
                let set = self.current_set.as_deref().unwrap_or("-");
                self.log.info(format!("No records match set {set}")).await;
            }
            EventStatus::NoMatchingQuery if self.plan.mode.is_incremental() => {
                self.log.info("No new records since the previous harvesting").await;
            }
            EventStatus::NoMatchingQuery => self.log.error("No records match the query").await,
            EventStatus::ErrorRetry => self.log.error(format!("Retrying: {detail}")).await,
            EventStatus::ErrorFatal => {
                self.log.error(format!("Harvesting failed: {detail}")).await;
            }
            EventStatus::StopSignalReceived => {
                self.log.info("Stop signal received, harvesting is stopping").await;
            }
        }
    }
}

pub struct HarvestingWorker {
    network: Network,
    settings: WorkerSettings,
    pub(crate) harvester: Arc<dyn Harvester>,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) run_log: Arc<dyn RunLog>,
    validators: Option<Arc<dyn PrevalidatorFactory>>,
    pub(crate) progress: Arc<Progress>,
    /// Raised by [`WorkerHandle::stop`]; outlives the harvester's own signal,
    /// which `reset()` clears.
    pub(crate) stop: CancellationToken,
    run: Option<RunState>,
}

impl HarvestingWorker {
    pub fn new(
        network: Network,
        harvester: Arc<dyn Harvester>,
        store: Arc<dyn SnapshotStore>,
        run_log: Arc<dyn RunLog>,
    ) -> Self {
        Self {
            network,
            settings: WorkerSettings::default(),
            harvester,
            store,
            run_log,
            validators: None,
            progress: Arc::new(Progress::default()),
            stop: CancellationToken::new(),
            run: None,
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_prevalidation(mut self, validators: Arc<dyn PrevalidatorFactory>) -> Self {
        self.validators = Some(validators);
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn status(&self) -> String {
        self.progress.status()
    }

    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        self.progress.snapshot_id()
    }

    /// Runs on the current tokio runtime; see [`WorkerHandle`].
    pub fn spawn(self) -> WorkerHandle {
        WorkerHandle::spawn(self)
    }

    /// Performs one complete run and returns the final snapshot status.
    pub async fn run(&mut self) -> Result<SnapshotStatus, StoreError> {
        let (granularity, note) = self.discover_granularity().await;
        let snapshot = self.store.create_snapshot(&self.network, Utc::now()).await?;
        self.progress.start(snapshot.id);
        let log = SnapshotLog::new(Arc::clone(&self.run_log), snapshot.id);
        log.info(format!("Harvesting {}", self.network)).await;
        log.info(note).await;

        let outcome = self.execute(snapshot, &granularity, log.clone()).await;
        if let Err(err) = &outcome {
            log.error(format!("Harvesting aborted: {err}")).await;
            self.mark_failed().await;
        }
        self.run = None;
        outcome
    }

    async fn discover_granularity(&self) -> (String, String) {
        if !self.network.discover_capabilities() {
            return (
                DEFAULT_GRANULARITY.to_string(),
                format!("Using default granularity {DEFAULT_GRANULARITY}"),
            );
        }
        let identity = tokio::select! {
            identity = self.harvester.identify(&self.network.origin_url) => identity,
            _ = self.stop.cancelled() => {
                return (
                    DEFAULT_GRANULARITY.to_string(),
                    format!("Stop requested during Identify, using default granularity {DEFAULT_GRANULARITY}"),
                );
            }
        };
        match identity {
            Ok(identity) => match identity.granularity.as_deref().and_then(Granularity::parse) {
                Some(granularity) => (
                    granularity.as_str().to_string(),
                    format!(
                        "Using granularity {} reported by {}",
                        granularity.as_str(),
                        identity.repository_name
                    ),
                ),
                None => (
                    DEFAULT_GRANULARITY.to_string(),
                    format!(
                        "Repository reported no usable granularity, using default {DEFAULT_GRANULARITY}"
                    ),
                ),
            },
            Err(err) => {
                harvest_warn!("Identify failed for {}: {err}", self.network.origin_url);
                (
                    DEFAULT_GRANULARITY.to_string(),
                    format!("Identify failed ({err}), using default granularity {DEFAULT_GRANULARITY}"),
                )
            }
        }
    }

    async fn execute(
        &mut self,
        mut snapshot: Snapshot,
        granularity: &str,
        log: SnapshotLog,
    ) -> Result<SnapshotStatus, StoreError> {
        let force_full = self.network.force_full_harvesting();
        let last_good = if self.settings.incremental && !force_full {
            self.store
                .find_last_good_known_snapshot(self.network.id)
                .await?
                .map(|previous| PreviousSnapshot {
                    id: previous.id,
                    started_at: previous.start_time,
                })
        } else {
            None
        };
        let plan = plan_run(self.settings.incremental, force_full, last_good, granularity);
        match (&plan.previous, &plan.from) {
            (Some(previous), Some(from)) => {
                log.info(format!(
                    "Incremental harvesting from {from} (previous snapshot {})",
                    previous.id
                ))
                .await;
            }
            _ => {
                if self.settings.incremental {
                    harvest_debug!(snapshot = snapshot.id; "Incremental harvesting not possible");
                }
                log.info("Full harvesting").await;
            }
        }

        let prevalidator = self.load_prevalidator(&log).await;

        snapshot.transition(SnapshotStatus::Harvesting)?;
        let snapshot = save_or_reload(self.store.as_ref(), &log, snapshot).await?;
        if snapshot.status().is_terminal() {
            self.progress.set_records(snapshot.size);
            return Ok(snapshot.status());
        }
        log.info(format!(
            "Status: {} -> {}",
            SnapshotStatus::Initialized,
            SnapshotStatus::Harvesting
        ))
        .await;

        self.run = Some(RunState {
            snapshot,
            plan,
            prevalidator,
            by_set: self.network.harvests_by_set(),
            current_set: None,
            aborted: None,
            log,
        });
        self.harvester.reset();
        if self.stop.is_cancelled() {
            self.harvester.stop();
        }
        self.harvest_all().await;
        self.finalize().await
    }

    async fn load_prevalidator(&self, log: &SnapshotLog) -> Option<Box<dyn Prevalidator>> {
        let model = self.network.prevalidator.as_ref()?;
        let Some(factory) = self.validators.as_ref() else {
            log.error(format!(
                "Prevalidator {} configured but no validation service is available, records will not be filtered",
                model.name
            ))
            .await;
            return None;
        };
        match factory.build(model) {
            Ok(validator) => {
                log.info(format!(
                    "Prevalidator {} loaded, harvested records will be filtered",
                    model.name
                ))
                .await;
                Some(validator)
            }
            Err(err) => {
                log.error(format!(
                    "Error loading prevalidator {}: {err}, records will not be filtered",
                    model.name
                ))
                .await;
                None
            }
        }
    }

    async fn harvest_all(&mut self) {
        let harvester = Arc::clone(&self.harvester);
        let sets: Vec<Option<String>> = if self.network.harvests_by_set() {
            self.network.sets.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        };

        for set in sets {
            let Some(run) = self.run.as_ref() else {
                return;
            };
            if run.concluded().await {
                break;
            }
            if self.stop.is_cancelled() {
                let event = HarvestingEvent::new(
                    EventStatus::StopSignalReceived,
                    self.network.origin_url.clone(),
                    self.network.metadata_prefix.clone(),
                );
                if let Err(err) = self.on_event(event).await {
                    harvest_error!("{err}");
                }
                break;
            }

            let Some(run) = self.run.as_mut() else {
                return;
            };
            if let Some(spec) = set.as_deref() {
                run.log.info(format!("Harvesting set {spec}")).await;
            }
            run.current_set = set.clone();

            let request = HarvestRequest {
                origin_url: self.network.origin_url.clone(),
                set,
                metadata_prefix: self.network.metadata_prefix.clone(),
                storage_schema: self.network.metadata_store_schema.clone(),
                from: run.plan.from.clone(),
                until: None,
                resumption_token: None,
                max_retries: self.settings.retry.max_retries,
            };
            harvester.harvest(&request, self).await;
        }
    }

    async fn finalize(&mut self) -> Result<SnapshotStatus, StoreError> {
        let store = Arc::clone(&self.store);
        let Some(run) = self.run.as_mut() else {
            return Err(StoreError::Backend("no run in progress".to_string()));
        };
        let mut snapshot = run.snapshot.clone();

        let finalization = match run.aborted.as_deref() {
            Some(reason) => {
                run.log.error(format!("Harvesting aborted: {reason}")).await;
                Finalization::AlreadyFailed
            }
            None => finalize_run(
                snapshot.status(),
                run.plan.mode,
                snapshot.size,
                run.plan.previous.map(|previous| previous.id),
            ),
        };

        match finalization {
            Finalization::NoRecords => {
                run.log.error("No records harvested").await;
                run.apply_status(&mut snapshot, SnapshotStatus::HarvestingFinishedError)
                    .await;
            }
            Finalization::AlreadyFailed => {
                run.log.error("Harvesting ended with errors").await;
                run.apply_status(&mut snapshot, SnapshotStatus::HarvestingFinishedError)
                    .await;
            }
            Finalization::Complete { carry_forward_from } => {
                if let (Some(from), Some(previous)) = (carry_forward_from, run.plan.previous) {
                    let copied = store.copy_forward_records(from, snapshot.id).await?;
                    snapshot.size = store.count_records(snapshot.id).await?;
                    snapshot.last_incremental_time = Some(previous.started_at);
                    snapshot.previous_snapshot_id = Some(from);
                    run.log
                        .info(format!("Copied {copied} unchanged records from snapshot {from}"))
                        .await;
                }
                run.apply_status(&mut snapshot, SnapshotStatus::HarvestingFinishedValid)
                    .await;
                run.log.info("Harvesting ended successfully").await;
            }
        }

        snapshot.touch(Utc::now());
        let snapshot = save_or_reload(store.as_ref(), &run.log, snapshot).await?;
        self.progress.set_records(snapshot.size);
        let status = snapshot.status();
        run.snapshot = snapshot;
        Ok(status)
    }

    async fn mark_failed(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let mut snapshot = run.snapshot.clone();
        if snapshot.status().is_terminal() {
            return;
        }
        run.apply_status(&mut snapshot, SnapshotStatus::HarvestingFinishedError)
            .await;
        snapshot.touch(Utc::now());
        match save_or_reload(self.store.as_ref(), &run.log, snapshot).await {
            Ok(snapshot) => run.snapshot = snapshot,
            Err(err) => {
                harvest_error!(snapshot = run.snapshot.id; "Cannot persist failed snapshot: {err}");
            }
        }
    }

    /// One transaction per event, applied to a copy of the snapshot that
    /// replaces the run's snapshot only once committed.
    async fn record_event(&mut self, mut event: HarvestingEvent) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let stop_requested = self.stop.is_cancelled();
        let Some(run) = self.run.as_mut() else {
            return Err(StoreError::Backend("event received outside of a run".to_string()));
        };
        let mut tx = store.begin().await?;
        let mut snapshot = run.snapshot.clone();
        let now = Utc::now();

        run.log_event(&event).await;
        if event.status == EventStatus::Ok {
            run.persist_page(tx.as_mut(), &mut snapshot, &mut event, now)
                .await;
        }

        // A page completed after stop() concludes the run like the stop event would.
        let decided = if stop_requested && event.status == EventStatus::Ok {
            EventStatus::StopSignalReceived
        } else {
            event.status
        };
        let ctx = EventContext {
            mode: run.plan.mode,
            by_set: run.by_set,
            records_so_far: snapshot.size,
        };
        if let Some(next) = status_after_event(decided, &ctx) {
            run.apply_status(&mut snapshot, next).await;
        }

        snapshot.touch(now);
        tx.save_snapshot(&snapshot).await?;
        tx.commit().await?;

        self.progress.set_records(snapshot.size);
        run.snapshot = snapshot;
        Ok(())
    }
}

/// Saves `snapshot`, or returns the stored one when the store already holds
/// it in a terminal status (a stop concluded it out of band).
async fn save_or_reload(
    store: &dyn SnapshotStore,
    log: &SnapshotLog,
    snapshot: Snapshot,
) -> Result<Snapshot, StoreError> {
    match store.save_snapshot(&snapshot).await {
        Ok(()) => Ok(snapshot),
        Err(StoreError::Transition(err)) => {
            let stored = store.load_snapshot(snapshot.id).await?;
            log.info(format!(
                "Snapshot already concluded as {}, keeping it ({err})",
                stored.status()
            ))
            .await;
            Ok(stored)
        }
        Err(err) => Err(err),
    }
}

#[async_trait::async_trait]
impl HarvestListener for HarvestingWorker {
    async fn on_event(&mut self, event: HarvestingEvent) -> Result<(), ListenerError> {
        let Err(err) = self.record_event(event).await else {
            return Ok(());
        };
        let message = err.to_string();
        if let Some(run) = self.run.as_mut() {
            run.log
                .error(format!("Cannot record harvesting event: {message}"))
                .await;
            run.aborted.get_or_insert_with(|| message.clone());
        }
        Err(ListenerError(message))
    }
}
