use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use harvest_core::{SnapshotId, SnapshotStatus};
use harvest_logging::{harvest_info, harvest_warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::harvester::Harvester;
use crate::services::RunLog;
use crate::store::{SnapshotStore, StoreError};
use crate::worker::{HarvestingWorker, Progress, SnapshotLog};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("worker task failed: {0}")]
    Task(String),
}

/// A harvesting run executing on its own task.
pub struct WorkerHandle {
    harvester: Arc<dyn Harvester>,
    store: Arc<dyn SnapshotStore>,
    run_log: Arc<dyn RunLog>,
    progress: Arc<Progress>,
    stop: CancellationToken,
    settle_delay: Duration,
    task: JoinHandle<Result<SnapshotStatus, StoreError>>,
}

impl WorkerHandle {
    pub(crate) fn spawn(mut worker: HarvestingWorker) -> Self {
        let harvester = Arc::clone(&worker.harvester);
        let store = Arc::clone(&worker.store);
        let run_log = Arc::clone(&worker.run_log);
        let progress = Arc::clone(&worker.progress);
        let stop = worker.stop.clone();
        let settle_delay = worker.settings().settle_delay;

        let task = tokio::spawn(async move { worker.run().await });

        Self {
            harvester,
            store,
            run_log,
            progress,
            stop,
            settle_delay,
            task,
        }
    }

    pub fn status(&self) -> String {
        self.progress.status()
    }

    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        self.progress.snapshot_id()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<SnapshotStatus, WorkerError> {
        let outcome = self
            .task
            .await
            .map_err(|err| WorkerError::Task(err.to_string()))?;
        Ok(outcome?)
    }

    /// Stops the run: raises the stop signal, marks the snapshot valid, then
    /// gives the run `settle_delay` to record its last event before the task
    /// is aborted. Returns the final status when the run settled in time.
    ///
    /// A stop that lands before the snapshot exists is honored by the worker
    /// itself, which concludes the run like a stop event with no records.
    pub async fn stop(mut self) -> Result<Option<SnapshotStatus>, WorkerError> {
        self.stop.cancel();
        self.harvester.stop();

        if let Some(snapshot_id) = self.progress.snapshot_id() {
            let log = SnapshotLog::new(Arc::clone(&self.run_log), snapshot_id);
            log.info("Stop requested").await;
            if let Err(err) = self
                .store
                .force_status(snapshot_id, SnapshotStatus::HarvestingFinishedValid, Utc::now())
                .await
            {
                log.error(format!("Cannot mark snapshot as finished: {err}")).await;
            }
        }

        match tokio::time::timeout(self.settle_delay, &mut self.task).await {
            Ok(joined) => {
                let outcome = joined.map_err(|err| WorkerError::Task(err.to_string()))?;
                Ok(Some(outcome?))
            }
            Err(_) => {
                harvest_warn!("Run did not settle within {:?}, aborting", self.settle_delay);
                self.task.abort();
                self.conclude_aborted().await;
                harvest_info!("Worker stopped");
                Ok(None)
            }
        }
    }

    /// Leaves the snapshot of an aborted run in a terminal status.
    async fn conclude_aborted(&self) {
        let Some(snapshot_id) = self.progress.snapshot_id() else {
            return;
        };
        let status = match self.store.load_snapshot(snapshot_id).await {
            Ok(snapshot) => snapshot.status(),
            Err(err) => {
                harvest_warn!(snapshot = snapshot_id; "Cannot load aborted snapshot: {err}");
                return;
            }
        };
        if status.is_terminal() {
            return;
        }
        let log = SnapshotLog::new(Arc::clone(&self.run_log), snapshot_id);
        match self
            .store
            .force_status(snapshot_id, SnapshotStatus::HarvestingStopped, Utc::now())
            .await
        {
            Ok(()) => {
                log.error(format!(
                    "Run aborted while {status}, snapshot marked {}",
                    SnapshotStatus::HarvestingStopped
                ))
                .await;
            }
            Err(err) => log.error(format!("Cannot conclude aborted snapshot: {err}")).await,
        }
    }
}
