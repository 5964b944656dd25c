//! In-process store and run log. Used by tests and by embedders that keep
//! snapshots in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use harvest_core::{Network, NetworkId, Snapshot, SnapshotId, SnapshotStatus, TransitionError};

use crate::services::{RunLog, RunLogEntry};
use crate::store::{SnapshotStore, StoreError, StoreTransaction, StoredRecord};

#[derive(Debug, Default)]
struct Inner {
    next_id: SnapshotId,
    snapshots: BTreeMap<SnapshotId, Snapshot>,
    records: BTreeMap<SnapshotId, BTreeMap<String, StoredRecord>>,
    rejected: BTreeSet<String>,
    commits: u64,
}

impl Inner {
    fn snapshot_mut(&mut self, id: SnapshotId) -> Result<&mut Snapshot, StoreError> {
        self.snapshots
            .get_mut(&id)
            .ok_or(StoreError::SnapshotNotFound(id))
    }

    /// A stored snapshot in a terminal status only accepts writes carrying that same status.
    fn check_replace(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let stored = self
            .snapshots
            .get(&snapshot.id)
            .ok_or(StoreError::SnapshotNotFound(snapshot.id))?;
        if stored.status().can_transition_to(snapshot.status()) {
            return Ok(());
        }
        Err(TransitionError {
            snapshot_id: snapshot.id,
            from: stored.status(),
            to: snapshot.status(),
        }
        .into())
    }

    fn contains(&self, snapshot_id: SnapshotId, identifier: &str) -> bool {
        self.records
            .get(&snapshot_id)
            .is_some_and(|records| records.contains_key(identifier))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds an existing snapshot together with its records.
    pub fn seed(&self, snapshot: Snapshot, records: impl IntoIterator<Item = StoredRecord>) {
        let mut inner = self.lock();
        inner.next_id = inner.next_id.max(snapshot.id);
        let rows = inner.records.entry(snapshot.id).or_default();
        for record in records {
            rows.insert(record.identifier.clone(), record);
        }
        inner.snapshots.insert(snapshot.id, snapshot);
    }

    /// Makes every later write of `identifier` fail.
    pub fn reject_identifier(&self, identifier: impl Into<String>) {
        self.lock().rejected.insert(identifier.into());
    }

    pub fn snapshot(&self, id: SnapshotId) -> Option<Snapshot> {
        self.lock().snapshots.get(&id).cloned()
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.lock().snapshots.values().cloned().collect()
    }

    pub fn records(&self, id: SnapshotId) -> Vec<StoredRecord> {
        self.lock()
            .records
            .get(&id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn commit_count(&self) -> u64 {
        self.lock().commits
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    async fn create_snapshot(
        &self,
        network: &Network,
        started_at: DateTime<Utc>,
    ) -> Result<Snapshot, StoreError> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let snapshot = Snapshot::new(inner.next_id, network.id, started_at);
        inner.snapshots.insert(snapshot.id, snapshot.clone());
        inner.records.insert(snapshot.id, BTreeMap::new());
        Ok(snapshot)
    }

    async fn load_snapshot(&self, id: SnapshotId) -> Result<Snapshot, StoreError> {
        self.lock()
            .snapshots
            .get(&id)
            .cloned()
            .ok_or(StoreError::SnapshotNotFound(id))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_replace(snapshot)?;
        *inner.snapshot_mut(snapshot.id)? = snapshot.clone();
        Ok(())
    }

    async fn force_status(
        &self,
        id: SnapshotId,
        status: SnapshotStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let snapshot = inner.snapshot_mut(id)?;
        snapshot.transition(status)?;
        snapshot.touch(at);
        Ok(())
    }

    async fn find_last_good_known_snapshot(
        &self,
        network_id: NetworkId,
    ) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .lock()
            .snapshots
            .values()
            .filter(|s| {
                s.network_id == network_id
                    && s.status() == SnapshotStatus::HarvestingFinishedValid
            })
            .max_by_key(|s| (s.start_time, s.id))
            .cloned())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            ops: Vec::new(),
            pending: BTreeSet::new(),
            open: true,
        }))
    }

    async fn copy_forward_records(
        &self,
        from: SnapshotId,
        to: SnapshotId,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        if !inner.snapshots.contains_key(&from) {
            return Err(StoreError::SnapshotNotFound(from));
        }
        let carried: Vec<StoredRecord> = inner
            .records
            .get(&from)
            .map(|rows| {
                rows.values()
                    .filter(|r| !r.deleted && !inner.contains(to, &r.identifier))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let target = inner.records.entry(to).or_default();
        let copied = carried.len() as u64;
        for record in carried {
            target.insert(record.identifier.clone(), record);
        }
        Ok(copied)
    }

    async fn count_records(&self, id: SnapshotId) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .records
            .get(&id)
            .map(|rows| rows.values().filter(|r| !r.deleted).count() as u64)
            .unwrap_or_default())
    }
}

#[derive(Debug)]
enum Op {
    Upsert(SnapshotId, StoredRecord),
    Snapshot(Snapshot),
}

/// Buffers writes and applies them under one lock on commit.
struct MemoryTransaction {
    inner: Arc<Mutex<Inner>>,
    ops: Vec<Op>,
    pending: BTreeSet<(SnapshotId, String)>,
    open: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed)
        }
    }

    fn check_accepted(&self, identifier: &str) -> Result<(), StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.rejected.contains(identifier) {
            return Err(StoreError::RecordRejected {
                identifier: identifier.to_string(),
                reason: "rejected by store".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn upsert_record(
        &mut self,
        snapshot_id: SnapshotId,
        record: StoredRecord,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        self.check_accepted(&record.identifier)?;
        let key = (snapshot_id, record.identifier.clone());
        let known = self.pending.contains(&key)
            || self
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(snapshot_id, &record.identifier);
        self.pending.insert(key);
        self.ops.push(Op::Upsert(snapshot_id, record));
        Ok(!known)
    }

    async fn mark_deleted(
        &mut self,
        snapshot_id: SnapshotId,
        identifier: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.check_accepted(identifier)?;
        self.pending.insert((snapshot_id, identifier.to_string()));
        self.ops
            .push(Op::Upsert(snapshot_id, StoredRecord::deletion(identifier, at)));
        Ok(())
    }

    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.ops.push(Op::Snapshot(snapshot.clone()));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.open = false;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for op in &self.ops {
            if let Op::Snapshot(snapshot) = op {
                inner.check_replace(snapshot)?;
            }
        }
        for op in self.ops.drain(..) {
            match op {
                Op::Upsert(snapshot_id, record) => {
                    inner
                        .records
                        .entry(snapshot_id)
                        .or_default()
                        .insert(record.identifier.clone(), record);
                }
                Op::Snapshot(snapshot) => {
                    let id = snapshot.id;
                    *inner.snapshot_mut(id)? = snapshot;
                }
            }
        }
        inner.commits += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRunLog {
    entries: Arc<Mutex<Vec<RunLogEntry>>>,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RunLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn messages(&self, snapshot_id: SnapshotId) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.snapshot_id == snapshot_id)
            .map(|entry| entry.message)
            .collect()
    }
}

#[async_trait::async_trait]
impl RunLog for MemoryRunLog {
    async fn append(&self, entry: RunLogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }
}
