use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use harvest_core::{
    EventStatus, HarvestingEvent, Network, NetworkId, RecordMetadata, RetryPolicy, Snapshot,
    SnapshotId, SnapshotStatus, ValidatorRef, DISCOVER_CAPABILITIES, FORCE_FULL_HARVESTING,
};
use harvest_engine::{
    FaultKind, FetchSettings, HarvestListener, HarvestRequest, Harvester, HarvestingWorker,
    MemoryRunLog, MemoryStore, OaiError, OaiHarvester, OaiSet, Prevalidator, PrevalidatorFactory,
    ReqwestFetcher, RepositoryIdentity, SnapshotStore, StoreError, StoreTransaction, StoredRecord,
    ValidationError, WorkerSettings, INITIALIZING,
};
use pretty_assertions::assert_eq;
use tokio::sync::Notify;
use wiremock::matchers::{method, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ORIGIN: &str = "http://repo.example.org/oai";

fn previous_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 10, 20, 30).unwrap()
}

fn metadata(id: &str) -> RecordMetadata {
    RecordMetadata {
        identifier: id.to_string(),
        datestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        set_specs: Vec::new(),
        format: "oai_dc".to_string(),
        metadata: format!("<dc><identifier>{id}</identifier></dc>"),
    }
}

fn page(ids: &[&str], token: Option<&str>) -> HarvestingEvent {
    let mut event = HarvestingEvent::new(EventStatus::Ok, ORIGIN, "oai_dc")
        .with_resumption_token(token.map(str::to_string));
    for id in ids {
        event.push_record(metadata(id));
    }
    event
}

fn outcome(status: EventStatus) -> HarvestingEvent {
    HarvestingEvent::new(status, ORIGIN, "oai_dc").with_message(status.as_str())
}

struct Pause {
    after_events: usize,
    reached: Arc<Notify>,
}

/// Replays one scripted event list per harvest call.
#[derive(Default)]
struct ScriptedHarvester {
    scripts: Mutex<VecDeque<Vec<HarvestingEvent>>>,
    requests: Mutex<Vec<HarvestRequest>>,
    granularity: Option<String>,
    identify_delay: Option<Duration>,
    stopped: AtomicBool,
    resumed: Notify,
    pause: Option<Pause>,
}

impl ScriptedHarvester {
    fn new(scripts: Vec<Vec<HarvestingEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<HarvestRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Harvester for ScriptedHarvester {
    async fn harvest(&self, request: &HarvestRequest, listener: &mut dyn HarvestListener) {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        for (index, event) in script.into_iter().enumerate() {
            if self.stopped.load(Ordering::SeqCst) {
                let stop = HarvestingEvent::new(
                    EventStatus::StopSignalReceived,
                    &request.origin_url,
                    &request.metadata_prefix,
                );
                let _ = listener.on_event(stop).await;
                return;
            }
            let status = event.status;
            if listener.on_event(event).await.is_err() {
                return;
            }
            if matches!(
                status,
                EventStatus::NoMatchingQuery | EventStatus::ErrorFatal
            ) {
                return;
            }
            if let Some(pause) = &self.pause {
                if index + 1 == pause.after_events {
                    pause.reached.notify_one();
                    self.resumed.notified().await;
                }
            }
        }
    }

    async fn identify(&self, _origin_url: &str) -> Result<RepositoryIdentity, OaiError> {
        if let Some(delay) = self.identify_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.granularity {
            Some(granularity) => Ok(RepositoryIdentity {
                repository_name: "Scripted".to_string(),
                granularity: Some(granularity.clone()),
                ..RepositoryIdentity::default()
            }),
            None => Err(OaiError {
                kind: FaultKind::Network,
                message: "unreachable".to_string(),
            }),
        }
    }

    async fn list_sets(&self, _origin_url: &str) -> Result<Vec<OaiSet>, OaiError> {
        Ok(Vec::new())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.resumed.notify_one();
    }

    fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}

struct Fixture {
    harvester: Arc<ScriptedHarvester>,
    store: MemoryStore,
    run_log: MemoryRunLog,
}

impl Fixture {
    fn new(harvester: ScriptedHarvester) -> Self {
        harvest_logging::initialize_for_tests();
        Self {
            harvester: Arc::new(harvester),
            store: MemoryStore::new(),
            run_log: MemoryRunLog::new(),
        }
    }

    fn worker(&self, network: Network, incremental: bool) -> HarvestingWorker {
        HarvestingWorker::new(
            network,
            self.harvester.clone(),
            Arc::new(self.store.clone()),
            Arc::new(self.run_log.clone()),
        )
        .with_settings(WorkerSettings {
            incremental,
            ..WorkerSettings::default()
        })
    }

    fn seed_previous(&self, network_id: u64, records: &[(&str, bool)]) {
        let mut previous = Snapshot::new(1, network_id, previous_start());
        previous.transition(SnapshotStatus::Harvesting).unwrap();
        previous
            .transition(SnapshotStatus::HarvestingFinishedValid)
            .unwrap();
        let rows = records.iter().map(|(id, is_deleted)| {
            if *is_deleted {
                StoredRecord::deletion(*id, previous_start())
            } else {
                StoredRecord::from_metadata(metadata(id))
            }
        });
        self.store.seed(previous, rows);
    }
}

fn network() -> Network {
    Network::new(7, "Example", ORIGIN, "oai_dc")
}

fn identifiers(records: &[StoredRecord]) -> Vec<(String, bool)> {
    records
        .iter()
        .map(|r| (r.identifier.clone(), r.deleted))
        .collect()
}

#[tokio::test]
async fn incremental_without_previous_snapshot_runs_full() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![
        page(&["a", "b"], Some("t1")),
        page(&["c"], None),
    ]]));
    let mut worker = fixture.worker(network(), true);
    assert_eq!(worker.status(), INITIALIZING);

    let status = worker.run().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedValid);
    let requests = fixture.harvester.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].from, None);
    assert_eq!(requests[0].set, None);

    let snapshot_id = worker.snapshot_id().unwrap();
    let snapshot = fixture.store.snapshot(snapshot_id).unwrap();
    assert_eq!(snapshot.size, 3);
    assert_eq!(snapshot.previous_snapshot_id, None);
    assert!(snapshot.end_time.is_some());
    assert_eq!(fixture.store.records(snapshot_id).len(), 3);
    assert_eq!(worker.status(), "Harvested 3 records");
    // One committed transaction per event.
    assert_eq!(fixture.store.commit_count(), 2);

    let log = fixture.run_log.messages(snapshot_id);
    assert!(log.contains(&"Full harvesting".to_string()));
    assert!(log.contains(&"Status: HARVESTING -> HARVESTING_FINISHED_VALID".to_string()));
}

#[tokio::test]
async fn full_run_without_records_is_an_error() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![outcome(
        EventStatus::NoMatchingQuery,
    )]]));
    let mut worker = fixture.worker(network(), true);

    let status = worker.run().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedError);
    let snapshot = fixture.store.snapshot(worker.snapshot_id().unwrap()).unwrap();
    assert_eq!(snapshot.status(), SnapshotStatus::HarvestingFinishedError);
    assert_eq!(snapshot.size, 0);
}

#[tokio::test]
async fn empty_set_does_not_fail_a_by_set_run() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![
        vec![outcome(EventStatus::NoMatchingQuery)],
        vec![page(&["b1", "b2", "b3", "b4", "b5"], None)],
    ]));
    let mut worker = fixture.worker(network().with_sets(["A", "B"]), false);

    let status = worker.run().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedValid);
    let sets: Vec<Option<String>> = fixture
        .harvester
        .requests()
        .into_iter()
        .map(|r| r.set)
        .collect();
    assert_eq!(sets, vec![Some("A".to_string()), Some("B".to_string())]);
    let snapshot = fixture.store.snapshot(worker.snapshot_id().unwrap()).unwrap();
    assert_eq!(snapshot.size, 5);
    let log = fixture.run_log.messages(snapshot.id);
    assert!(log.contains(&"No records match set A".to_string()));
}

#[tokio::test]
async fn records_shared_by_sets_are_counted_once() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![
        vec![page(&["x", "y"], None)],
        vec![page(&["y", "z"], None)],
    ]));
    let mut worker = fixture.worker(network().with_sets(["A", "B"]), false);

    worker.run().await.unwrap();

    let snapshot = fixture.store.snapshot(worker.snapshot_id().unwrap()).unwrap();
    assert_eq!(snapshot.size, 3);
    assert_eq!(fixture.store.records(snapshot.id).len(), 3);
}

#[tokio::test]
async fn fatal_set_skips_remaining_sets() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![
        vec![page(&["a"], Some("t")), outcome(EventStatus::ErrorFatal)],
        vec![page(&["b"], None)],
    ]));
    let mut worker = fixture.worker(network().with_sets(["A", "B"]), false);

    let status = worker.run().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedError);
    assert_eq!(fixture.harvester.requests().len(), 1);
}

#[tokio::test]
async fn retries_move_through_retrying_before_failing() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![
        page(&["a"], Some("t")),
        outcome(EventStatus::ErrorRetry),
        outcome(EventStatus::ErrorRetry),
        outcome(EventStatus::ErrorFatal),
    ]]));
    let mut worker = fixture.worker(network(), false);

    let status = worker.run().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedError);
    let log = fixture.run_log.messages(worker.snapshot_id().unwrap());
    assert!(log.contains(&"Status: HARVESTING -> RETRYING".to_string()));
    assert!(log.contains(&"Status: RETRYING -> HARVESTING_FINISHED_ERROR".to_string()));
    assert!(log.contains(&"Harvesting ended with errors".to_string()));
}

#[tokio::test]
async fn long_cursor_is_persisted_truncated() {
    let token = "k".repeat(300);
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![
        page(&["a"], Some(&token)),
        outcome(EventStatus::ErrorFatal),
    ]]));
    let mut worker = fixture.worker(network(), false);

    worker.run().await.unwrap();

    let snapshot = fixture.store.snapshot(worker.snapshot_id().unwrap()).unwrap();
    assert_eq!(snapshot.resumption_token(), Some(&token[..255]));
}

#[tokio::test]
async fn incremental_run_harvests_from_previous_start_and_carries_forward() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![{
        let mut event = page(&["r2", "r5"], None);
        event.push_deleted("r3");
        event
    }]]));
    fixture.seed_previous(7, &[("r1", false), ("r2", false), ("r3", false), ("r4", true)]);
    let mut worker = fixture.worker(network(), true);

    let status = worker.run().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedValid);
    let requests = fixture.harvester.requests();
    assert_eq!(requests[0].from.as_deref(), Some("2024-03-05T10:20:30Z"));

    let snapshot = fixture.store.snapshot(worker.snapshot_id().unwrap()).unwrap();
    assert_eq!(snapshot.id, 2);
    assert_eq!(snapshot.previous_snapshot_id, Some(1));
    assert_eq!(snapshot.last_incremental_time, Some(previous_start()));
    assert_eq!(snapshot.size, 3);
    assert_eq!(
        identifiers(&fixture.store.records(snapshot.id)),
        vec![
            ("r1".to_string(), false),
            ("r2".to_string(), false),
            ("r3".to_string(), true),
            ("r5".to_string(), false),
        ]
    );
}

#[tokio::test]
async fn incremental_without_changes_is_valid() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![outcome(
        EventStatus::NoMatchingQuery,
    )]]));
    fixture.seed_previous(7, &[("r1", false), ("r2", false)]);
    let mut worker = fixture.worker(network(), true);

    let status = worker.run().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedValid);
    let snapshot = fixture.store.snapshot(worker.snapshot_id().unwrap()).unwrap();
    assert_eq!(snapshot.size, 2);
}

#[tokio::test]
async fn deletions_are_ignored_in_full_runs() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![{
        let mut event = page(&["a"], None);
        event.push_deleted("b");
        event
    }]]));
    let mut worker = fixture.worker(network(), false);

    worker.run().await.unwrap();

    let records = fixture.store.records(worker.snapshot_id().unwrap());
    assert_eq!(identifiers(&records), vec![("a".to_string(), false)]);
}

#[tokio::test]
async fn force_full_property_overrides_incremental() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![page(&["a"], None)]]));
    fixture.seed_previous(7, &[("r1", false)]);
    let mut worker =
        fixture.worker(network().with_property(FORCE_FULL_HARVESTING, true), true);

    worker.run().await.unwrap();

    assert_eq!(fixture.harvester.requests()[0].from, None);
    let snapshot = fixture.store.snapshot(worker.snapshot_id().unwrap()).unwrap();
    assert_eq!(snapshot.previous_snapshot_id, None);
    assert_eq!(snapshot.size, 1);
}

#[tokio::test]
async fn discovered_granularity_shapes_from() {
    let fixture = Fixture::new(ScriptedHarvester {
        granularity: Some("YYYY-MM-DD".to_string()),
        ..ScriptedHarvester::new(vec![vec![page(&["a"], None)]])
    });
    fixture.seed_previous(7, &[]);
    let mut worker =
        fixture.worker(network().with_property(DISCOVER_CAPABILITIES, true), true);

    worker.run().await.unwrap();

    assert_eq!(
        fixture.harvester.requests()[0].from.as_deref(),
        Some("2024-03-05")
    );
}

#[tokio::test]
async fn identify_failure_falls_back_to_default_granularity() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![page(&["a"], None)]]));
    fixture.seed_previous(7, &[]);
    let mut worker =
        fixture.worker(network().with_property(DISCOVER_CAPABILITIES, true), true);

    worker.run().await.unwrap();

    assert_eq!(
        fixture.harvester.requests()[0].from.as_deref(),
        Some("2024-03-05T10:20:30Z")
    );
}

struct RejectPrefix(&'static str);

impl Prevalidator for RejectPrefix {
    fn validate(&self, record: &RecordMetadata) -> Result<bool, ValidationError> {
        if record.identifier == "broken" {
            return Err(ValidationError::Record {
                identifier: record.identifier.clone(),
                reason: "unreadable".to_string(),
            });
        }
        Ok(!record.identifier.starts_with(self.0))
    }
}

struct Validators {
    fail: bool,
}

impl PrevalidatorFactory for Validators {
    fn build(&self, validator: &ValidatorRef) -> Result<Box<dyn Prevalidator>, ValidationError> {
        if self.fail {
            return Err(ValidationError::Load {
                name: validator.name.clone(),
                reason: "syntax error".to_string(),
            });
        }
        Ok(Box::new(RejectPrefix("bad")))
    }
}

fn validated_network() -> Network {
    network().with_prevalidator(ValidatorRef {
        id: 3,
        name: "rules".to_string(),
    })
}

#[tokio::test]
async fn prevalidation_filters_records() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![page(
        &["good1", "bad1", "broken", "good2"],
        None,
    )]]));
    let mut worker = fixture
        .worker(validated_network(), false)
        .with_prevalidation(Arc::new(Validators { fail: false }));

    worker.run().await.unwrap();

    let snapshot_id = worker.snapshot_id().unwrap();
    let records = fixture.store.records(snapshot_id);
    assert_eq!(
        identifiers(&records),
        vec![("good1".to_string(), false), ("good2".to_string(), false)]
    );
    let log = fixture.run_log.messages(snapshot_id);
    assert!(log
        .iter()
        .any(|line| line.starts_with("Error prevalidating record broken")));
}

#[tokio::test]
async fn prevalidator_load_failure_accepts_everything() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![page(
        &["good1", "bad1"],
        None,
    )]]));
    let mut worker = fixture
        .worker(validated_network(), false)
        .with_prevalidation(Arc::new(Validators { fail: true }));

    worker.run().await.unwrap();

    let snapshot_id = worker.snapshot_id().unwrap();
    assert_eq!(fixture.store.records(snapshot_id).len(), 2);
    let log = fixture.run_log.messages(snapshot_id);
    assert!(log
        .iter()
        .any(|line| line.starts_with("Error loading prevalidator rules")));
}

#[tokio::test]
async fn record_persistence_failures_are_logged_and_skipped() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![page(
        &["a", "b", "c"],
        None,
    )]]));
    fixture.store.reject_identifier("b");
    let mut worker = fixture.worker(network(), false);

    let status = worker.run().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedValid);
    let snapshot_id = worker.snapshot_id().unwrap();
    assert_eq!(fixture.store.records(snapshot_id).len(), 2);
    assert!(fixture
        .run_log
        .messages(snapshot_id)
        .iter()
        .any(|line| line.starts_with("Error persisting record b")));
}

#[tokio::test]
async fn stop_after_three_of_ten_pages_keeps_a_valid_snapshot() {
    let reached = Arc::new(Notify::new());
    let pages: Vec<HarvestingEvent> = (1..=10)
        .map(|n| {
            let ids = [format!("p{n}-1"), format!("p{n}-2")];
            let token = (n < 10).then(|| format!("t{n}"));
            page(&[ids[0].as_str(), ids[1].as_str()], token.as_deref())
        })
        .collect();
    let fixture = Fixture::new(ScriptedHarvester {
        pause: Some(Pause {
            after_events: 3,
            reached: reached.clone(),
        }),
        ..ScriptedHarvester::new(vec![pages])
    });
    let worker = fixture
        .worker(network(), false)
        .with_settings(WorkerSettings {
            settle_delay: Duration::from_secs(5),
            ..WorkerSettings::default()
        });

    let handle = worker.spawn();
    reached.notified().await;
    assert_eq!(handle.status(), "Harvested 6 records");
    let snapshot_id = handle.snapshot_id().unwrap();

    let status = handle.stop().await.unwrap();

    assert_eq!(status, Some(SnapshotStatus::HarvestingFinishedValid));
    let snapshot = fixture.store.snapshot(snapshot_id).unwrap();
    assert_eq!(snapshot.status(), SnapshotStatus::HarvestingFinishedValid);
    assert_eq!(snapshot.size, 6);
    assert_eq!(snapshot.resumption_token(), Some("t3"));
    assert!(fixture
        .run_log
        .messages(snapshot_id)
        .contains(&"Stop signal received, harvesting is stopping".to_string()));
}

#[tokio::test]
async fn spawned_worker_can_be_joined() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![page(&["a"], None)]]));
    let handle = fixture.worker(network(), false).spawn();

    let status = handle.join().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedValid);
}

#[tokio::test]
async fn worker_drives_the_oai_client_end_to_end() {
    harvest_logging::initialize_for_tests();
    let server = MockServer::start().await;
    let body = "<OAI-PMH><ListRecords>\
        <record><header><identifier>oai:1</identifier><datestamp>2024-05-01</datestamp></header>\
        <metadata><dc><title>One</title></dc></metadata></record>\
        <record><header status=\"deleted\"><identifier>oai:2</identifier><datestamp>2024-05-01</datestamp></header></record>\
        </ListRecords></OAI-PMH>";
    Mock::given(method("GET"))
        .and(query_param("verb", "ListRecords"))
        .and(query_param("metadataPrefix", "oai_dc"))
        .and(query_param("from", "2024-03-05T10:20:30Z"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/xml"))
        .expect(1)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let run_log = MemoryRunLog::new();
    let mut previous = Snapshot::new(1, 7, previous_start());
    previous.transition(SnapshotStatus::Harvesting).unwrap();
    previous
        .transition(SnapshotStatus::HarvestingFinishedValid)
        .unwrap();
    store.seed(
        previous,
        [
            StoredRecord::from_metadata(metadata("oai:2")),
            StoredRecord::from_metadata(metadata("oai:3")),
        ],
    );

    let harvester = OaiHarvester::new(
        Arc::new(ReqwestFetcher::new(FetchSettings::default())),
        RetryPolicy {
            initial_backoff_secs: 0,
            ..RetryPolicy::default()
        },
    );
    let network = Network::new(7, "Example", format!("{}/oai", server.uri()), "oai_dc");
    let mut worker = HarvestingWorker::new(
        network,
        Arc::new(harvester),
        Arc::new(store.clone()),
        Arc::new(run_log),
    )
    .with_settings(WorkerSettings {
        incremental: true,
        ..WorkerSettings::default()
    });

    let status = worker.run().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedValid);
    let records = store.records(worker.snapshot_id().unwrap());
    assert_eq!(
        identifiers(&records),
        vec![
            ("oai:1".to_string(), false),
            ("oai:2".to_string(), true),
            ("oai:3".to_string(), false),
        ]
    );
    assert_eq!(records[0].metadata, "<dc><title>One</title></dc>");
    assert_eq!(records[0].hash.len(), 64);
}

/// Delegates to a `MemoryStore` with injectable faults.
struct FaultyStore {
    inner: MemoryStore,
    /// Transactions after the first `healthy_transactions` fail to begin.
    healthy_transactions: usize,
    begun: AtomicUsize,
    create_delay: Option<Duration>,
    hang_on_save: bool,
}

impl FaultyStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            healthy_transactions: usize::MAX,
            begun: AtomicUsize::new(0),
            create_delay: None,
            hang_on_save: false,
        }
    }
}

#[async_trait::async_trait]
impl SnapshotStore for FaultyStore {
    async fn create_snapshot(
        &self,
        network: &Network,
        started_at: DateTime<Utc>,
    ) -> Result<Snapshot, StoreError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.create_snapshot(network, started_at).await
    }

    async fn load_snapshot(&self, id: SnapshotId) -> Result<Snapshot, StoreError> {
        self.inner.load_snapshot(id).await
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        if self.hang_on_save {
            std::future::pending::<()>().await;
        }
        self.inner.save_snapshot(snapshot).await
    }

    async fn force_status(
        &self,
        id: SnapshotId,
        status: SnapshotStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.force_status(id, status, at).await
    }

    async fn find_last_good_known_snapshot(
        &self,
        network_id: NetworkId,
    ) -> Result<Option<Snapshot>, StoreError> {
        self.inner.find_last_good_known_snapshot(network_id).await
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        if self.begun.fetch_add(1, Ordering::SeqCst) >= self.healthy_transactions {
            return Err(StoreError::Backend("connection lost".to_string()));
        }
        self.inner.begin().await
    }

    async fn copy_forward_records(&self, from: SnapshotId, to: SnapshotId) -> Result<u64, StoreError> {
        self.inner.copy_forward_records(from, to).await
    }

    async fn count_records(&self, id: SnapshotId) -> Result<u64, StoreError> {
        self.inner.count_records(id).await
    }
}

#[tokio::test]
async fn lost_transaction_fails_the_run_and_skips_remaining_sets() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![
        vec![
            page(&["a"], Some("t1")),
            page(&["b"], Some("t2")),
            page(&["c"], Some("t3")),
            page(&["d"], Some("t4")),
            page(&["e"], None),
        ],
        vec![page(&["f"], None)],
    ]));
    let store = Arc::new(FaultyStore {
        healthy_transactions: 1,
        ..FaultyStore::new(fixture.store.clone())
    });
    let mut worker = HarvestingWorker::new(
        network().with_sets(["A", "B"]),
        fixture.harvester.clone(),
        store,
        Arc::new(fixture.run_log.clone()),
    );

    let status = worker.run().await.unwrap();

    assert_eq!(status, SnapshotStatus::HarvestingFinishedError);
    let snapshot_id = worker.snapshot_id().unwrap();
    assert_eq!(
        fixture.store.snapshot(snapshot_id).unwrap().status(),
        SnapshotStatus::HarvestingFinishedError
    );
    assert_eq!(
        identifiers(&fixture.store.records(snapshot_id)),
        vec![("a".to_string(), false)]
    );
    assert_eq!(fixture.harvester.requests().len(), 1);
    let log = fixture.run_log.messages(snapshot_id);
    assert!(log
        .iter()
        .any(|line| line.starts_with("Harvesting aborted: store backend error")));
}

#[tokio::test]
async fn stop_during_identify_ends_the_run_without_harvesting() {
    let harvester = ScriptedHarvester {
        granularity: Some("YYYY-MM-DD".to_string()),
        identify_delay: Some(Duration::from_secs(30)),
        ..ScriptedHarvester::new(vec![vec![page(&["a"], Some("t1")), page(&["b"], None)]])
    };
    let fixture = Fixture::new(harvester);
    let worker = fixture.worker(network().with_property(DISCOVER_CAPABILITIES, true), false);

    let handle = worker.spawn();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = handle.stop().await.unwrap();

    assert_eq!(status, Some(SnapshotStatus::HarvestingFinishedError));
    assert!(fixture.harvester.requests().is_empty());
    let snapshots = fixture.store.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status(), SnapshotStatus::HarvestingFinishedError);
    assert!(fixture.store.records(snapshots[0].id).is_empty());
    let log = fixture.run_log.messages(snapshots[0].id);
    assert!(log.contains(&"Stop signal received, harvesting is stopping".to_string()));
}

/// Never returns from a harvest call, whatever the stop signal says.
struct HangingHarvester;

#[async_trait::async_trait]
impl Harvester for HangingHarvester {
    async fn harvest(&self, _request: &HarvestRequest, _listener: &mut dyn HarvestListener) {
        std::future::pending::<()>().await;
    }

    async fn identify(&self, _origin_url: &str) -> Result<RepositoryIdentity, OaiError> {
        Ok(RepositoryIdentity::default())
    }

    async fn list_sets(&self, _origin_url: &str) -> Result<Vec<OaiSet>, OaiError> {
        Ok(Vec::new())
    }

    fn stop(&self) {}

    fn reset(&self) {}
}

#[tokio::test]
async fn unresponsive_run_is_aborted_with_a_terminal_snapshot() {
    harvest_logging::initialize_for_tests();
    let store = MemoryStore::new();
    let run_log = MemoryRunLog::new();
    let worker = HarvestingWorker::new(
        network(),
        Arc::new(HangingHarvester),
        Arc::new(store.clone()),
        Arc::new(run_log.clone()),
    )
    .with_settings(WorkerSettings {
        settle_delay: Duration::from_millis(50),
        ..WorkerSettings::default()
    });

    let handle = worker.spawn();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let snapshot_id = handle.snapshot_id().unwrap();
    assert_eq!(
        store.snapshot(snapshot_id).unwrap().status(),
        SnapshotStatus::Harvesting
    );

    assert_eq!(handle.stop().await.unwrap(), None);
    assert!(store.snapshot(snapshot_id).unwrap().status().is_terminal());
}

#[tokio::test]
async fn snapshot_created_after_stop_is_marked_stopped_when_aborted() {
    let fixture = Fixture::new(ScriptedHarvester::new(vec![vec![page(&["a"], None)]]));
    let store = Arc::new(FaultyStore {
        create_delay: Some(Duration::from_millis(20)),
        hang_on_save: true,
        ..FaultyStore::new(fixture.store.clone())
    });
    let worker = HarvestingWorker::new(
        network(),
        fixture.harvester.clone(),
        store,
        Arc::new(fixture.run_log.clone()),
    )
    .with_settings(WorkerSettings {
        settle_delay: Duration::from_millis(100),
        ..WorkerSettings::default()
    });

    let handle = worker.spawn();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.snapshot_id(), None);
    assert_eq!(handle.stop().await.unwrap(), None);

    let snapshots = fixture.store.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status(), SnapshotStatus::HarvestingStopped);
    assert!(fixture.harvester.requests().is_empty());
    let log = fixture.run_log.messages(snapshots[0].id);
    assert!(log
        .iter()
        .any(|line| line.starts_with("Run aborted while INITIALIZED")));
}
