//! End-to-end test infrastructure for the device topics engine.
//!
//! Provides a shared TestHarness that wires a `TopicsWorker` to a
//! settable clock, a mock classifier and an in-memory installed app list,
//! plus helpers to drive whole epochs.

use std::collections::BTreeMap;
use std::sync::Arc;

use topics_engine::store::ReturnedTopicsByEpoch;
use topics_engine::{
    seeded_rng, EpochComputationStats, FixedClock, MockClassifier, RecordingStatsLogger,
    StaticAppLister, TopicStore, TopicsWorker, WorkerDeps,
};
use topics_storage::Storage;
use topics_types::{EngineSettings, EpochId, Topic};

/// Epoch length used by every harness.
pub const EPOCH_PERIOD_MS: i64 = 1_000;

/// Topic at the mock classifier's taxonomy and model version.
pub fn topic(id: i32) -> Topic {
    Topic::new(id, 1, 1)
}

/// Engine defaults with a short epoch period.
pub fn engine_settings() -> EngineSettings {
    EngineSettings {
        epoch_period_ms: EPOCH_PERIOD_MS,
        ..EngineSettings::default()
    }
}

/// Classifier assignments from `(app, [topic id])` pairs.
pub fn assignments(pairs: &[(&str, &[i32])]) -> BTreeMap<String, Vec<Topic>> {
    pairs
        .iter()
        .map(|(app, ids)| (app.to_string(), ids.iter().copied().map(topic).collect()))
        .collect()
}

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    /// Shared storage instance
    pub storage: Arc<Storage>,
    /// Typed view over the same storage for assertions
    pub store: TopicStore,
    pub clock: Arc<FixedClock>,
    pub apps: Arc<StaticAppLister>,
    pub classifier: Arc<MockClassifier>,
    pub stats: Arc<RecordingStatsLogger>,
    pub worker: TopicsWorker,
}

impl TestHarness {
    /// Create a harness at epoch 0 with the epoch origin pinned to time 0.
    pub fn new(settings: EngineSettings, classifier: MockClassifier, installed: &[&str]) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let storage =
            Arc::new(Storage::open(temp_dir.path()).expect("Failed to open test storage"));
        let clock = Arc::new(FixedClock::new(0));
        let apps = Arc::new(StaticAppLister::new(installed.iter().copied()));
        let classifier = Arc::new(classifier);
        let stats = Arc::new(RecordingStatsLogger::new());

        let deps = WorkerDeps {
            classifier: classifier.clone(),
            app_lister: apps.clone(),
            clock: clock.clone(),
            stats: stats.clone(),
            rng: seeded_rng(42),
        };
        let worker = TopicsWorker::new(storage.clone(), settings, deps)
            .expect("Failed to create topics worker");
        assert_eq!(worker.current_epoch().expect("Failed to read epoch"), 0);

        Self {
            _temp_dir: temp_dir,
            store: TopicStore::new(storage.clone()),
            storage,
            clock,
            apps,
            classifier,
            stats,
            worker,
        }
    }

    pub fn epoch(&self) -> EpochId {
        self.worker.current_epoch().expect("Failed to read epoch")
    }

    /// Record `(app, sdk)` calls in the current epoch.
    pub fn record(&self, calls: &[(&str, &str)]) {
        for (app, sdk) in calls {
            self.worker
                .record_usage(app, sdk)
                .expect("Failed to record usage");
        }
    }

    /// Move to the next epoch and compute the one just finished.
    pub fn finish_epoch(&self) -> EpochComputationStats {
        self.clock.advance(EPOCH_PERIOD_MS);
        self.worker.compute_epoch().expect("Failed to compute epoch")
    }

    /// Record the same calls in `count` consecutive epochs, computing each.
    pub fn run_epochs(&self, count: usize, calls: &[(&str, &str)]) {
        for _ in 0..count {
            self.record(calls);
            self.finish_epoch();
        }
    }

    pub fn get_topics(&self, app: &str, sdk: &str) -> Vec<Topic> {
        self.worker
            .get_topics(app, sdk)
            .expect("Failed to get topics")
    }

    /// Every persisted assignment, by epoch.
    pub fn returned_rows(&self) -> ReturnedTopicsByEpoch {
        self.store
            .returned_topics(0, self.epoch())
            .expect("Failed to read returned topics")
    }

    /// Row count per column family.
    pub fn row_counts(&self) -> BTreeMap<String, u64> {
        self.storage
            .get_stats()
            .expect("Failed to read stats")
            .row_counts
    }
}
