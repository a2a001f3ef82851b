//! Orchestrator for the live topics surface.
//!
//! `TopicsWorker` wires the store, clock, epoch engine, cache, consent
//! store and reconciler together. One `RwLock<()>` orders everything:
//! queries share it, anything that writes holds it exclusively, so
//! reconciliation never interleaves with itself or with an epoch.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, info, instrument};

use topics_storage::{Storage, TopicsTable};
use topics_types::{EngineSettings, EpochId, Settings, Topic, TopicsError};

use crate::apps::{FileAppLister, InstalledAppLister, StaticAppLister};
use crate::cache::{CacheDump, TopicCache};
use crate::classifier::{Classifier, PrecomputedClassifier};
use crate::clock::{Clock, EpochClock, SystemClock};
use crate::consent::ConsentStore;
use crate::epoch::EpochEngine;
use crate::error::{require_app, EngineError};
use crate::reconciler::InstallReconciler;
use crate::selection::{lock_rng, os_rng, SharedRng};
use crate::stats::{EpochComputationStats, StatsLogger, TracingStatsLogger};
use crate::store::TopicStore;

/// Pluggable collaborators of a worker.
pub struct WorkerDeps {
    pub classifier: Arc<dyn Classifier>,
    pub app_lister: Arc<dyn InstalledAppLister>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<dyn StatsLogger>,
    pub rng: SharedRng,
}

impl WorkerDeps {
    /// Production collaborators for `settings`.
    ///
    /// Without `daemon.installed_apps_path` the installed set is empty,
    /// which makes reconciliation erase every app; callers that reconcile
    /// should configure a path.
    pub fn from_settings(settings: &Settings) -> Result<Self, EngineError> {
        let rng = os_rng();
        let classifier = PrecomputedClassifier::from_settings(&settings.classifier, rng.clone())?;
        let app_lister: Arc<dyn InstalledAppLister> = match &settings.daemon.installed_apps_path {
            Some(path) => Arc::new(FileAppLister::new(path)),
            None => Arc::new(StaticAppLister::default()),
        };
        Ok(Self {
            classifier: Arc::new(classifier),
            app_lister,
            clock: Arc::new(SystemClock),
            stats: Arc::new(TracingStatsLogger),
            rng,
        })
    }
}

/// Point-in-time view of the worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub current_epoch: EpochId,
    pub cache: CacheDump,
    pub blocked_topics_count: usize,
    pub row_counts: BTreeMap<String, u64>,
}

/// Topics orchestrator.
pub struct TopicsWorker {
    storage: Arc<Storage>,
    clock: EpochClock,
    engine: EpochEngine,
    cache: TopicCache,
    consent: Arc<ConsentStore>,
    reconciler: InstallReconciler,
    rng: SharedRng,
    lookback: i64,
    lock: RwLock<()>,
}

impl TopicsWorker {
    /// Build a worker over open storage.
    ///
    /// Runs any pending consent migration. The cache starts empty; call
    /// [`TopicsWorker::load_cache`] before serving queries.
    pub fn new(
        storage: Arc<Storage>,
        settings: EngineSettings,
        deps: WorkerDeps,
    ) -> Result<Self, EngineError> {
        settings.validate().map_err(TopicsError::Config)?;
        let store = Arc::new(TopicStore::new(storage.clone()));
        let consent = Arc::new(ConsentStore::new(&store, &settings)?);
        let clock = EpochClock::new(store.clone(), deps.clock, settings.epoch_period_ms)?;
        let engine = EpochEngine::new(
            store.clone(),
            deps.classifier,
            settings.clone(),
            deps.rng.clone(),
            deps.stats.clone(),
        );
        let cache = TopicCache::new(store.clone(), consent.clone(), deps.stats, &settings);
        let reconciler =
            InstallReconciler::new(store, deps.app_lister, settings.clone(), deps.rng.clone());

        Ok(Self {
            storage,
            clock,
            engine,
            cache,
            consent,
            reconciler,
            rng: deps.rng,
            lookback: settings.lookback(),
            lock: RwLock::new(()),
        })
    }

    /// Open storage at the configured path and build a production worker.
    pub fn open(settings: &Settings) -> Result<Self, EngineError> {
        settings.validate()?;
        let storage = Arc::new(Storage::open(&settings.expanded_db_path())?);
        let deps = WorkerDeps::from_settings(settings)?;
        Self::new(storage, settings.engine.clone(), deps)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        self.lock.read().map_err(|e| EngineError::Lock(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ()>, EngineError> {
        self.lock.write().map_err(|e| EngineError::Lock(e.to_string()))
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn current_epoch(&self) -> Result<EpochId, EngineError> {
        self.clock.current_epoch_id()
    }

    /// Reload the cache for the current epoch.
    pub fn load_cache(&self) -> Result<(), EngineError> {
        let _guard = self.write()?;
        self.load_cache_locked()
    }

    fn load_cache_locked(&self) -> Result<(), EngineError> {
        let epoch = self.clock.current_epoch_id()?;
        self.cache.load_cache(epoch)
    }

    /// Topics for `(app, sdk)`.
    ///
    /// An SDK with nothing cached in `[current - lookback, current]` first
    /// gets the app's past topics it could have learned, then the cache is
    /// reloaded.
    #[instrument(skip(self))]
    pub fn get_topics(&self, app: &str, sdk: &str) -> Result<Vec<Topic>, EngineError> {
        require_app(app)?;
        let current = self.clock.current_epoch_id()?;

        if !sdk.is_empty() {
            let needs_backfill = {
                let _guard = self.read()?;
                self.cache
                    .get_topics_in_epoch_range(current - self.lookback, current, app, sdk)?
                    .is_empty()
            };
            if needs_backfill {
                let _guard = self.write()?;
                if self
                    .reconciler
                    .assign_topics_to_sdk_for_app_installation(app, sdk, current)?
                {
                    self.load_cache_locked()?;
                }
            }
        }

        let _guard = self.read()?;
        let mut rng = lock_rng(&self.rng)?;
        self.cache
            .get_topics(self.lookback, current, app, sdk, &mut *rng)
    }

    /// Record a call from `(app, sdk)` in the current epoch.
    #[instrument(skip(self))]
    pub fn record_usage(&self, app: &str, sdk: &str) -> Result<(), EngineError> {
        let _guard = self.read()?;
        let epoch = self.clock.current_epoch_id()?;
        self.engine.record_usage(epoch, app, sdk)
    }

    /// Compute the epoch that just ended and reload the cache.
    ///
    /// Run at the start of epoch `n`, this processes epoch `n - 1` rather
    /// than the still-open epoch `n`: usage of `n - 1` is complete, and
    /// queries in epoch `n` read `[n - lookback, n - 1]`, so the result is
    /// served as soon as it is written. In epoch 0 there is nothing to
    /// compute yet. Use [`TopicsWorker::compute_epoch_at`] to process an
    /// explicit epoch.
    #[instrument(skip(self))]
    pub fn compute_epoch(&self) -> Result<EpochComputationStats, EngineError> {
        let _guard = self.write()?;
        let current = self.clock.current_epoch_id()?;
        if current == 0 {
            debug!("No completed epoch yet");
            self.load_cache_locked()?;
            return Ok(EpochComputationStats::default());
        }
        let stats = self.engine.process_epoch(current - 1)?;
        self.load_cache_locked()?;
        Ok(stats)
    }

    /// Compute an explicit epoch. Used by tests and the admin surface.
    #[instrument(skip(self))]
    pub fn compute_epoch_at(&self, epoch: EpochId) -> Result<EpochComputationStats, EngineError> {
        let _guard = self.write()?;
        let stats = self.engine.process_epoch(epoch)?;
        self.load_cache_locked()?;
        Ok(stats)
    }

    /// Block `topic` for this user.
    #[instrument(skip(self))]
    pub fn revoke_consent_for_topic(&self, topic: &Topic) -> Result<(), EngineError> {
        let _guard = self.write()?;
        self.consent.block(topic)?;
        self.load_cache_locked()
    }

    /// Unblock `topic`.
    #[instrument(skip(self))]
    pub fn restore_consent_for_topic(&self, topic: &Topic) -> Result<(), EngineError> {
        let _guard = self.write()?;
        self.consent.unblock(topic)?;
        self.load_cache_locked()
    }

    /// Every non-blocked topic currently cached.
    pub fn get_known_topics_with_consent(&self) -> Result<Vec<Topic>, EngineError> {
        let _guard = self.read()?;
        let current = self.clock.current_epoch_id()?;
        self.cache.get_known_topics_with_consent(current)
    }

    /// The user's blocked topics.
    pub fn get_topics_with_revoked_consent(&self) -> Result<Vec<Topic>, EngineError> {
        let _guard = self.read()?;
        self.consent.retrieve_all()
    }

    /// Wipe all tables except `excluded` and empty the cache.
    #[instrument(skip(self))]
    pub fn clear_all_topics_data(&self, excluded: &[TopicsTable]) -> Result<(), EngineError> {
        let _guard = self.write()?;
        self.cache.clear_all_topics_data(excluded)
    }

    /// Remove uninstalled apps, then backfill newly installed ones.
    ///
    /// Uninstall runs first so an app removed and reinstalled between two
    /// passes starts fresh.
    #[instrument(skip(self))]
    pub fn reconcile_application_update(&self) -> Result<(), EngineError> {
        let _guard = self.write()?;
        let current = self.clock.current_epoch_id()?;
        let removed = self.reconciler.reconcile_uninstalled_apps(current)?;
        let added = self.reconciler.reconcile_installed_apps(current)?;
        self.load_cache_locked()?;
        info!(
            removed = removed.len(),
            added = added.len(),
            "Application update reconciled"
        );
        Ok(())
    }

    /// Single-app install path.
    #[instrument(skip(self))]
    pub fn handle_app_installation(&self, app: &str) -> Result<usize, EngineError> {
        let _guard = self.write()?;
        let current = self.clock.current_epoch_id()?;
        let assigned = self.reconciler.handle_app_installation(app, current)?;
        self.load_cache_locked()?;
        Ok(assigned)
    }

    /// Single-app uninstall path.
    #[instrument(skip(self))]
    pub fn handle_app_uninstallation(&self, app: &str) -> Result<(), EngineError> {
        let _guard = self.write()?;
        let current = self.clock.current_epoch_id()?;
        self.reconciler.handle_app_uninstallation(app, current)?;
        self.load_cache_locked()
    }

    pub fn status(&self) -> Result<WorkerStatus, EngineError> {
        let _guard = self.read()?;
        let current_epoch = self.clock.current_epoch_id()?;
        let blocked_topics_count = self.consent.retrieve_all()?.len();
        let row_counts = self.storage.get_stats()?.row_counts;
        debug!(current_epoch, "Collected worker status");
        Ok(WorkerStatus {
            current_epoch,
            cache: self.cache.dump()?,
            blocked_topics_count,
            row_counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::MockClassifier;
    use crate::clock::FixedClock;
    use crate::selection::seeded_rng;
    use crate::stats::RecordingStatsLogger;
    use tempfile::TempDir;

    const PERIOD: i64 = 1_000;

    fn t(id: i32) -> Topic {
        Topic::new(id, 1, 1)
    }

    struct Fixture {
        worker: TopicsWorker,
        clock: Arc<FixedClock>,
        apps: Arc<StaticAppLister>,
        classifier: Arc<MockClassifier>,
        _temp: TempDir,
    }

    /// app1 is classified into every regular topic, so any regular draw
    /// is learnable by app1 and its SDKs. Topic 6 is the random slice.
    fn fixture(percentage_for_random_topic: u32) -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path()).unwrap());
        let clock = Arc::new(FixedClock::new(0));
        let apps = Arc::new(StaticAppLister::new(["app1", "app2"]));
        let classifier = Arc::new(
            MockClassifier::new(BTreeMap::from([
                ("app1".to_string(), (1..=5).map(t).collect()),
                ("app2".to_string(), vec![t(1), t(3)]),
            ]))
            .with_top_topics((1..=6).map(t).collect()),
        );
        let deps = WorkerDeps {
            classifier: classifier.clone(),
            app_lister: apps.clone(),
            clock: clock.clone(),
            stats: Arc::new(RecordingStatsLogger::new()),
            rng: seeded_rng(3),
        };
        let settings = EngineSettings {
            epoch_period_ms: PERIOD,
            percentage_for_random_topic,
            ..EngineSettings::default()
        };
        let worker = TopicsWorker::new(storage, settings, deps).unwrap();
        Fixture {
            worker,
            clock,
            apps,
            classifier,
            _temp: temp,
        }
    }

    /// Record usage in epoch 0 and compute it from epoch 1.
    fn run_first_epoch(f: &Fixture) {
        assert_eq!(f.worker.current_epoch().unwrap(), 0);
        f.worker.record_usage("app1", "").unwrap();
        f.worker.record_usage("app1", "sdk1").unwrap();
        f.worker.record_usage("app2", "").unwrap();
        f.clock.set_millis(PERIOD);
        f.worker.compute_epoch().unwrap();
    }

    #[test]
    fn test_compute_then_get_topics() {
        let f = fixture(0);
        run_first_epoch(&f);

        let topics = f.worker.get_topics("app1", "").unwrap();
        assert_eq!(topics.len(), 1);
        assert!((1..=5).map(t).any(|topic| topic == topics[0]));
        assert_eq!(f.worker.get_topics("app1", "sdk1").unwrap(), topics);

        let status = f.worker.status().unwrap();
        assert_eq!(status.current_epoch, 1);
        assert_eq!(status.cache.cached_epochs, vec![0]);
        assert_eq!(status.cache.loaded_for_epoch, Some(1));
    }

    #[test]
    fn test_compute_epoch_processes_finished_epoch() {
        let f = fixture(0);
        run_first_epoch(&f);
        f.worker.record_usage("app2", "sdk2").unwrap();
        f.worker.compute_epoch().unwrap();

        let store = TopicStore::new(f.worker.storage().clone());
        assert_eq!(store.classification_topics(0).unwrap().len(), 2);
        assert!(!store.returned_topics(0, 0).unwrap().is_empty());
        // Epoch 1 is still open: its usage is recorded but not computed
        assert_eq!(store.usage_map(1).unwrap().len(), 1);
        assert!(store.classification_topics(1).unwrap().is_empty());
        assert!(store.returned_topics(1, 1).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path()).unwrap());
        let deps = WorkerDeps {
            classifier: Arc::new(MockClassifier::default()),
            app_lister: Arc::new(StaticAppLister::default()),
            clock: Arc::new(FixedClock::new(0)),
            stats: Arc::new(RecordingStatsLogger::new()),
            rng: seeded_rng(0),
        };
        let settings = EngineSettings {
            number_of_top_topics: 0,
            ..EngineSettings::default()
        };
        assert!(matches!(
            TopicsWorker::new(storage, settings, deps),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_unloaded_cache_is_empty() {
        let f = fixture(0);
        f.worker.record_usage("app1", "").unwrap();
        assert!(f.worker.get_topics("app1", "").unwrap().is_empty());
        assert!(f.worker.get_known_topics_with_consent().unwrap().is_empty());
    }

    #[test]
    fn test_revoke_and_restore_consent() {
        let f = fixture(100);
        run_first_epoch(&f);
        let known = f.worker.get_known_topics_with_consent().unwrap();
        assert_eq!(known, vec![t(6)]);

        f.worker.revoke_consent_for_topic(&t(6)).unwrap();
        assert!(f.worker.get_known_topics_with_consent().unwrap().is_empty());
        assert!(f.worker.get_topics("app1", "").unwrap().is_empty());
        assert_eq!(f.worker.get_topics_with_revoked_consent().unwrap(), vec![t(6)]);

        f.worker.restore_consent_for_topic(&t(6)).unwrap();
        assert_eq!(f.worker.get_known_topics_with_consent().unwrap(), known);
        assert_eq!(f.worker.get_topics("app1", "").unwrap(), vec![t(6)]);
    }

    #[test]
    fn test_sdk_backfill_random_topic_on_first_query() {
        let f = fixture(100);
        run_first_epoch(&f);

        // late-sdk never called, but random-slice topics are learnable by anyone
        assert_eq!(f.worker.get_topics("app1", "late-sdk").unwrap(), vec![t(6)]);
        assert_eq!(f.worker.status().unwrap().cache.returned_topic_rows, 4);
    }

    #[test]
    fn test_sdk_backfill_skips_unlearnable_topic() {
        let f = fixture(0);
        run_first_epoch(&f);

        assert!(f.worker.get_topics("app1", "late-sdk").unwrap().is_empty());
        assert!(f.worker.get_topics("app1", "late-sdk").unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_uninstall_and_install() {
        let f = fixture(100);
        run_first_epoch(&f);

        f.apps.uninstall("app1").unwrap();
        f.apps.install("app3").unwrap();
        f.worker.reconcile_application_update().unwrap();

        assert!(f.worker.get_topics("app1", "").unwrap().is_empty());
        assert!(f.worker.get_topics("app1", "sdk1").unwrap().is_empty());
        assert_eq!(f.worker.get_topics("app3", "").unwrap(), vec![t(6)]);

        let before = f.worker.status().unwrap().row_counts;
        f.worker.reconcile_application_update().unwrap();
        assert_eq!(f.worker.status().unwrap().row_counts, before);
    }

    #[test]
    fn test_single_app_install_and_uninstall() {
        let f = fixture(100);
        run_first_epoch(&f);

        assert_eq!(f.worker.handle_app_installation("app4").unwrap(), 1);
        assert_eq!(f.worker.get_topics("app4", "").unwrap(), vec![t(6)]);

        f.worker.handle_app_uninstallation("app4").unwrap();
        assert!(f.worker.get_topics("app4", "").unwrap().is_empty());
    }

    #[test]
    fn test_classifier_failure_leaves_no_topics() {
        let f = fixture(100);
        f.classifier.set_failing(true);
        run_first_epoch(&f);
        assert!(f.worker.get_topics("app1", "").unwrap().is_empty());
    }

    #[test]
    fn test_clear_all_topics_data() {
        let f = fixture(100);
        run_first_epoch(&f);
        f.worker.revoke_consent_for_topic(&t(9)).unwrap();

        f.worker
            .clear_all_topics_data(&[TopicsTable::BlockedTopics])
            .unwrap();
        assert!(f.worker.get_topics("app1", "").unwrap().is_empty());
        assert_eq!(f.worker.get_topics_with_revoked_consent().unwrap(), vec![t(9)]);

        f.worker.clear_all_topics_data(&[]).unwrap();
        assert!(f.worker.get_topics_with_revoked_consent().unwrap().is_empty());
    }

    #[test]
    fn test_single_app_paths_validate_input() {
        let f = fixture(0);
        assert!(matches!(
            f.worker.handle_app_installation(""),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            f.worker.get_topics("", "sdk"),
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
