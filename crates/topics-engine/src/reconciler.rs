//! Keeps per-app state consistent with the installed app set.
//!
//! Uninstalled apps lose every row they own. When an app was the only
//! contributor to a regular top topic, that topic's assignments are
//! withdrawn from every caller in the epoch: without a contributor, the
//! topic would reveal the removed app. Newly installed apps get topics
//! backfilled from past epochs so they are not distinguishable by an
//! empty answer.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use topics_storage::StorageBatch;
use topics_types::{AppSdk, Contributor, EngineSettings, EpochId, Topic};

use crate::apps::InstalledAppLister;
use crate::error::{require_app, EngineError};
use crate::selection::{is_topic_learnable_by_caller, lock_rng, select_assigned_topic, SharedRng};
use crate::store::{ContributorsMap, TopicStore};

/// Reconciles stored topics state against installed apps.
pub struct InstallReconciler {
    store: Arc<TopicStore>,
    app_lister: Arc<dyn InstalledAppLister>,
    settings: EngineSettings,
    rng: SharedRng,
}

impl InstallReconciler {
    pub fn new(
        store: Arc<TopicStore>,
        app_lister: Arc<dyn InstalledAppLister>,
        settings: EngineSettings,
        rng: SharedRng,
    ) -> Self {
        Self {
            store,
            app_lister,
            settings,
            rng,
        }
    }

    /// Past epochs used for assignment, most recent first:
    /// `current - 1` down to `current - lookback`, never below 0.
    fn lookback_epochs(&self, current_epoch: EpochId) -> impl Iterator<Item = EpochId> {
        let lower = (current_epoch - self.settings.lookback()).max(0);
        (lower..current_epoch).rev()
    }

    fn known_apps(&self) -> Result<BTreeSet<String>, EngineError> {
        let mut apps = self.store.apps_with_usage()?;
        apps.extend(self.store.apps_with_returned_topics()?);
        Ok(apps)
    }

    /// Apps with stored state that are no longer installed.
    pub fn unhandled_uninstalled_apps(
        &self,
        installed: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, EngineError> {
        Ok(self.known_apps()?.difference(installed).cloned().collect())
    }

    /// Installed apps without any stored state.
    pub fn unhandled_installed_apps(
        &self,
        installed: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, EngineError> {
        let known = self.known_apps()?;
        Ok(installed.difference(&known).cloned().collect())
    }

    /// Erase every app that is no longer installed. Returns the erased apps.
    #[instrument(skip(self))]
    pub fn reconcile_uninstalled_apps(
        &self,
        current_epoch: EpochId,
    ) -> Result<BTreeSet<String>, EngineError> {
        let installed = self.app_lister.list_installed()?;
        let uninstalled = self.unhandled_uninstalled_apps(&installed)?;
        for app in &uninstalled {
            self.handle_app_uninstallation(app, current_epoch)?;
        }
        if !uninstalled.is_empty() {
            info!(count = uninstalled.len(), "Reconciled uninstalled apps");
        }
        Ok(uninstalled)
    }

    /// Backfill topics for installed apps with no state. Returns those apps.
    #[instrument(skip(self))]
    pub fn reconcile_installed_apps(
        &self,
        current_epoch: EpochId,
    ) -> Result<BTreeSet<String>, EngineError> {
        let installed = self.app_lister.list_installed()?;
        let newly_installed = self.unhandled_installed_apps(&installed)?;
        for app in &newly_installed {
            self.assign_topics_to_newly_installed_apps(app, current_epoch)?;
        }
        if !newly_installed.is_empty() {
            info!(count = newly_installed.len(), "Reconciled installed apps");
        }
        Ok(newly_installed)
    }

    /// Remove one app and repair the contributor invariant, atomically.
    #[instrument(skip(self))]
    pub fn handle_app_uninstallation(
        &self,
        app: &str,
        current_epoch: EpochId,
    ) -> Result<(), EngineError> {
        require_app(app)?;
        let mut batch = StorageBatch::new();
        self.handle_top_topics_without_contributors(current_epoch, app, &mut batch)?;
        self.store.stage_app_erase(&mut batch, app)?;
        let rows = self.store.write(batch)?;
        debug!(rows, "Erased app data");
        Ok(())
    }

    /// Give a freshly installed app topics for past epochs.
    #[instrument(skip(self))]
    pub fn handle_app_installation(
        &self,
        app: &str,
        current_epoch: EpochId,
    ) -> Result<usize, EngineError> {
        self.assign_topics_to_newly_installed_apps(app, current_epoch)
    }

    /// Stage withdrawal of topics that lose their only contributor when
    /// `uninstalled_app` goes away.
    ///
    /// Every computed epoch still holding a contributor row for the app is
    /// repaired, not just the lookback window: the app's rows go in all of
    /// them. A regular top topic whose contributors are `{uninstalled_app}`
    /// plus at most padding has all its assignments in that epoch deleted.
    /// Returns the `(epoch, topic id)` pairs withdrawn.
    pub fn handle_top_topics_without_contributors(
        &self,
        current_epoch: EpochId,
        uninstalled_app: &str,
        batch: &mut StorageBatch,
    ) -> Result<Vec<(EpochId, i32)>, EngineError> {
        let removed = Contributor::app(uninstalled_app);
        let mut withdrawn = Vec::new();

        let epochs = self.store.epochs_with_contributor(&removed)?;
        for epoch in epochs.into_iter().filter(|epoch| *epoch < current_epoch) {
            let orphaned: Vec<i32> = self
                .store
                .topic_contributors(epoch)?
                .into_iter()
                .filter(|(_, members)| {
                    members.contains(&removed)
                        && members
                            .iter()
                            .all(|member| *member == removed || member.is_padding())
                })
                .map(|(topic_id, _)| topic_id)
                .collect();

            for topic_id in orphaned {
                let rows = self
                    .store
                    .stage_delete_returned_topic_id(batch, epoch, topic_id)?;
                debug!(epoch, topic_id, rows, "Withdrawing topic without contributors");
                withdrawn.push((epoch, topic_id));
            }
        }
        Ok(withdrawn)
    }

    /// Assign one topic per lookback epoch to `(app, "")`.
    ///
    /// Draws use the same regular/random split as epoch computation, with
    /// regular topics lacking a real contributor left out. Returns the
    /// number of epochs assigned.
    #[instrument(skip(self))]
    pub fn assign_topics_to_newly_installed_apps(
        &self,
        app: &str,
        current_epoch: EpochId,
    ) -> Result<usize, EngineError> {
        require_app(app)?;
        let number_of_top_topics = self.settings.top_topics();
        let caller = AppSdk::app_only(app);
        let mut assigned = 0;

        for epoch in self.lookback_epochs(current_epoch) {
            let top_topics = self.store.top_topics(epoch)?;
            if top_topics.is_empty() {
                debug!(epoch, "Empty top topics, nothing to assign");
                continue;
            }

            let split = number_of_top_topics.min(top_topics.len());
            let contributors = self.store.topic_contributors(epoch)?;
            let regular =
                filter_regular_topics_without_contributors(&top_topics[..split], &contributors);
            let random = &top_topics[split..];

            let topic = {
                let mut rng = lock_rng(&self.rng)?;
                select_assigned_topic(
                    &regular,
                    random,
                    self.settings.percentage_for_random_topic,
                    &mut *rng,
                )
            };
            let Some(topic) = topic else {
                debug!(epoch, "No topic available to assign");
                continue;
            };

            self.store.persist_returned_topic(epoch, &caller, topic)?;
            debug!(epoch, topic = %topic, "Assigned topic to newly installed app");
            assigned += 1;
        }
        Ok(assigned)
    }

    /// Give `(app, sdk)` the app's own past topics that the SDK could learn.
    ///
    /// Skipped when `sdk` is empty or already has any assignment in the
    /// lookback window. Learnability for epoch `e` is checked against the
    /// learner sets of `[e - lookback + 1, e]`. Returns whether anything
    /// was assigned.
    #[instrument(skip(self))]
    pub fn assign_topics_to_sdk_for_app_installation(
        &self,
        app: &str,
        sdk: &str,
        current_epoch: EpochId,
    ) -> Result<bool, EngineError> {
        require_app(app)?;
        if sdk.is_empty() {
            return Ok(false);
        }

        let lookback = self.settings.lookback();
        let app_only = AppSdk::app_only(app);
        let app_sdk = AppSdk::new(app, sdk);

        let past = self
            .store
            .returned_topics(current_epoch - lookback, current_epoch - 1)?;
        if past.values().any(|callers| callers.contains_key(&app_sdk)) {
            return Ok(false);
        }

        let mut assigned = false;
        for epoch in self.lookback_epochs(current_epoch) {
            let Some(topic) = past.get(&epoch).and_then(|callers| callers.get(&app_only)) else {
                continue;
            };
            let callers_can_learn = self.store.callers_can_learn_map(epoch, lookback)?;
            let top_topics = self.store.top_topics(epoch)?;
            if is_topic_learnable_by_caller(
                topic,
                sdk,
                &callers_can_learn,
                &top_topics,
                self.settings.top_topics(),
            ) {
                self.store.persist_returned_topic(epoch, &app_sdk, *topic)?;
                assigned = true;
            }
        }
        if assigned {
            info!("Backfilled SDK topics");
        }
        Ok(assigned)
    }

    /// Erase every row owned by `apps`, without contributor repair.
    ///
    /// Unknown apps are a no-op; an empty list is rejected.
    #[instrument(skip(self))]
    pub fn delete_app_data_from_table_by_apps(&self, apps: &[String]) -> Result<(), EngineError> {
        if apps.is_empty() {
            return Err(EngineError::InvalidArgument(
                "app list must not be empty".to_string(),
            ));
        }
        for app in apps {
            require_app(app)?;
        }

        let mut batch = StorageBatch::new();
        for app in apps {
            self.store.stage_app_erase(&mut batch, app)?;
        }
        let rows = self.store.write(batch)?;
        debug!(rows, "Deleted app data");
        Ok(())
    }
}

/// Regular topics with at least one real contributor.
pub fn filter_regular_topics_without_contributors(
    regular: &[Topic],
    contributors: &ContributorsMap,
) -> Vec<Topic> {
    regular
        .iter()
        .filter(|topic| {
            contributors
                .get(&topic.topic_id)
                .is_some_and(|members| members.iter().any(|member| !member.is_padding()))
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::StaticAppLister;
    use crate::selection::{seeded_rng, CallersCanLearnMap};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use topics_storage::Storage;

    fn t(id: i32) -> Topic {
        Topic::new(id, 1, 1)
    }

    fn top6() -> Vec<Topic> {
        (1..=6).map(t).collect()
    }

    struct Fixture {
        store: Arc<TopicStore>,
        apps: Arc<StaticAppLister>,
        reconciler: InstallReconciler,
        _temp: TempDir,
    }

    fn fixture(installed: &[&str]) -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path()).unwrap());
        let store = Arc::new(TopicStore::new(storage));
        let apps = Arc::new(StaticAppLister::new(installed.iter().copied()));
        let reconciler = InstallReconciler::new(
            store.clone(),
            apps.clone(),
            EngineSettings::default(),
            seeded_rng(11),
        );
        Fixture {
            store,
            apps,
            reconciler,
            _temp: temp,
        }
    }

    /// app1 → {1, 2}, app2 → {1, 3}; top topics 1..=6 with 4, 5 padding.
    fn seed_epoch(store: &TopicStore, epoch: EpochId) {
        let app_topics = BTreeMap::from([
            ("app1".to_string(), vec![t(1), t(2)]),
            ("app2".to_string(), vec![t(1), t(3)]),
        ]);
        let contributors = ContributorsMap::from([
            (1, BTreeSet::from([Contributor::app("app1"), Contributor::app("app2")])),
            (2, BTreeSet::from([Contributor::app("app1")])),
            (3, BTreeSet::from([Contributor::app("app2")])),
            (4, BTreeSet::from([Contributor::Padding])),
            (5, BTreeSet::from([Contributor::Padding])),
        ]);
        let mut batch = StorageBatch::new();
        store
            .stage_classification_topics(&mut batch, epoch, &app_topics)
            .unwrap();
        store.stage_top_topics(&mut batch, epoch, &top6()).unwrap();
        store
            .stage_topic_contributors(&mut batch, epoch, &contributors)
            .unwrap();
        store.write(batch).unwrap();
        store.record_usage(epoch, "app1", "").unwrap();
        store.record_usage(epoch, "app2", "").unwrap();
    }

    #[test]
    fn test_uninstall_cascades_to_other_apps() {
        let f = fixture(&["app2", "app3"]);
        seed_epoch(&f.store, 1);
        let returned = BTreeMap::from([
            (AppSdk::app_only("app1"), t(2)),
            (AppSdk::app_only("app2"), t(1)),
            (AppSdk::app_only("app3"), t(2)),
            (AppSdk::new("app3", "sdk"), t(2)),
            (AppSdk::new("app3", "sdk2"), t(3)),
        ]);
        let mut batch = StorageBatch::new();
        f.store.stage_returned_topics(&mut batch, 1, &returned).unwrap();
        f.store.write(batch).unwrap();

        let removed = f.reconciler.reconcile_uninstalled_apps(2).unwrap();
        assert_eq!(removed, BTreeSet::from(["app1".to_string()]));

        let remaining = &f.store.returned_topics(1, 1).unwrap()[&1];
        // Topic 2 only had app1 as contributor: withdrawn from everyone
        assert_eq!(
            remaining.keys().cloned().collect::<Vec<_>>(),
            vec![AppSdk::app_only("app2"), AppSdk::new("app3", "sdk2")]
        );
        let contributors = f.store.topic_contributors(1).unwrap();
        assert_eq!(contributors[&1], BTreeSet::from([Contributor::app("app2")]));
        assert!(!contributors.contains_key(&2));
    }

    #[test]
    fn test_uninstall_repairs_epochs_beyond_lookback() {
        let f = fixture(&["app2"]);
        // Epoch 1 is outside the lookback of epoch 5 but still in history
        seed_epoch(&f.store, 1);
        seed_epoch(&f.store, 4);
        for epoch in [1, 4] {
            f.store
                .persist_returned_topic(epoch, &AppSdk::app_only("app2"), t(2))
                .unwrap();
        }

        f.reconciler.handle_app_uninstallation("app1", 5).unwrap();

        assert!(f.store.returned_topics(1, 4).unwrap().is_empty());
        assert!(f
            .store
            .epochs_with_contributor(&Contributor::app("app1"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_cascade_reports_withdrawn_topics() {
        let f = fixture(&["app2"]);
        seed_epoch(&f.store, 1);
        seed_epoch(&f.store, 2);

        let mut batch = StorageBatch::new();
        let withdrawn = f
            .reconciler
            .handle_top_topics_without_contributors(10, "app1", &mut batch)
            .unwrap();
        assert_eq!(withdrawn, vec![(1, 2), (2, 2)]);

        // Nothing computed before epoch 1
        let mut batch = StorageBatch::new();
        assert!(f
            .reconciler
            .handle_top_topics_without_contributors(1, "app1", &mut batch)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let f = fixture(&["app2", "app9"]);
        seed_epoch(&f.store, 1);
        seed_epoch(&f.store, 2);

        let removed = f.reconciler.reconcile_uninstalled_apps(3).unwrap();
        let added = f.reconciler.reconcile_installed_apps(3).unwrap();
        assert_eq!(removed, BTreeSet::from(["app1".to_string()]));
        assert_eq!(added, BTreeSet::from(["app9".to_string()]));

        let snapshot = f.store.returned_topics(0, 3).unwrap();
        assert!(f.reconciler.reconcile_uninstalled_apps(3).unwrap().is_empty());
        assert!(f.reconciler.reconcile_installed_apps(3).unwrap().is_empty());
        assert_eq!(f.store.returned_topics(0, 3).unwrap(), snapshot);
    }

    #[test]
    fn test_newly_installed_app_skips_padding_topics() {
        let f = fixture(&["new"]);
        seed_epoch(&f.store, 0);
        seed_epoch(&f.store, 1);
        seed_epoch(&f.store, 2);

        for _ in 0..20 {
            let assigned = f
                .reconciler
                .assign_topics_to_newly_installed_apps("new", 3)
                .unwrap();
            assert_eq!(assigned, 3);
            for epoch in 0..3 {
                let returned = f.store.returned_topics(epoch, epoch).unwrap();
                let topic = returned[&epoch][&AppSdk::app_only("new")];
                assert!([t(1), t(2), t(3), t(6)].contains(&topic));
            }
        }
    }

    #[test]
    fn test_newly_installed_app_without_top_topics() {
        let f = fixture(&["new"]);
        assert_eq!(
            f.reconciler
                .assign_topics_to_newly_installed_apps("new", 2)
                .unwrap(),
            0
        );
        assert!(f.store.returned_topics(0, 2).unwrap().is_empty());
    }

    #[test]
    fn test_sdk_backfill_requires_learnability() {
        let f = fixture(&["app"]);
        seed_epoch(&f.store, 1);
        seed_epoch(&f.store, 2);
        f.store
            .persist_returned_topic(1, &AppSdk::app_only("app"), t(2))
            .unwrap();
        f.store
            .persist_returned_topic(2, &AppSdk::app_only("app"), t(3))
            .unwrap();

        // sdk learned topic 2 in epoch 0, within the window ending at epoch 1
        let mut batch = StorageBatch::new();
        f.store
            .stage_callers_can_learn(
                &mut batch,
                0,
                &CallersCanLearnMap::from([(t(2), BTreeSet::from(["sdk".to_string()]))]),
            )
            .unwrap();
        f.store.write(batch).unwrap();

        assert!(f
            .reconciler
            .assign_topics_to_sdk_for_app_installation("app", "sdk", 3)
            .unwrap());
        let returned = f.store.returned_topics(1, 2).unwrap();
        assert_eq!(returned[&1].get(&AppSdk::new("app", "sdk")), Some(&t(2)));
        assert_eq!(returned[&2].get(&AppSdk::new("app", "sdk")), None);

        // Already backfilled
        assert!(!f
            .reconciler
            .assign_topics_to_sdk_for_app_installation("app", "sdk", 3)
            .unwrap());
        assert!(!f
            .reconciler
            .assign_topics_to_sdk_for_app_installation("app", "", 3)
            .unwrap());
    }

    #[test]
    fn test_sdk_backfill_random_topic() {
        let f = fixture(&["app"]);
        seed_epoch(&f.store, 1);
        f.store
            .persist_returned_topic(1, &AppSdk::app_only("app"), t(6))
            .unwrap();

        assert!(f
            .reconciler
            .assign_topics_to_sdk_for_app_installation("app", "any-sdk", 2)
            .unwrap());
    }

    #[test]
    fn test_delete_app_data() {
        let f = fixture(&[]);
        seed_epoch(&f.store, 1);
        assert!(matches!(
            f.reconciler.delete_app_data_from_table_by_apps(&[]),
            Err(EngineError::InvalidArgument(_))
        ));

        f.reconciler
            .delete_app_data_from_table_by_apps(&["app1".to_string(), "ghost".to_string()])
            .unwrap();
        assert_eq!(
            f.store.apps_with_usage().unwrap(),
            BTreeSet::from(["app2".to_string()])
        );
    }

    #[test]
    fn test_real_time_install_then_uninstall() {
        let f = fixture(&[]);
        seed_epoch(&f.store, 1);
        f.apps.install("fresh").unwrap();

        assert_eq!(f.reconciler.handle_app_installation("fresh", 2).unwrap(), 1);
        assert!(f.store.apps_with_returned_topics().unwrap().contains("fresh"));

        f.apps.uninstall("fresh").unwrap();
        f.reconciler.handle_app_uninstallation("fresh", 2).unwrap();
        assert!(!f.store.apps_with_returned_topics().unwrap().contains("fresh"));
    }

    #[test]
    fn test_filter_regular_topics() {
        let contributors = ContributorsMap::from([
            (1, BTreeSet::from([Contributor::app("a")])),
            (2, BTreeSet::from([Contributor::Padding])),
        ]);
        assert_eq!(
            filter_regular_topics_without_contributors(&[t(1), t(2), t(3)], &contributors),
            vec![t(1)]
        );
    }
}
