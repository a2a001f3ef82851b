//! Epoch computation.
//!
//! `process_epoch` advances one epoch of global state:
//! 1. Read this epoch's usage as `app → [sdk]`
//! 2. Classify the apps
//! 3. Derive which callers can learn each classified topic
//! 4. Ask the classifier for the top topics (stop here when empty)
//! 5. Record contributors of the regular top topics
//! 6. Draw one topic per app and disclose it to learnable callers
//! 7. Garbage collect outdated epochs, whatever happened above

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use topics_storage::column_families::{
    CF_APP_CLASSIFICATION_TOPICS, CF_APP_USAGE_HISTORY, CF_CALLER_CAN_LEARN, CF_RETURNED_TOPICS,
    CF_TOPIC_CONTRIBUTORS, CF_TOP_TOPICS, CF_USAGE_HISTORY,
};
use topics_storage::StorageBatch;
use topics_types::{AppSdk, Contributor, EngineSettings, EpochId, Topic};

use crate::classifier::Classifier;
use crate::error::{require_app, EngineError};
use crate::selection::{
    is_topic_learnable_by_caller, lock_rng, select_assigned_topic, CallersCanLearnMap, SharedRng,
};
use crate::stats::{EpochComputationStats, StatsLogger};
use crate::store::{ContributorsMap, TopicStore};

/// Tables trimmed to `number_of_epochs_to_keep_in_history`.
const EPOCH_HISTORY_TABLES: &[&str] = &[
    CF_APP_CLASSIFICATION_TOPICS,
    CF_TOP_TOPICS,
    CF_RETURNED_TOPICS,
    CF_USAGE_HISTORY,
    CF_APP_USAGE_HISTORY,
    CF_TOPIC_CONTRIBUTORS,
];

/// Tables derived from one epoch's usage; recomputing the epoch replaces them.
const EPOCH_DERIVED_TABLES: &[&str] = &[
    CF_APP_CLASSIFICATION_TOPICS,
    CF_CALLER_CAN_LEARN,
    CF_TOP_TOPICS,
    CF_TOPIC_CONTRIBUTORS,
    CF_RETURNED_TOPICS,
];

/// Advances epochs of global topics state.
pub struct EpochEngine {
    store: Arc<TopicStore>,
    classifier: Arc<dyn Classifier>,
    settings: EngineSettings,
    rng: SharedRng,
    stats: Arc<dyn StatsLogger>,
}

impl EpochEngine {
    pub fn new(
        store: Arc<TopicStore>,
        classifier: Arc<dyn Classifier>,
        settings: EngineSettings,
        rng: SharedRng,
        stats: Arc<dyn StatsLogger>,
    ) -> Self {
        Self {
            store,
            classifier,
            settings,
            rng,
            stats,
        }
    }

    /// Record a call from `(app, sdk)` in `epoch`. An empty sdk means the
    /// app called directly.
    pub fn record_usage(&self, epoch: EpochId, app: &str, sdk: &str) -> Result<(), EngineError> {
        require_app(app)?;
        self.store.record_usage(epoch, app, sdk)
    }

    /// Compute `epoch`, then garbage collect.
    ///
    /// A classifier failure or an empty top topics list ends the
    /// computation early without error. Garbage collection runs even if
    /// the computation itself failed; the computation error wins.
    #[instrument(skip(self))]
    pub fn process_epoch(&self, epoch: EpochId) -> Result<EpochComputationStats, EngineError> {
        let computed = self.compute(epoch);
        let collected = self.garbage_collect_outdated_epoch_data(epoch);
        let stats = computed?;
        collected?;

        self.stats.log_epoch_stats(epoch, stats);
        info!(
            epoch,
            returned = stats.returned_topics_count,
            "Epoch computation complete"
        );
        Ok(stats)
    }

    fn compute(&self, epoch: EpochId) -> Result<EpochComputationStats, EngineError> {
        let number_of_top_topics = self.settings.top_topics();
        let usage = self.store.usage_map(epoch)?;
        let mut stats = EpochComputationStats {
            apps_considered_count: usage.len(),
            ..EpochComputationStats::default()
        };

        let apps: BTreeSet<String> = usage.keys().cloned().collect();
        let app_topics = match self.classifier.classify(&apps) {
            Ok(app_topics) => app_topics,
            Err(e) => {
                warn!(epoch, error = %e, "Classification failed, skipping epoch assignment");
                return Ok(stats);
            }
        };

        let callers_this_epoch = compute_callers_can_learn_map(&usage, &app_topics);

        let mut batch = StorageBatch::new();
        let replaced = self
            .store
            .stage_delete_epoch(&mut batch, EPOCH_DERIVED_TABLES, epoch)?;
        if replaced > 0 {
            debug!(epoch, rows = replaced, "Replacing earlier computation of epoch");
        }
        self.store
            .stage_classification_topics(&mut batch, epoch, &app_topics)?;
        self.store
            .stage_callers_can_learn(&mut batch, epoch, &callers_this_epoch)?;

        let top_topics = match self.classifier.top_topics(
            &app_topics,
            number_of_top_topics,
            self.settings.random_topics(),
        ) {
            Ok(top_topics) => top_topics,
            Err(e) => {
                warn!(epoch, error = %e, "Top topics selection failed, skipping epoch assignment");
                Vec::new()
            }
        };
        if top_topics.is_empty() {
            warn!(epoch, "Empty top topics, aborting epoch assignment");
            self.store.write(batch)?;
            return Ok(stats);
        }
        stats.top_topic_count = top_topics.len();
        self.store.stage_top_topics(&mut batch, epoch, &top_topics)?;

        let contributors =
            compute_topic_contributors(&app_topics, &top_topics, number_of_top_topics);
        stats.padded_random_topics_count = contributors
            .values()
            .filter(|members| members.iter().all(Contributor::is_padding))
            .count();
        self.store
            .stage_topic_contributors(&mut batch, epoch, &contributors)?;

        // Learnability looks back over earlier epochs as well as this one
        let mut callers_can_learn = self
            .store
            .callers_can_learn_map(epoch - 1, self.settings.lookback() - 1)?;
        for (topic, callers) in &callers_this_epoch {
            callers_can_learn
                .entry(*topic)
                .or_default()
                .extend(callers.iter().cloned());
        }

        let returned = {
            let mut rng = lock_rng(&self.rng)?;
            compute_returned_app_sdk_topics(
                &callers_can_learn,
                &usage,
                &top_topics,
                number_of_top_topics,
                self.settings.percentage_for_random_topic,
                &mut *rng,
            )
        };
        stats.returned_topics_count = returned.len();
        self.store
            .stage_returned_topics(&mut batch, epoch, &returned)?;

        let written = self.store.write(batch)?;
        debug!(epoch, rows = written, "Persisted epoch");
        Ok(stats)
    }

    /// Delete epoch data no longer reachable by any query.
    ///
    /// History tables keep `number_of_epochs_to_keep_in_history` epochs.
    /// Learner sets keep twice that, since install-time backfill checks
    /// learnability up to one lookback window further back.
    #[instrument(skip(self))]
    pub fn garbage_collect_outdated_epoch_data(
        &self,
        current_epoch: EpochId,
    ) -> Result<usize, EngineError> {
        let history = self.settings.history();
        let mut batch = StorageBatch::new();
        let mut staged = self.store.stage_delete_epochs_up_to(
            &mut batch,
            EPOCH_HISTORY_TABLES,
            current_epoch - history - 1,
        )?;
        staged += self.store.stage_delete_epochs_up_to(
            &mut batch,
            &[CF_CALLER_CAN_LEARN],
            current_epoch - 2 * history - 1,
        )?;
        self.store.write(batch)?;
        if staged > 0 {
            debug!(rows = staged, "Garbage collected outdated epoch data");
        }
        Ok(staged)
    }
}

/// Topic → callers entitled to learn it this epoch.
///
/// Every caller an app used this epoch learns the app's topics: the app
/// itself for direct calls (empty sdk), otherwise the SDK.
pub fn compute_callers_can_learn_map(
    usage: &BTreeMap<String, Vec<String>>,
    app_topics: &BTreeMap<String, Vec<Topic>>,
) -> CallersCanLearnMap {
    let mut map = CallersCanLearnMap::new();
    for (app, topics) in app_topics {
        let Some(sdks) = usage.get(app) else {
            continue;
        };
        for topic in topics {
            let callers = map.entry(*topic).or_default();
            for sdk in sdks {
                if sdk.is_empty() {
                    callers.insert(app.clone());
                } else {
                    callers.insert(sdk.clone());
                }
            }
        }
    }
    map
}

/// Contributor sets of the regular top topics.
///
/// A regular topic no app was classified into only exists to fill the
/// `number_of_top_topics` slots and gets `{Padding}`. Random topics get
/// no entry.
pub fn compute_topic_contributors(
    app_topics: &BTreeMap<String, Vec<Topic>>,
    top_topics: &[Topic],
    number_of_top_topics: usize,
) -> ContributorsMap {
    let mut map = ContributorsMap::new();
    for topic in top_topics.iter().take(number_of_top_topics) {
        let contributors: BTreeSet<Contributor> = app_topics
            .iter()
            .filter(|(_, topics)| topics.contains(topic))
            .map(|(app, _)| Contributor::app(app.clone()))
            .collect();
        let members = if contributors.is_empty() {
            BTreeSet::from([Contributor::Padding])
        } else {
            contributors
        };
        map.entry(topic.topic_id).or_default().extend(members);
    }
    map
}

/// Draw one topic per app and keep it for each learnable caller.
///
/// Apps are visited in key order so a seeded random source gives
/// reproducible assignments.
pub fn compute_returned_app_sdk_topics<R: rand::RngCore + ?Sized>(
    callers_can_learn: &CallersCanLearnMap,
    usage: &BTreeMap<String, Vec<String>>,
    top_topics: &[Topic],
    number_of_top_topics: usize,
    percentage_for_random_topic: u32,
    rng: &mut R,
) -> BTreeMap<AppSdk, Topic> {
    let split = number_of_top_topics.min(top_topics.len());
    let (regular, random) = top_topics.split_at(split);

    let mut returned = BTreeMap::new();
    for (app, sdks) in usage {
        let Some(topic) = select_assigned_topic(regular, random, percentage_for_random_topic, rng)
        else {
            continue;
        };

        if is_topic_learnable_by_caller(
            &topic,
            app,
            callers_can_learn,
            top_topics,
            number_of_top_topics,
        ) {
            returned.insert(AppSdk::app_only(app.clone()), topic);
        }

        for sdk in sdks.iter().filter(|sdk| !sdk.is_empty()) {
            if is_topic_learnable_by_caller(
                &topic,
                sdk,
                callers_can_learn,
                top_topics,
                number_of_top_topics,
            ) {
                returned.insert(AppSdk::new(app.clone(), sdk.clone()), topic);
            }
        }
    }
    returned
}
