//! Typed access to the topics tables.
//!
//! Reads decode JSON rows into domain maps. Writes are staged into a
//! `StorageBatch` so a caller can commit a whole epoch, or a whole app
//! erase with its contributor cascade, as one atomic write.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use topics_storage::column_families::{
    CF_APP_CLASSIFICATION_TOPICS, CF_APP_USAGE_HISTORY, CF_CALLER_CAN_LEARN, CF_CONSENT_FLAGS,
    CF_EPOCH_ORIGIN, CF_RETURNED_TOPICS, CF_TOPIC_CONTRIBUTORS, CF_TOP_TOPICS, CF_USAGE_HISTORY,
};
use topics_storage::keys::{
    contributor_segment, epoch_key, epoch_prefix, topic_segment, EPOCH_ORIGIN_KEY,
};
use topics_storage::{Storage, StorageBatch, TopicsTable};
use topics_types::{AppSdk, Contributor, EpochId, Topic};

use crate::error::EngineError;
use crate::selection::CallersCanLearnMap;

/// `(epoch, app, sdk)` presence fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub epoch: EpochId,
    pub app: String,
    pub sdk: String,
}

/// `(epoch, app)` presence fact, regardless of SDK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppUsageRecord {
    pub epoch: EpochId,
    pub app: String,
}

/// Classifier output for one app in one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub epoch: EpochId,
    pub app: String,
    pub topics: Vec<Topic>,
}

/// One learner of one topic in one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerCanLearnRecord {
    pub epoch: EpochId,
    pub topic: Topic,
    pub caller: String,
}

/// One member of a top topic's contributor set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorRecord {
    pub epoch: EpochId,
    pub topic_id: i32,
    pub contributor: Contributor,
}

/// Topic assigned to a caller in one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnedTopicRecord {
    pub epoch: EpochId,
    pub app: String,
    pub sdk: String,
    pub topic: Topic,
}

impl ReturnedTopicRecord {
    pub fn caller(&self) -> AppSdk {
        AppSdk::new(self.app.clone(), self.sdk.clone())
    }
}

/// Topic id → contributor set, for one epoch.
pub type ContributorsMap = BTreeMap<i32, BTreeSet<Contributor>>;

/// Epoch → caller → assigned topic.
pub type ReturnedTopicsByEpoch = BTreeMap<EpochId, BTreeMap<AppSdk, Topic>>;

/// Consent migration flag: local rows were copied to the service backend.
pub const FLAG_HAS_MIGRATED: &str = "has_migrated";

/// Consent migration flag: local rows were cleared after migration.
pub const FLAG_LOCAL_HAS_CLEARED: &str = "local_has_cleared";

fn decode<T: DeserializeOwned>(value: &[u8]) -> Result<T, EngineError> {
    Ok(serde_json::from_slice(value)?)
}

/// Topics table access over shared storage.
pub struct TopicStore {
    storage: Arc<Storage>,
}

impl TopicStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Get underlying storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Commit staged mutations atomically.
    pub fn write(&self, batch: StorageBatch) -> Result<usize, EngineError> {
        Ok(self.storage.write_batch(batch)?)
    }

    // --- Usage ---

    /// Record that `(app, sdk)` called in `epoch`.
    #[instrument(skip(self))]
    pub fn record_usage(&self, epoch: EpochId, app: &str, sdk: &str) -> Result<(), EngineError> {
        let mut batch = StorageBatch::new();
        let usage = UsageRecord {
            epoch,
            app: app.to_string(),
            sdk: sdk.to_string(),
        };
        batch.put(
            CF_USAGE_HISTORY,
            epoch_key(epoch, &[app, sdk])?,
            serde_json::to_vec(&usage)?,
        );
        let app_usage = AppUsageRecord {
            epoch,
            app: app.to_string(),
        };
        batch.put(
            CF_APP_USAGE_HISTORY,
            epoch_key(epoch, &[app])?,
            serde_json::to_vec(&app_usage)?,
        );
        self.write(batch)?;
        debug!("Recorded usage");
        Ok(())
    }

    /// Usage of one epoch as `app → [sdk]`, both sorted.
    pub fn usage_map(&self, epoch: EpochId) -> Result<BTreeMap<String, Vec<String>>, EngineError> {
        let mut usage: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (_, value) in self.storage.prefix_iterator(CF_USAGE_HISTORY, &epoch_prefix(epoch)?)? {
            let record: UsageRecord = decode(&value)?;
            usage.entry(record.app).or_default().push(record.sdk);
        }
        for sdks in usage.values_mut() {
            sdks.sort();
            sdks.dedup();
        }
        Ok(usage)
    }

    /// Apps with any row in the app usage table.
    pub fn apps_with_usage(&self) -> Result<BTreeSet<String>, EngineError> {
        let mut apps = BTreeSet::new();
        for (_, value) in self.storage.scan(CF_APP_USAGE_HISTORY)? {
            let record: AppUsageRecord = decode(&value)?;
            apps.insert(record.app);
        }
        Ok(apps)
    }

    // --- Classification ---

    pub fn stage_classification_topics(
        &self,
        batch: &mut StorageBatch,
        epoch: EpochId,
        app_topics: &BTreeMap<String, Vec<Topic>>,
    ) -> Result<(), EngineError> {
        for (app, topics) in app_topics {
            let record = ClassificationRecord {
                epoch,
                app: app.clone(),
                topics: topics.clone(),
            };
            batch.put(
                CF_APP_CLASSIFICATION_TOPICS,
                epoch_key(epoch, &[app.as_str()])?,
                serde_json::to_vec(&record)?,
            );
        }
        Ok(())
    }

    /// Classified topics per app for one epoch.
    pub fn classification_topics(
        &self,
        epoch: EpochId,
    ) -> Result<BTreeMap<String, Vec<Topic>>, EngineError> {
        let mut map = BTreeMap::new();
        for (_, value) in self
            .storage
            .prefix_iterator(CF_APP_CLASSIFICATION_TOPICS, &epoch_prefix(epoch)?)?
        {
            let record: ClassificationRecord = decode(&value)?;
            map.insert(record.app, record.topics);
        }
        Ok(map)
    }

    // --- Callers can learn ---

    pub fn stage_callers_can_learn(
        &self,
        batch: &mut StorageBatch,
        epoch: EpochId,
        callers_can_learn: &CallersCanLearnMap,
    ) -> Result<(), EngineError> {
        for (topic, callers) in callers_can_learn {
            let segment = topic_segment(topic);
            for caller in callers {
                let record = CallerCanLearnRecord {
                    epoch,
                    topic: *topic,
                    caller: caller.clone(),
                };
                batch.put(
                    CF_CALLER_CAN_LEARN,
                    epoch_key(epoch, &[segment.as_str(), caller.as_str()])?,
                    serde_json::to_vec(&record)?,
                );
            }
        }
        Ok(())
    }

    /// Union of learner sets over `[epoch - lookback + 1, epoch]`.
    pub fn callers_can_learn_map(
        &self,
        epoch: EpochId,
        lookback: i64,
    ) -> Result<CallersCanLearnMap, EngineError> {
        let mut map = CallersCanLearnMap::new();
        for (_, value) in
            self.storage
                .epoch_range(CF_CALLER_CAN_LEARN, epoch - lookback + 1, epoch)?
        {
            let record: CallerCanLearnRecord = decode(&value)?;
            map.entry(record.topic).or_default().insert(record.caller);
        }
        Ok(map)
    }

    // --- Top topics ---

    pub fn stage_top_topics(
        &self,
        batch: &mut StorageBatch,
        epoch: EpochId,
        top_topics: &[Topic],
    ) -> Result<(), EngineError> {
        batch.put(
            CF_TOP_TOPICS,
            epoch_prefix(epoch)?,
            serde_json::to_vec(top_topics)?,
        );
        Ok(())
    }

    /// Ordered top topics of one epoch; empty if none were persisted.
    pub fn top_topics(&self, epoch: EpochId) -> Result<Vec<Topic>, EngineError> {
        match self.storage.get(CF_TOP_TOPICS, &epoch_prefix(epoch)?)? {
            Some(bytes) => decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    // --- Contributors ---

    pub fn stage_topic_contributors(
        &self,
        batch: &mut StorageBatch,
        epoch: EpochId,
        contributors: &ContributorsMap,
    ) -> Result<(), EngineError> {
        for (topic_id, members) in contributors {
            let id = topic_id.to_string();
            for contributor in members {
                let record = ContributorRecord {
                    epoch,
                    topic_id: *topic_id,
                    contributor: contributor.clone(),
                };
                batch.put(
                    CF_TOPIC_CONTRIBUTORS,
                    epoch_key(epoch, &[id.as_str(), contributor_segment(contributor).as_str()])?,
                    serde_json::to_vec(&record)?,
                );
            }
        }
        Ok(())
    }

    /// Contributor sets of one epoch's regular top topics.
    pub fn topic_contributors(&self, epoch: EpochId) -> Result<ContributorsMap, EngineError> {
        let mut map = ContributorsMap::new();
        for (_, value) in self
            .storage
            .prefix_iterator(CF_TOPIC_CONTRIBUTORS, &epoch_prefix(epoch)?)?
        {
            let record: ContributorRecord = decode(&value)?;
            map.entry(record.topic_id)
                .or_default()
                .insert(record.contributor);
        }
        Ok(map)
    }

    /// Epochs holding a contributor row for `contributor`.
    pub fn epochs_with_contributor(
        &self,
        contributor: &Contributor,
    ) -> Result<BTreeSet<EpochId>, EngineError> {
        let mut epochs = BTreeSet::new();
        for (_, value) in self.storage.scan(CF_TOPIC_CONTRIBUTORS)? {
            let record: ContributorRecord = decode(&value)?;
            if record.contributor == *contributor {
                epochs.insert(record.epoch);
            }
        }
        Ok(epochs)
    }

    // --- Returned topics ---

    pub fn stage_returned_topics(
        &self,
        batch: &mut StorageBatch,
        epoch: EpochId,
        returned: &BTreeMap<AppSdk, Topic>,
    ) -> Result<(), EngineError> {
        for (caller, topic) in returned {
            let record = ReturnedTopicRecord {
                epoch,
                app: caller.app.clone(),
                sdk: caller.sdk.clone(),
                topic: *topic,
            };
            batch.put(
                CF_RETURNED_TOPICS,
                epoch_key(epoch, &[caller.app.as_str(), caller.sdk.as_str()])?,
                serde_json::to_vec(&record)?,
            );
        }
        Ok(())
    }

    /// Persist a single assignment.
    #[instrument(skip(self))]
    pub fn persist_returned_topic(
        &self,
        epoch: EpochId,
        caller: &AppSdk,
        topic: Topic,
    ) -> Result<(), EngineError> {
        let mut batch = StorageBatch::new();
        self.stage_returned_topics(&mut batch, epoch, &BTreeMap::from([(caller.clone(), topic)]))?;
        self.write(batch)?;
        debug!("Persisted returned topic");
        Ok(())
    }

    /// Assignments for epochs in `[lower, upper]`.
    pub fn returned_topics(
        &self,
        lower: EpochId,
        upper: EpochId,
    ) -> Result<ReturnedTopicsByEpoch, EngineError> {
        let mut by_epoch = ReturnedTopicsByEpoch::new();
        for (_, value) in self.storage.epoch_range(CF_RETURNED_TOPICS, lower, upper)? {
            let record: ReturnedTopicRecord = decode(&value)?;
            by_epoch
                .entry(record.epoch)
                .or_default()
                .insert(record.caller(), record.topic);
        }
        Ok(by_epoch)
    }

    /// Apps with any assignment, in any epoch.
    pub fn apps_with_returned_topics(&self) -> Result<BTreeSet<String>, EngineError> {
        let mut apps = BTreeSet::new();
        for (_, value) in self.storage.scan(CF_RETURNED_TOPICS)? {
            let record: ReturnedTopicRecord = decode(&value)?;
            apps.insert(record.app);
        }
        Ok(apps)
    }

    /// Stage deletion of every assignment of `topic_id` in `epoch`.
    /// Returns the number of rows staged.
    pub fn stage_delete_returned_topic_id(
        &self,
        batch: &mut StorageBatch,
        epoch: EpochId,
        topic_id: i32,
    ) -> Result<usize, EngineError> {
        let mut staged = 0;
        for (key, value) in self
            .storage
            .prefix_iterator(CF_RETURNED_TOPICS, &epoch_prefix(epoch)?)?
        {
            let record: ReturnedTopicRecord = decode(&value)?;
            if record.topic.topic_id == topic_id {
                batch.delete(CF_RETURNED_TOPICS, key);
                staged += 1;
            }
        }
        Ok(staged)
    }

    // --- Per-app erase ---

    /// Stage deletion of every row belonging to `app`: usage, app usage,
    /// classification, learner membership, assignments and contributor
    /// membership.
    pub fn stage_app_erase(&self, batch: &mut StorageBatch, app: &str) -> Result<usize, EngineError> {
        let mut staged = 0;
        staged += self.stage_matching::<UsageRecord>(batch, CF_USAGE_HISTORY, |r| r.app == app)?;
        staged +=
            self.stage_matching::<AppUsageRecord>(batch, CF_APP_USAGE_HISTORY, |r| r.app == app)?;
        staged += self.stage_matching::<ClassificationRecord>(
            batch,
            CF_APP_CLASSIFICATION_TOPICS,
            |r| r.app == app,
        )?;
        staged += self.stage_matching::<CallerCanLearnRecord>(batch, CF_CALLER_CAN_LEARN, |r| {
            r.caller == app
        })?;
        staged += self
            .stage_matching::<ReturnedTopicRecord>(batch, CF_RETURNED_TOPICS, |r| r.app == app)?;
        staged += self.stage_matching::<ContributorRecord>(batch, CF_TOPIC_CONTRIBUTORS, |r| {
            r.contributor.app_id() == Some(app)
        })?;
        Ok(staged)
    }

    fn stage_matching<T: DeserializeOwned>(
        &self,
        batch: &mut StorageBatch,
        cf_name: &str,
        matches: impl Fn(&T) -> bool,
    ) -> Result<usize, EngineError> {
        let mut staged = 0;
        for (key, value) in self.storage.scan(cf_name)? {
            let record: T = decode(&value)?;
            if matches(&record) {
                batch.delete(cf_name, key);
                staged += 1;
            }
        }
        Ok(staged)
    }

    /// Stage deletion of every row of `epoch` in `tables`.
    pub fn stage_delete_epoch(
        &self,
        batch: &mut StorageBatch,
        tables: &[&str],
        epoch: EpochId,
    ) -> Result<usize, EngineError> {
        let prefix = epoch_prefix(epoch)?;
        let mut staged = 0;
        for cf_name in tables {
            for (key, _) in self.storage.prefix_iterator(cf_name, &prefix)? {
                batch.delete(cf_name, key);
                staged += 1;
            }
        }
        Ok(staged)
    }

    // --- Garbage collection ---

    /// Stage deletion of rows with epoch `<= epoch_to_delete_from` in `tables`.
    pub fn stage_delete_epochs_up_to(
        &self,
        batch: &mut StorageBatch,
        tables: &[&str],
        epoch_to_delete_from: EpochId,
    ) -> Result<usize, EngineError> {
        let mut staged = 0;
        for cf_name in tables {
            for key in self.storage.keys_up_to_epoch(cf_name, epoch_to_delete_from)? {
                batch.delete(cf_name, key);
                staged += 1;
            }
        }
        Ok(staged)
    }

    // --- Clear ---

    /// Stage deletion of every row of `table`.
    pub fn stage_clear_table(
        &self,
        batch: &mut StorageBatch,
        table: TopicsTable,
    ) -> Result<usize, EngineError> {
        let cf_name = table.cf_name();
        let rows = self.storage.scan(cf_name)?;
        let count = rows.len();
        for (key, _) in rows {
            batch.delete(cf_name, key);
        }
        Ok(count)
    }

    // --- Epoch origin ---

    pub fn epoch_origin(&self) -> Result<Option<i64>, EngineError> {
        match self.storage.get(CF_EPOCH_ORIGIN, EPOCH_ORIGIN_KEY)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    pub fn persist_epoch_origin(&self, origin_millis: i64) -> Result<(), EngineError> {
        let value = serde_json::to_vec(&origin_millis)?;
        self.storage.put(CF_EPOCH_ORIGIN, EPOCH_ORIGIN_KEY, &value)?;
        debug!("Persisted epoch origin");
        Ok(())
    }

    // --- Consent flags ---

    /// Read a persisted boolean flag; unset reads as false.
    pub fn flag(&self, name: &str) -> Result<bool, EngineError> {
        match self.storage.get(CF_CONSENT_FLAGS, name.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(false),
        }
    }

    pub fn set_flag(&self, name: &str, value: bool) -> Result<(), EngineError> {
        self.storage
            .put(CF_CONSENT_FLAGS, name.as_bytes(), &serde_json::to_vec(&value)?)?;
        Ok(())
    }
}
