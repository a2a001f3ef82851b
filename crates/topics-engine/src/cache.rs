//! Read-optimized snapshot of recently returned topics.
//!
//! `load_cache` materializes the returned topics of the configured
//! lookback window together with the user blocklist. Queries only read
//! the snapshot; a window that was never loaded reads as empty.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use rand::seq::SliceRandom;
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, info, instrument};

use topics_storage::{StorageBatch, TopicsTable};
use topics_types::{AppSdk, EngineSettings, EpochId, Topic};

use crate::consent::ConsentStore;
use crate::error::EngineError;
use crate::stats::{GetTopicsStats, StatsLogger};
use crate::store::{ReturnedTopicsByEpoch, TopicStore};

#[derive(Debug, Default)]
struct CacheSnapshot {
    loaded_for_epoch: Option<EpochId>,
    returned: ReturnedTopicsByEpoch,
    blocked: BTreeSet<Topic>,
}

/// Summary of the cache contents.
#[derive(Debug, Clone, Serialize)]
pub struct CacheDump {
    pub loaded_for_epoch: Option<EpochId>,
    pub cached_epochs: Vec<EpochId>,
    pub returned_topic_rows: usize,
    pub blocked_topics_count: usize,
    pub global_blocked_topic_ids: Vec<i32>,
}

/// Topic cache over the returned topics table.
pub struct TopicCache {
    store: Arc<TopicStore>,
    consent: Arc<ConsentStore>,
    stats: Arc<dyn StatsLogger>,
    lookback: i64,
    global_blocked_topic_ids: BTreeSet<i32>,
    snapshot: RwLock<CacheSnapshot>,
}

impl TopicCache {
    pub fn new(
        store: Arc<TopicStore>,
        consent: Arc<ConsentStore>,
        stats: Arc<dyn StatsLogger>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            store,
            consent,
            stats,
            lookback: settings.lookback(),
            global_blocked_topic_ids: settings.global_blocked_topic_ids.iter().copied().collect(),
            snapshot: RwLock::new(CacheSnapshot::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CacheSnapshot>, EngineError> {
        self.snapshot
            .read()
            .map_err(|e| EngineError::Lock(e.to_string()))
    }

    /// Reload returned topics for `[current - lookback, current - 1]` and
    /// the blocklist. The new snapshot replaces the old one in one swap.
    #[instrument(skip(self))]
    pub fn load_cache(&self, current_epoch: EpochId) -> Result<(), EngineError> {
        let returned = self
            .store
            .returned_topics(current_epoch - self.lookback, current_epoch - 1)?;
        let blocked: BTreeSet<Topic> = self.consent.retrieve_all()?.into_iter().collect();

        let snapshot = CacheSnapshot {
            loaded_for_epoch: Some(current_epoch),
            returned,
            blocked,
        };
        debug!(
            epochs = snapshot.returned.len(),
            blocked = snapshot.blocked.len(),
            "Loaded topic cache"
        );
        *self
            .snapshot
            .write()
            .map_err(|e| EngineError::Lock(e.to_string()))? = snapshot;
        Ok(())
    }

    fn is_blocked(&self, snapshot: &CacheSnapshot, topic: &Topic) -> bool {
        snapshot.blocked.contains(topic) || self.global_blocked_topic_ids.contains(&topic.topic_id)
    }

    /// Topics for `(app, sdk)` over `[current - lookback, current - 1]`:
    /// blocked topics removed, duplicates dropped, order shuffled.
    #[instrument(skip(self, rng))]
    pub fn get_topics<R: RngCore + ?Sized>(
        &self,
        lookback: i64,
        current_epoch: EpochId,
        app: &str,
        sdk: &str,
        rng: &mut R,
    ) -> Result<Vec<Topic>, EngineError> {
        let snapshot = self.read()?;
        let caller = AppSdk::new(app, sdk);

        let mut stats = GetTopicsStats::default();
        let mut seen = BTreeSet::new();
        let mut topics = Vec::new();
        for epoch in (current_epoch - lookback..current_epoch).rev() {
            let Some(topic) = snapshot
                .returned
                .get(&epoch)
                .and_then(|callers| callers.get(&caller))
            else {
                continue;
            };
            if self.is_blocked(&snapshot, topic) {
                stats.filtered_blocked_topic_count += 1;
                continue;
            }
            if !seen.insert(*topic) {
                stats.duplicate_topic_count += 1;
                continue;
            }
            topics.push(*topic);
        }
        drop(snapshot);

        // Epoch order would tell the caller how recent each topic is
        topics.shuffle(rng);

        stats.topic_ids_count = topics.len();
        self.stats.log_get_topics_stats(stats);
        Ok(topics)
    }

    /// Cached topics for `(app, sdk)` in `[lower, upper]`, in epoch order.
    /// No blocklist filtering.
    pub fn get_topics_in_epoch_range(
        &self,
        lower: EpochId,
        upper: EpochId,
        app: &str,
        sdk: &str,
    ) -> Result<Vec<Topic>, EngineError> {
        if lower > upper {
            return Ok(Vec::new());
        }
        let snapshot = self.read()?;
        let caller = AppSdk::new(app, sdk);
        Ok(snapshot
            .returned
            .range(lower..=upper)
            .filter_map(|(_, callers)| callers.get(&caller).copied())
            .collect())
    }

    /// Every non-blocked topic returned to anyone in the cached window.
    pub fn get_known_topics_with_consent(
        &self,
        current_epoch: EpochId,
    ) -> Result<Vec<Topic>, EngineError> {
        let snapshot = self.read()?;
        let lower = current_epoch - self.lookback.max(0);
        let known: BTreeSet<Topic> = snapshot
            .returned
            .range(lower..current_epoch)
            .flat_map(|(_, callers)| callers.values().copied())
            .filter(|topic| !self.is_blocked(&snapshot, topic))
            .collect();
        Ok(known.into_iter().collect())
    }

    /// Wipe every table not listed in `excluded`, then empty the snapshot.
    ///
    /// Wiping the blocked topics table also clears the consent mirrors.
    #[instrument(skip(self))]
    pub fn clear_all_topics_data(&self, excluded: &[TopicsTable]) -> Result<(), EngineError> {
        let excluded: BTreeSet<TopicsTable> = excluded.iter().copied().collect();
        let mut batch = StorageBatch::new();
        let mut rows = 0;
        for table in TopicsTable::ALL {
            if !excluded.contains(&table) {
                rows += self.store.stage_clear_table(&mut batch, table)?;
            }
        }
        self.store.write(batch)?;

        if !excluded.contains(&TopicsTable::BlockedTopics) {
            self.consent.clear_all()?;
        }

        *self
            .snapshot
            .write()
            .map_err(|e| EngineError::Lock(e.to_string()))? = CacheSnapshot::default();
        info!(rows, excluded = excluded.len(), "Cleared topics data");
        Ok(())
    }

    pub fn dump(&self) -> Result<CacheDump, EngineError> {
        let snapshot = self.read()?;
        Ok(CacheDump {
            loaded_for_epoch: snapshot.loaded_for_epoch,
            cached_epochs: snapshot.returned.keys().copied().collect(),
            returned_topic_rows: snapshot.returned.values().map(BTreeMap::len).sum(),
            blocked_topics_count: snapshot.blocked.len(),
            global_blocked_topic_ids: self.global_blocked_topic_ids.iter().copied().collect(),
        })
    }
}
