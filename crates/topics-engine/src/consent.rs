//! User blocked topics and their backends.
//!
//! `ConsentStore` routes block/unblock/read/clear to one or more
//! `BlockedTopicsBackend`s according to `ConsentSourceOfTruth`. Mirrored
//! writes are staged into one batch, so every configured backend commits
//! the change or none does. One-time
//! migration from the local backend runs at construction, guarded by
//! persisted flags so a restart never repeats it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, instrument};

use topics_storage::column_families::{
    CF_ALTERNATE_BLOCKED_TOPICS, CF_BLOCKED_TOPICS, CF_SERVICE_BLOCKED_TOPICS,
};
use topics_storage::keys::blocked_topic_key;
use topics_storage::{Storage, StorageBatch};
use topics_types::{ConsentSourceOfTruth, EngineSettings, Topic};

use crate::error::EngineError;
use crate::store::{TopicStore, FLAG_HAS_MIGRATED, FLAG_LOCAL_HAS_CLEARED};

/// One place blocked topics can live.
pub trait BlockedTopicsBackend: Send + Sync {
    /// Stage recording `topic` as blocked.
    fn stage_record_blocked_topic(
        &self,
        batch: &mut StorageBatch,
        topic: &Topic,
    ) -> Result<(), EngineError>;

    /// Stage removing `topic` from the blocked set.
    fn stage_remove_blocked_topic(
        &self,
        batch: &mut StorageBatch,
        topic: &Topic,
    ) -> Result<(), EngineError>;

    fn retrieve_all_blocked_topics(&self) -> Result<Vec<Topic>, EngineError>;

    fn clear_all_blocked_topics(&self) -> Result<(), EngineError>;
}

/// Backend stored in one column family.
pub struct ColumnFamilyBackend {
    storage: Arc<Storage>,
    cf_name: &'static str,
}

impl ColumnFamilyBackend {
    /// The engine's own blocked topics table.
    pub fn local(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cf_name: CF_BLOCKED_TOPICS,
        }
    }

    /// Platform service mirror.
    pub fn service(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cf_name: CF_SERVICE_BLOCKED_TOPICS,
        }
    }

    /// Alternate store.
    pub fn alternate(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cf_name: CF_ALTERNATE_BLOCKED_TOPICS,
        }
    }

    /// Record one topic outside of a mirrored write.
    pub fn record_blocked_topic(&self, topic: &Topic) -> Result<(), EngineError> {
        let mut batch = StorageBatch::new();
        self.stage_record_blocked_topic(&mut batch, topic)?;
        self.storage.write_batch(batch)?;
        Ok(())
    }

    /// Remove one topic outside of a mirrored write.
    pub fn remove_blocked_topic(&self, topic: &Topic) -> Result<(), EngineError> {
        let mut batch = StorageBatch::new();
        self.stage_remove_blocked_topic(&mut batch, topic)?;
        self.storage.write_batch(batch)?;
        Ok(())
    }
}

impl BlockedTopicsBackend for ColumnFamilyBackend {
    fn stage_record_blocked_topic(
        &self,
        batch: &mut StorageBatch,
        topic: &Topic,
    ) -> Result<(), EngineError> {
        batch.put(
            self.cf_name,
            blocked_topic_key(topic),
            serde_json::to_vec(topic)?,
        );
        debug!(cf = self.cf_name, topic = %topic, "Staged blocked topic");
        Ok(())
    }

    fn stage_remove_blocked_topic(
        &self,
        batch: &mut StorageBatch,
        topic: &Topic,
    ) -> Result<(), EngineError> {
        batch.delete(self.cf_name, blocked_topic_key(topic));
        Ok(())
    }

    fn retrieve_all_blocked_topics(&self) -> Result<Vec<Topic>, EngineError> {
        let mut topics = Vec::new();
        for (_, value) in self.storage.scan(self.cf_name)? {
            topics.push(serde_json::from_slice(&value)?);
        }
        Ok(topics)
    }

    fn clear_all_blocked_topics(&self) -> Result<(), EngineError> {
        for (key, _) in self.storage.scan(self.cf_name)? {
            self.storage.delete(self.cf_name, &key)?;
        }
        Ok(())
    }
}

/// Blocked topics routed by source-of-truth mode.
pub struct ConsentStore {
    storage: Arc<Storage>,
    mode: ConsentSourceOfTruth,
    enable_alternate_store: bool,
    local: Arc<dyn BlockedTopicsBackend>,
    service: Arc<dyn BlockedTopicsBackend>,
    alternate: Arc<dyn BlockedTopicsBackend>,
    lock: Mutex<()>,
}

impl ConsentStore {
    /// Build over the column family backends and run any pending migration.
    pub fn new(store: &TopicStore, settings: &EngineSettings) -> Result<Self, EngineError> {
        let storage = store.storage().clone();
        Self::with_backends(
            store,
            settings,
            Arc::new(ColumnFamilyBackend::local(storage.clone())),
            Arc::new(ColumnFamilyBackend::service(storage.clone())),
            Arc::new(ColumnFamilyBackend::alternate(storage)),
        )
    }

    /// Build over explicit backends and run any pending migration.
    pub fn with_backends(
        store: &TopicStore,
        settings: &EngineSettings,
        local: Arc<dyn BlockedTopicsBackend>,
        service: Arc<dyn BlockedTopicsBackend>,
        alternate: Arc<dyn BlockedTopicsBackend>,
    ) -> Result<Self, EngineError> {
        let consent = Self {
            storage: store.storage().clone(),
            mode: settings.consent_source_of_truth,
            enable_alternate_store: settings.enable_alternate_store_consent,
            local,
            service,
            alternate,
            lock: Mutex::new(()),
        };
        consent.handle_migration_if_needed(store)?;
        Ok(consent)
    }

    pub fn mode(&self) -> ConsentSourceOfTruth {
        self.mode
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.lock.lock().map_err(|e| EngineError::Lock(e.to_string()))
    }

    fn alternate_backend(&self) -> Result<&Arc<dyn BlockedTopicsBackend>, EngineError> {
        if !self.enable_alternate_store {
            return Err(EngineError::Consent(
                "alternate store consent is disabled".to_string(),
            ));
        }
        Ok(&self.alternate)
    }

    /// Backends a write in the current mode must reach.
    fn write_backends(&self) -> Result<Vec<&Arc<dyn BlockedTopicsBackend>>, EngineError> {
        Ok(match self.mode {
            ConsentSourceOfTruth::LocalOnly => vec![&self.local],
            ConsentSourceOfTruth::ServiceOnly => vec![&self.service],
            ConsentSourceOfTruth::LocalAndService => vec![&self.local, &self.service],
            ConsentSourceOfTruth::AlternateStoreOnly => vec![self.alternate_backend()?],
        })
    }

    /// Block a topic for every caller, in every epoch.
    #[instrument(skip(self), fields(topic = %topic))]
    pub fn block(&self, topic: &Topic) -> Result<(), EngineError> {
        validate_topic(topic)?;
        let _guard = self.guard()?;
        let mut batch = StorageBatch::new();
        for backend in self.write_backends()? {
            backend.stage_record_blocked_topic(&mut batch, topic)?;
        }
        self.storage.write_batch(batch)?;
        info!("Blocked topic");
        Ok(())
    }

    /// Remove a topic from the blocklist.
    #[instrument(skip(self), fields(topic = %topic))]
    pub fn unblock(&self, topic: &Topic) -> Result<(), EngineError> {
        validate_topic(topic)?;
        let _guard = self.guard()?;
        let mut batch = StorageBatch::new();
        for backend in self.write_backends()? {
            backend.stage_remove_blocked_topic(&mut batch, topic)?;
        }
        self.storage.write_batch(batch)?;
        info!("Unblocked topic");
        Ok(())
    }

    /// Every blocked topic, read from the source of truth.
    pub fn retrieve_all(&self) -> Result<Vec<Topic>, EngineError> {
        let _guard = self.guard()?;
        let topics = match self.mode {
            ConsentSourceOfTruth::LocalOnly => self.local.retrieve_all_blocked_topics()?,
            ConsentSourceOfTruth::ServiceOnly | ConsentSourceOfTruth::LocalAndService => {
                self.service.retrieve_all_blocked_topics()?
            }
            ConsentSourceOfTruth::AlternateStoreOnly => {
                self.alternate_backend()?.retrieve_all_blocked_topics()?
            }
        };
        // Deduplicate while keeping a stable order
        let unique: BTreeSet<Topic> = topics.into_iter().collect();
        Ok(unique.into_iter().collect())
    }

    /// Clear the mirrored backends.
    ///
    /// The local table is wiped with the rest of the engine data, so
    /// `LocalOnly` has nothing to do here.
    #[instrument(skip(self))]
    pub fn clear_all(&self) -> Result<(), EngineError> {
        let _guard = self.guard()?;
        match self.mode {
            ConsentSourceOfTruth::LocalOnly => {}
            ConsentSourceOfTruth::ServiceOnly | ConsentSourceOfTruth::LocalAndService => {
                self.service.clear_all_blocked_topics()?
            }
            ConsentSourceOfTruth::AlternateStoreOnly => {
                self.alternate_backend()?.clear_all_blocked_topics()?
            }
        }
        debug!("Cleared mirrored blocked topics");
        Ok(())
    }

    fn handle_migration_if_needed(&self, store: &TopicStore) -> Result<(), EngineError> {
        match self.mode {
            ConsentSourceOfTruth::LocalOnly => {
                // A later switch back to a mirrored mode migrates again
                if store.flag(FLAG_HAS_MIGRATED)? {
                    store.set_flag(FLAG_HAS_MIGRATED, false)?;
                    info!("Reset blocked topics migration flag");
                }
            }
            ConsentSourceOfTruth::LocalAndService => {
                self.migrate_local_to_service_once(store)?;
            }
            ConsentSourceOfTruth::ServiceOnly => {
                self.migrate_local_to_service_once(store)?;
                self.clear_local_once(store)?;
            }
            ConsentSourceOfTruth::AlternateStoreOnly => {}
        }
        Ok(())
    }

    fn migrate_local_to_service_once(&self, store: &TopicStore) -> Result<(), EngineError> {
        if store.flag(FLAG_HAS_MIGRATED)? {
            return Ok(());
        }
        let topics = self.local.retrieve_all_blocked_topics()?;
        let mut batch = StorageBatch::new();
        for topic in &topics {
            self.service.stage_record_blocked_topic(&mut batch, topic)?;
        }
        self.storage.write_batch(batch)?;
        store.set_flag(FLAG_HAS_MIGRATED, true)?;
        info!(count = topics.len(), "Migrated blocked topics to service backend");
        Ok(())
    }

    fn clear_local_once(&self, store: &TopicStore) -> Result<(), EngineError> {
        if store.flag(FLAG_LOCAL_HAS_CLEARED)? {
            return Ok(());
        }
        self.local.clear_all_blocked_topics()?;
        store.set_flag(FLAG_LOCAL_HAS_CLEARED, true)?;
        info!("Cleared local blocked topics after migration");
        Ok(())
    }
}

fn validate_topic(topic: &Topic) -> Result<(), EngineError> {
    if topic.topic_id <= 0 {
        return Err(EngineError::InvalidArgument(format!(
            "invalid topic id {}",
            topic.topic_id
        )));
    }
    Ok(())
}
