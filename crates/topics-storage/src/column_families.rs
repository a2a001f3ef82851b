//! Column family definitions for RocksDB.
//!
//! Each column family holds one logical table:
//! - usage_history: (epoch, app, sdk) presence facts
//! - app_usage_history: (epoch, app) presence facts
//! - app_classification_topics: classifier output per (epoch, app)
//! - caller_can_learn: one row per (epoch, topic, caller)
//! - top_topics: ordered top topic list per epoch
//! - topic_contributors: contributor set members per (epoch, topic id)
//! - returned_topics: assigned topic per (epoch, app, sdk)
//! - blocked_topics / service_blocked_topics / alternate_blocked_topics: consent backends
//! - epoch_origin: the persisted origin timestamp
//! - consent_flags: one-time migration flags

use std::fmt;
use std::str::FromStr;

use rocksdb::{ColumnFamilyDescriptor, Options};

use crate::error::StorageError;

pub const CF_USAGE_HISTORY: &str = "usage_history";

pub const CF_APP_USAGE_HISTORY: &str = "app_usage_history";

pub const CF_APP_CLASSIFICATION_TOPICS: &str = "app_classification_topics";

pub const CF_CALLER_CAN_LEARN: &str = "caller_can_learn";

pub const CF_TOP_TOPICS: &str = "top_topics";

pub const CF_TOPIC_CONTRIBUTORS: &str = "topic_contributors";

pub const CF_RETURNED_TOPICS: &str = "returned_topics";

/// Local blocked topics backend
pub const CF_BLOCKED_TOPICS: &str = "blocked_topics";

/// Platform service blocked topics backend
pub const CF_SERVICE_BLOCKED_TOPICS: &str = "service_blocked_topics";

/// Alternate store blocked topics backend
pub const CF_ALTERNATE_BLOCKED_TOPICS: &str = "alternate_blocked_topics";

pub const CF_EPOCH_ORIGIN: &str = "epoch_origin";

pub const CF_CONSENT_FLAGS: &str = "consent_flags";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[
    CF_USAGE_HISTORY,
    CF_APP_USAGE_HISTORY,
    CF_APP_CLASSIFICATION_TOPICS,
    CF_CALLER_CAN_LEARN,
    CF_TOP_TOPICS,
    CF_TOPIC_CONTRIBUTORS,
    CF_RETURNED_TOPICS,
    CF_BLOCKED_TOPICS,
    CF_SERVICE_BLOCKED_TOPICS,
    CF_ALTERNATE_BLOCKED_TOPICS,
    CF_EPOCH_ORIGIN,
    CF_CONSENT_FLAGS,
];

/// Tables owned by the engine and wiped by a clear-all request.
///
/// The mirrored consent backends and migration flags are not listed;
/// they are cleared through the consent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicsTable {
    UsageHistory,
    AppUsageHistory,
    AppClassificationTopics,
    CallerCanLearn,
    TopTopics,
    TopicContributors,
    ReturnedTopics,
    BlockedTopics,
    EpochOrigin,
}

impl TopicsTable {
    pub const ALL: [TopicsTable; 9] = [
        TopicsTable::UsageHistory,
        TopicsTable::AppUsageHistory,
        TopicsTable::AppClassificationTopics,
        TopicsTable::CallerCanLearn,
        TopicsTable::TopTopics,
        TopicsTable::TopicContributors,
        TopicsTable::ReturnedTopics,
        TopicsTable::BlockedTopics,
        TopicsTable::EpochOrigin,
    ];

    /// Column family backing this table.
    pub fn cf_name(&self) -> &'static str {
        match self {
            TopicsTable::UsageHistory => CF_USAGE_HISTORY,
            TopicsTable::AppUsageHistory => CF_APP_USAGE_HISTORY,
            TopicsTable::AppClassificationTopics => CF_APP_CLASSIFICATION_TOPICS,
            TopicsTable::CallerCanLearn => CF_CALLER_CAN_LEARN,
            TopicsTable::TopTopics => CF_TOP_TOPICS,
            TopicsTable::TopicContributors => CF_TOPIC_CONTRIBUTORS,
            TopicsTable::ReturnedTopics => CF_RETURNED_TOPICS,
            TopicsTable::BlockedTopics => CF_BLOCKED_TOPICS,
            TopicsTable::EpochOrigin => CF_EPOCH_ORIGIN,
        }
    }
}

impl fmt::Display for TopicsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cf_name())
    }
}

impl FromStr for TopicsTable {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicsTable::ALL
            .iter()
            .copied()
            .find(|table| table.cf_name() == s)
            .ok_or_else(|| StorageError::NotFound(s.to_string()))
    }
}

/// Options for epoch-keyed history tables (written once per epoch, scanned in order)
fn history_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_USAGE_HISTORY, history_options()),
        ColumnFamilyDescriptor::new(CF_APP_USAGE_HISTORY, history_options()),
        ColumnFamilyDescriptor::new(CF_APP_CLASSIFICATION_TOPICS, history_options()),
        ColumnFamilyDescriptor::new(CF_CALLER_CAN_LEARN, history_options()),
        ColumnFamilyDescriptor::new(CF_TOP_TOPICS, history_options()),
        ColumnFamilyDescriptor::new(CF_TOPIC_CONTRIBUTORS, history_options()),
        ColumnFamilyDescriptor::new(CF_RETURNED_TOPICS, history_options()),
        ColumnFamilyDescriptor::new(CF_BLOCKED_TOPICS, Options::default()),
        ColumnFamilyDescriptor::new(CF_SERVICE_BLOCKED_TOPICS, Options::default()),
        ColumnFamilyDescriptor::new(CF_ALTERNATE_BLOCKED_TOPICS, Options::default()),
        ColumnFamilyDescriptor::new(CF_EPOCH_ORIGIN, Options::default()),
        ColumnFamilyDescriptor::new(CF_CONSENT_FLAGS, Options::default()),
    ]
}
