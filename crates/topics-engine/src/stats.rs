//! Metrics sink for query and epoch statistics.

use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

/// Per-query counters emitted by the cache read path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GetTopicsStats {
    pub filtered_blocked_topic_count: usize,
    pub duplicate_topic_count: usize,
    pub topic_ids_count: usize,
}

/// Per-epoch classifier and assignment counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EpochComputationStats {
    /// Length of the persisted top topics list
    pub top_topic_count: usize,
    /// Regular slots filled without a real contributor
    pub padded_random_topics_count: usize,
    /// Apps with usage in the epoch
    pub apps_considered_count: usize,
    /// Returned topic rows written for the epoch
    pub returned_topics_count: usize,
}

/// Receives statistics from the engine.
pub trait StatsLogger: Send + Sync {
    fn log_get_topics_stats(&self, stats: GetTopicsStats);

    fn log_epoch_stats(&self, epoch: i64, stats: EpochComputationStats);
}

/// Emits statistics as structured tracing events.
#[derive(Debug, Default)]
pub struct TracingStatsLogger;

impl StatsLogger for TracingStatsLogger {
    fn log_get_topics_stats(&self, stats: GetTopicsStats) {
        info!(
            filtered_blocked_topic_count = stats.filtered_blocked_topic_count,
            duplicate_topic_count = stats.duplicate_topic_count,
            topic_ids_count = stats.topic_ids_count,
            "getTopics stats"
        );
    }

    fn log_epoch_stats(&self, epoch: i64, stats: EpochComputationStats) {
        info!(
            epoch,
            top_topic_count = stats.top_topic_count,
            padded_random_topics_count = stats.padded_random_topics_count,
            apps_considered_count = stats.apps_considered_count,
            returned_topics_count = stats.returned_topics_count,
            "Epoch computation stats"
        );
    }
}

/// Keeps every record in memory. Useful for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingStatsLogger {
    get_topics: Mutex<Vec<GetTopicsStats>>,
    epochs: Mutex<Vec<(i64, EpochComputationStats)>>,
}

impl RecordingStatsLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_topics_stats(&self) -> Vec<GetTopicsStats> {
        self.get_topics
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn epoch_stats(&self) -> Vec<(i64, EpochComputationStats)> {
        self.epochs
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl StatsLogger for RecordingStatsLogger {
    fn log_get_topics_stats(&self, stats: GetTopicsStats) {
        if let Ok(mut records) = self.get_topics.lock() {
            records.push(stats);
        }
    }

    fn log_epoch_stats(&self, epoch: i64, stats: EpochComputationStats) {
        if let Ok(mut records) = self.epochs.lock() {
            records.push((epoch, stats));
        }
    }
}
