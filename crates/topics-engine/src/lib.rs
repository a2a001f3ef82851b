//! On-device topics engine.
//!
//! Apps and their SDKs report calls. Once per epoch the engine
//! classifies the calling apps into interest topics, picks the epoch's
//! top topics and assigns one topic per app, disclosing it only to
//! callers that observed the classification. Queries read a cached
//! lookback window with the user's blocked topics removed.
//!
//! ## Components
//! - [`EpochEngine`]: per-epoch computation and garbage collection
//! - [`TopicCache`]: lookback window snapshot answering queries
//! - [`InstallReconciler`]: app install/uninstall consistency
//! - [`ConsentStore`]: user blocked topics over one or more backends
//! - [`TopicsWorker`]: orchestrator tying them together

pub mod apps;
pub mod cache;
pub mod classifier;
pub mod clock;
pub mod consent;
pub mod epoch;
pub mod error;
pub mod reconciler;
pub mod selection;
pub mod stats;
pub mod store;
pub mod worker;

pub use apps::{FileAppLister, InstalledAppLister, StaticAppLister};
pub use cache::{CacheDump, TopicCache};
pub use classifier::{
    Classifier, ClassifierAssets, ClassifierError, MockClassifier, PrecomputedClassifier,
};
pub use clock::{Clock, EpochClock, FixedClock, SystemClock};
pub use consent::{BlockedTopicsBackend, ColumnFamilyBackend, ConsentStore};
pub use epoch::EpochEngine;
pub use error::EngineError;
pub use reconciler::InstallReconciler;
pub use selection::{os_rng, seeded_rng, SharedRng};
pub use stats::{
    EpochComputationStats, GetTopicsStats, RecordingStatsLogger, StatsLogger, TracingStatsLogger,
};
pub use store::TopicStore;
pub use worker::{TopicsWorker, WorkerDeps, WorkerStatus};
