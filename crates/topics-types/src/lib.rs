//! # topics-types
//!
//! Shared domain types for the device topics engine.
//!
//! This crate defines the value types every other crate speaks:
//! - Topic: immutable `(topic_id, taxonomy_version, model_version)` triple
//! - AppSdk: the `(app, sdk)` caller key, `sdk = ""` meaning the app itself
//! - Contributor: a real contributing app or the padding sentinel
//! - Settings: layered configuration for the engine, classifier and daemon
//!
//! ## Usage
//!
//! ```rust
//! use topics_types::{AppSdk, Topic};
//!
//! let topic = Topic::new(10004, 2, 5);
//! let caller = AppSdk::new("com.example.news", "sdk.ads");
//! assert!(!caller.is_app_only());
//! assert_eq!(topic.topic_id, 10004);
//! ```

pub mod caller;
pub mod config;
pub mod error;
pub mod topic;

pub use caller::{AppSdk, Contributor};
pub use config::{
    ClassifierSettings, ConsentSourceOfTruth, DaemonSettings, EngineSettings, Settings,
};
pub use error::TopicsError;
pub use topic::{EpochId, Topic};
