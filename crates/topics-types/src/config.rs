//! Configuration loading for the topics engine.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/device-topics/config.toml.

use config::{Config, Environment, File};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::TopicsError;

/// Which backend(s) hold the user's blocked topics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsentSourceOfTruth {
    /// Local table only (default)
    #[default]
    LocalOnly,
    /// Platform service store only
    ServiceOnly,
    /// Write both, read from the platform service
    LocalAndService,
    /// Alternate store only
    AlternateStoreOnly,
}

/// Epoch computation and disclosure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Trailing epochs consulted when answering a query
    #[serde(default = "default_lookback_epochs")]
    pub number_of_lookback_epochs: u32,

    /// Regular top topics per epoch (K)
    #[serde(default = "default_top_topics")]
    pub number_of_top_topics: u32,

    /// Random topics appended after the regular slice (R)
    #[serde(default = "default_random_topics")]
    pub number_of_random_topics: u32,

    /// Chance (0-100) that an assignment draws from the random slice
    #[serde(default = "default_percentage_for_random_topic")]
    pub percentage_for_random_topic: u32,

    /// Epoch length in milliseconds
    #[serde(default = "default_epoch_period_ms")]
    pub epoch_period_ms: i64,

    /// Epochs of history kept before garbage collection
    #[serde(default = "default_epochs_to_keep_in_history")]
    pub number_of_epochs_to_keep_in_history: u32,

    /// Topic ids never disclosed to any caller
    #[serde(default)]
    pub global_blocked_topic_ids: Vec<i32>,

    /// Blocked topics backend selection
    #[serde(default)]
    pub consent_source_of_truth: ConsentSourceOfTruth,

    /// Gate for the alternate store backend
    #[serde(default = "default_true")]
    pub enable_alternate_store_consent: bool,
}

fn default_lookback_epochs() -> u32 {
    3
}

fn default_top_topics() -> u32 {
    5
}

fn default_random_topics() -> u32 {
    1
}

fn default_percentage_for_random_topic() -> u32 {
    5
}

fn default_epoch_period_ms() -> i64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_epochs_to_keep_in_history() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            number_of_lookback_epochs: default_lookback_epochs(),
            number_of_top_topics: default_top_topics(),
            number_of_random_topics: default_random_topics(),
            percentage_for_random_topic: default_percentage_for_random_topic(),
            epoch_period_ms: default_epoch_period_ms(),
            number_of_epochs_to_keep_in_history: default_epochs_to_keep_in_history(),
            global_blocked_topic_ids: Vec::new(),
            consent_source_of_truth: ConsentSourceOfTruth::default(),
            enable_alternate_store_consent: default_true(),
        }
    }
}

impl EngineSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.number_of_top_topics == 0 {
            return Err("number_of_top_topics must be > 0".to_string());
        }
        if self.number_of_random_topics == 0 {
            return Err("number_of_random_topics must be > 0".to_string());
        }
        if self.percentage_for_random_topic > 100 {
            return Err(format!(
                "percentage_for_random_topic must be 0-100, got {}",
                self.percentage_for_random_topic
            ));
        }
        if self.epoch_period_ms <= 0 {
            return Err("epoch_period_ms must be > 0".to_string());
        }
        if self.number_of_lookback_epochs == 0 {
            return Err("number_of_lookback_epochs must be > 0".to_string());
        }
        if self.number_of_epochs_to_keep_in_history < self.number_of_lookback_epochs {
            return Err(format!(
                "number_of_epochs_to_keep_in_history ({}) must be >= number_of_lookback_epochs ({})",
                self.number_of_epochs_to_keep_in_history, self.number_of_lookback_epochs
            ));
        }
        Ok(())
    }

    pub fn lookback(&self) -> i64 {
        i64::from(self.number_of_lookback_epochs)
    }

    pub fn top_topics(&self) -> usize {
        self.number_of_top_topics as usize
    }

    pub fn random_topics(&self) -> usize {
        self.number_of_random_topics as usize
    }

    pub fn history(&self) -> i64 {
        i64::from(self.number_of_epochs_to_keep_in_history)
    }
}

/// Classifier asset settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    /// JSON asset with labels and precomputed app topics; built-in when unset
    #[serde(default)]
    pub assets_path: Option<String>,

    /// Taxonomy version stamped on built-in assets
    #[serde(default = "default_taxonomy_version")]
    pub taxonomy_version: i64,

    /// Model version stamped on built-in assets
    #[serde(default = "default_model_version")]
    pub model_version: i64,
}

fn default_taxonomy_version() -> i64 {
    2
}

fn default_model_version() -> i64 {
    5
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            assets_path: None,
            taxonomy_version: default_taxonomy_version(),
            model_version: default_model_version(),
        }
    }
}

/// Background loop settings for `topics-daemon start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Seconds between epoch/reconciliation checks
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Newline-separated list of installed apps
    #[serde(default)]
    pub installed_apps_path: Option<String>,
}

fn default_tick_interval_secs() -> u64 {
    3600
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            installed_apps_path: None,
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to RocksDB storage directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Engine configuration
    #[serde(default)]
    pub engine: EngineSettings,

    /// Classifier configuration
    #[serde(default)]
    pub classifier: ClassifierSettings,

    /// Daemon loop configuration
    #[serde(default)]
    pub daemon: DaemonSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "device-topics")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            engine: EngineSettings::default(),
            classifier: ClassifierSettings::default(),
            daemon: DaemonSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/device-topics/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (TOPICS_*, `__` between nested sections)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, TopicsError> {
        let config_dir = ProjectDirs::from("", "", "device-topics")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| TopicsError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| TopicsError::Config(e.to_string()))?
            .set_default(
                "engine.number_of_lookback_epochs",
                i64::from(default_lookback_epochs()),
            )
            .map_err(|e| TopicsError::Config(e.to_string()))?
            .set_default(
                "engine.number_of_top_topics",
                i64::from(default_top_topics()),
            )
            .map_err(|e| TopicsError::Config(e.to_string()))?
            .set_default(
                "engine.number_of_random_topics",
                i64::from(default_random_topics()),
            )
            .map_err(|e| TopicsError::Config(e.to_string()))?
            .set_default(
                "engine.percentage_for_random_topic",
                i64::from(default_percentage_for_random_topic()),
            )
            .map_err(|e| TopicsError::Config(e.to_string()))?
            .set_default("engine.epoch_period_ms", default_epoch_period_ms())
            .map_err(|e| TopicsError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // TOPICS_LOG_LEVEL, TOPICS_ENGINE__NUMBER_OF_TOP_TOPICS, ...
        builder = builder.add_source(
            Environment::with_prefix("TOPICS")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("engine.global_blocked_topic_ids")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TopicsError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| TopicsError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), TopicsError> {
        self.engine.validate().map_err(TopicsError::Config)?;
        if self.daemon.tick_interval_secs == 0 {
            return Err(TopicsError::Config(
                "daemon.tick_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Expand ~ in db_path to the home directory
    pub fn expanded_db_path(&self) -> PathBuf {
        if let Some(rest) = self.db_path.strip_prefix("~/") {
            if let Some(dirs) = BaseDirs::new() {
                return dirs.home_dir().join(rest);
            }
        }
        PathBuf::from(&self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.engine.number_of_lookback_epochs, 3);
        assert_eq!(settings.engine.number_of_top_topics, 5);
        assert_eq!(settings.engine.number_of_random_topics, 1);
        assert_eq!(settings.engine.percentage_for_random_topic, 5);
        assert_eq!(settings.engine.epoch_period_ms, 604_800_000);
        assert_eq!(
            settings.engine.consent_source_of_truth,
            ConsentSourceOfTruth::LocalOnly
        );
    }

    #[test]
    fn test_load_with_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.engine.number_of_top_topics, 5);
        assert!(settings.engine.global_blocked_topic_ids.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n\n[engine]\nnumber_of_top_topics = 4\nglobal_blocked_topic_ids = [10010, 10020]\nconsent_source_of_truth = \"local_and_service\"\n"
        )
        .unwrap();

        let settings = Settings::load(Some(&file.path().to_string_lossy())).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.engine.number_of_top_topics, 4);
        assert_eq!(settings.engine.global_blocked_topic_ids, vec![10010, 10020]);
        assert_eq!(
            settings.engine.consent_source_of_truth,
            ConsentSourceOfTruth::LocalAndService
        );
        // Untouched keys keep their defaults
        assert_eq!(settings.engine.number_of_random_topics, 1);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[engine]\nnumber_of_random_topics = 0\n").unwrap();

        let result = Settings::load(Some(&file.path().to_string_lossy()));
        assert!(matches!(result, Err(TopicsError::Config(_))));
    }

    #[test]
    fn test_engine_validation() {
        let mut engine = EngineSettings::default();
        assert!(engine.validate().is_ok());

        engine.number_of_top_topics = 0;
        assert!(engine.validate().is_err());

        engine.number_of_top_topics = 5;
        engine.percentage_for_random_topic = 101;
        assert!(engine.validate().is_err());

        engine.percentage_for_random_topic = 5;
        engine.number_of_epochs_to_keep_in_history = 2;
        assert!(engine.validate().is_err());

        engine.number_of_epochs_to_keep_in_history = 3;
        engine.epoch_period_ms = 0;
        assert!(engine.validate().is_err());
    }

    #[test]
    fn test_consent_mode_serialization() {
        let json = serde_json::to_string(&ConsentSourceOfTruth::AlternateStoreOnly).unwrap();
        assert_eq!(json, "\"alternate_store_only\"");
    }

    #[test]
    fn test_expanded_db_path_plain() {
        let settings = Settings {
            db_path: "/var/lib/topics".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.expanded_db_path(), PathBuf::from("/var/lib/topics"));
    }
}
