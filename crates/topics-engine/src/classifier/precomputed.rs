//! Classifier backed by a precomputed app → topics table.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use topics_types::{ClassifierSettings, Topic};

use super::{select_top_topics, Classifier, ClassifierError};
use crate::selection::SharedRng;

const BUILT_IN_ASSETS: &str = include_str!("../../assets/precomputed_app_topics.json");

/// On-disk asset format.
///
/// Versions are optional; when absent the configured versions apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierAssets {
    #[serde(default)]
    pub taxonomy_version: Option<i64>,
    #[serde(default)]
    pub model_version: Option<i64>,
    /// Every topic id in the taxonomy
    pub labels: Vec<i32>,
    /// Precomputed topic ids per app
    #[serde(default)]
    pub apps: BTreeMap<String, Vec<i32>>,
}

impl ClassifierAssets {
    pub fn from_json(json: &str) -> Result<Self, ClassifierError> {
        serde_json::from_str(json).map_err(|e| ClassifierError::Asset(e.to_string()))
    }

    pub fn built_in() -> Result<Self, ClassifierError> {
        Self::from_json(BUILT_IN_ASSETS)
    }

    /// Every app topic must be a taxonomy label, and labels are positive.
    fn validate(&self) -> Result<(), ClassifierError> {
        if let Some(bad) = self.labels.iter().find(|id| **id <= 0) {
            return Err(ClassifierError::Asset(format!("invalid label id {}", bad)));
        }
        let labels: BTreeSet<i32> = self.labels.iter().copied().collect();
        for (app, ids) in &self.apps {
            if let Some(unknown) = ids.iter().find(|id| !labels.contains(id)) {
                return Err(ClassifierError::Asset(format!(
                    "app {} maps to unknown topic {}",
                    app, unknown
                )));
            }
        }
        Ok(())
    }
}

/// Looks apps up in a precomputed table; unknown apps get no topics.
pub struct PrecomputedClassifier {
    labels: Vec<Topic>,
    app_topics: BTreeMap<String, Vec<Topic>>,
    rng: SharedRng,
}

impl PrecomputedClassifier {
    /// Build from parsed assets, stamping topics with the asset versions
    /// or the configured defaults.
    pub fn new(
        assets: ClassifierAssets,
        settings: &ClassifierSettings,
        rng: SharedRng,
    ) -> Result<Self, ClassifierError> {
        assets.validate()?;
        let taxonomy_version = assets.taxonomy_version.unwrap_or(settings.taxonomy_version);
        let model_version = assets.model_version.unwrap_or(settings.model_version);
        let topic = |id: i32| Topic::new(id, taxonomy_version, model_version);

        let labels = assets.labels.iter().copied().map(topic).collect();
        let app_topics = assets
            .apps
            .into_iter()
            .map(|(app, ids)| (app, ids.into_iter().map(topic).collect()))
            .collect();

        Ok(Self {
            labels,
            app_topics,
            rng,
        })
    }

    /// Load from `settings.assets_path`, or the built-in table when unset.
    pub fn from_settings(
        settings: &ClassifierSettings,
        rng: SharedRng,
    ) -> Result<Self, ClassifierError> {
        let assets = match &settings.assets_path {
            Some(path) => Self::read_assets(Path::new(path))?,
            None => ClassifierAssets::built_in()?,
        };
        let classifier = Self::new(assets, settings, rng)?;
        info!(
            labels = classifier.labels.len(),
            apps = classifier.app_topics.len(),
            "Loaded precomputed classifier"
        );
        Ok(classifier)
    }

    fn read_assets(path: &Path) -> Result<ClassifierAssets, ClassifierError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ClassifierError::Asset(format!("{}: {}", path.display(), e)))?;
        ClassifierAssets::from_json(&json)
    }

    pub fn labels(&self) -> &[Topic] {
        &self.labels
    }
}

impl Classifier for PrecomputedClassifier {
    fn classify(
        &self,
        apps: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<Topic>>, ClassifierError> {
        let result: BTreeMap<String, Vec<Topic>> = apps
            .iter()
            .map(|app| {
                let topics = self.app_topics.get(app).cloned().unwrap_or_default();
                (app.clone(), topics)
            })
            .collect();
        debug!(apps = result.len(), "Classified apps");
        Ok(result)
    }

    fn top_topics(
        &self,
        app_topics: &BTreeMap<String, Vec<Topic>>,
        number_of_top_topics: usize,
        number_of_random_topics: usize,
    ) -> Result<Vec<Topic>, ClassifierError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;
        select_top_topics(
            app_topics,
            &self.labels,
            number_of_top_topics,
            number_of_random_topics,
            &mut *rng,
        )
    }
}
