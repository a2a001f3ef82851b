//! Mock classifier for testing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::SeedableRng;

use topics_types::Topic;

use super::{select_top_topics, Classifier, ClassifierError};

/// Classifier with fixed app assignments.
///
/// Top topics are ranked with the shared selection over a small label
/// set unless a fixed list is configured. Failures can be injected to
/// exercise the aborted-epoch path.
pub struct MockClassifier {
    assignments: BTreeMap<String, Vec<Topic>>,
    labels: Vec<Topic>,
    fixed_top_topics: Option<Vec<Topic>>,
    fail: AtomicBool,
    rng: Mutex<StdRng>,
}

impl MockClassifier {
    /// Create with fixed `app → topics` assignments and labels `1..=20`
    /// at taxonomy and model version 1.
    pub fn new(assignments: BTreeMap<String, Vec<Topic>>) -> Self {
        Self {
            assignments,
            labels: (1..=20).map(|id| Topic::new(id, 1, 1)).collect(),
            fixed_top_topics: None,
            fail: AtomicBool::new(false),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Replace the taxonomy labels used for padding and random topics.
    pub fn with_labels(mut self, labels: Vec<Topic>) -> Self {
        self.labels = labels;
        self
    }

    /// Always return this top topics list.
    pub fn with_top_topics(mut self, top_topics: Vec<Topic>) -> Self {
        self.fixed_top_topics = Some(top_topics);
        self
    }

    /// Make every call fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ClassifierError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClassifierError::Unavailable(
                "mock classifier set to fail".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl Classifier for MockClassifier {
    fn classify(
        &self,
        apps: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<Topic>>, ClassifierError> {
        self.check_available()?;
        Ok(apps
            .iter()
            .map(|app| {
                let topics = self.assignments.get(app).cloned().unwrap_or_default();
                (app.clone(), topics)
            })
            .collect())
    }

    fn top_topics(
        &self,
        app_topics: &BTreeMap<String, Vec<Topic>>,
        number_of_top_topics: usize,
        number_of_random_topics: usize,
    ) -> Result<Vec<Topic>, ClassifierError> {
        self.check_available()?;
        if let Some(fixed) = &self.fixed_top_topics {
            if number_of_top_topics == 0 || number_of_random_topics == 0 {
                return Err(ClassifierError::InvalidArgument(
                    "topic counts must be > 0".to_string(),
                ));
            }
            return Ok(fixed.clone());
        }

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
