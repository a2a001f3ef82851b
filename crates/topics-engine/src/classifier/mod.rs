//! Classifier trait and implementations.
//!
//! A classifier maps app ids to candidate topics and picks each epoch's
//! top topics: `K` regular topics ranked by how many apps share them,
//! followed by `R` random taxonomy labels that obscure the real signal.

mod mock;
mod precomputed;

pub use mock::MockClassifier;
pub use precomputed::{ClassifierAssets, PrecomputedClassifier};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::seq::SliceRandom;
use rand::RngCore;
use thiserror::Error;

use topics_types::Topic;

/// Error type for classifier operations.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid classifier assets: {0}")]
    Asset(String),

    #[error("Classifier unavailable: {0}")]
    Unavailable(String),
}

/// Pluggable classifier.
pub trait Classifier: Send + Sync {
    /// Candidate topics for each app. Apps the classifier knows nothing
    /// about map to an empty list.
    fn classify(
        &self,
        apps: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<Topic>>, ClassifierError>;

    /// Ordered top topics: `number_of_top_topics` regular entries then
    /// `number_of_random_topics` random ones. Empty when there is no
    /// signal to rank.
    fn top_topics(
        &self,
        app_topics: &BTreeMap<String, Vec<Topic>>,
        number_of_top_topics: usize,
        number_of_random_topics: usize,
    ) -> Result<Vec<Topic>, ClassifierError>;
}

/// Shared top-topic selection.
///
/// Topics are ranked by the number of apps classified into them (ties
/// broken by ascending topic id). When fewer than `number_of_top_topics`
/// real topics exist, the regular slice is padded with unused labels.
/// `number_of_random_topics` further unused labels are appended.
pub fn select_top_topics<R: RngCore + ?Sized>(
    app_topics: &BTreeMap<String, Vec<Topic>>,
    labels: &[Topic],
    number_of_top_topics: usize,
    number_of_random_topics: usize,
    rng: &mut R,
) -> Result<Vec<Topic>, ClassifierError> {
    if number_of_top_topics == 0 {
        return Err(ClassifierError::InvalidArgument(
            "number_of_top_topics must be > 0".to_string(),
        ));
    }
    if number_of_random_topics == 0 {
        return Err(ClassifierError::InvalidArgument(
            "number_of_random_topics must be > 0".to_string(),
        ));
    }

    let mut counts: HashMap<Topic, usize> = HashMap::new();
    for topics in app_topics.values() {
        // An app counts once per topic
        let unique: BTreeSet<&Topic> = topics.iter().collect();
        for topic in unique {
            *counts.entry(*topic).or_default() += 1;
        }
    }
    if counts.is_empty() {
        return Ok(Vec::new());
    }

    let mut ranked: Vec<(Topic, usize)> = counts.into_iter().collect();
    ranked.sort_by(|(a, a_count), (b, b_count)| b_count.cmp(a_count).then_with(|| a.cmp(b)));

    let mut top: Vec<Topic> = ranked
        .into_iter()
        .take(number_of_top_topics)
        .map(|(topic, _)| topic)
        .collect();

    let mut unused: Vec<Topic> = labels
        .iter()
        .filter(|label| !top.contains(*label))
        .copied()
        .collect();
    unused.shuffle(rng);

    let padding = number_of_top_topics - top.len();
    let needed = padding + number_of_random_topics;
    if unused.len() < needed {
        return Err(ClassifierError::Asset(format!(
            "taxonomy has {} unused labels, {} needed",
            unused.len(),
            needed
        )));
    }
    top.extend(unused.into_iter().take(needed));
    Ok(top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn t(id: i32) -> Topic {
        Topic::new(id, 1, 1)
    }

    fn labels() -> Vec<Topic> {
        (1..=20).map(t).collect()
    }

    #[test]
    fn test_ranks_by_count_then_id() {
        let mut rng = StdRng::seed_from_u64(1);
        let app_topics = BTreeMap::from([
            ("a".to_string(), vec![t(3), t(1)]),
            ("b".to_string(), vec![t(3), t(2)]),
            ("c".to_string(), vec![t(3), t(2), t(4)]),
        ]);

        let top = select_top_topics(&app_topics, &labels(), 3, 1, &mut rng).unwrap();
        assert_eq!(top.len(), 4);
        assert_eq!(&top[..3], &[t(3), t(2), t(1)]);
        assert!(!top[..3].contains(&top[3]));
    }

    #[test]
    fn test_pads_regular_slice() {
        let mut rng = StdRng::seed_from_u64(2);
        let app_topics = BTreeMap::from([("a".to_string(), vec![t(7)])]);

        let top = select_top_topics(&app_topics, &labels(), 5, 1, &mut rng).unwrap();
        assert_eq!(top.len(), 6);
        assert_eq!(top[0], t(7));
        let unique: BTreeSet<_> = top.iter().collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn test_no_signal_is_empty() {
        let mut rng = StdRng::seed_from_u64(3);
        assert!(select_top_topics(&BTreeMap::new(), &labels(), 5, 1, &mut rng)
            .unwrap()
            .is_empty());

        let no_topics = BTreeMap::from([("a".to_string(), Vec::new())]);
        assert!(select_top_topics(&no_topics, &labels(), 5, 1, &mut rng)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_rejects_zero_counts() {
        let mut rng = StdRng::seed_from_u64(4);
        let app_topics = BTreeMap::from([("a".to_string(), vec![t(1)])]);
        assert!(matches!(
            select_top_topics(&app_topics, &labels(), 0, 1, &mut rng),
            Err(ClassifierError::InvalidArgument(_))
        ));
        assert!(matches!(
            select_top_topics(&app_topics, &labels(), 5, 0, &mut rng),
            Err(ClassifierError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_small_taxonomy() {
        let mut rng = StdRng::seed_from_u64(5);
        let app_topics = BTreeMap::from([("a".to_string(), vec![t(1)])]);
        let result = select_top_topics(&app_topics, &[t(1), t(2)], 5, 1, &mut rng);
        assert!(matches!(result, Err(ClassifierError::Asset(_))));
    }
}
