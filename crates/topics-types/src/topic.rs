//! Topic value type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Discrete time window id. Epoch 0 starts at the persisted origin.
pub type EpochId = i64;

/// An interest topic as produced by a classifier.
///
/// Equality covers all three fields, so the same topic id under a newer
/// taxonomy or model is a different topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    /// Taxonomy label id
    pub topic_id: i32,
    /// Version of the taxonomy the id belongs to
    pub taxonomy_version: i64,
    /// Version of the model that produced the classification
    pub model_version: i64,
}

impl Topic {
    pub fn new(topic_id: i32, taxonomy_version: i64, model_version: i64) -> Self {
        Self {
            topic_id,
            taxonomy_version,
            model_version,
        }
    }

    /// Serialize to JSON bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (taxonomy v{}, model v{})",
            self.topic_id, self.taxonomy_version, self.model_version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_covers_versions() {
        let a = Topic::new(1, 1, 1);
        assert_eq!(a, Topic::new(1, 1, 1));
        assert_ne!(a, Topic::new(1, 2, 1));
        assert_ne!(a, Topic::new(1, 1, 2));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let topic = Topic::new(10230, 2, 5);
        let bytes = topic.to_bytes().unwrap();
        assert_eq!(Topic::from_bytes(&bytes).unwrap(), topic);
    }

    #[test]
    fn test_display() {
        assert_eq!(Topic::new(7, 2, 5).to_string(), "7 (taxonomy v2, model v5)");
    }
}
