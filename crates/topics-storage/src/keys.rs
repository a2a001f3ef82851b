//! Key encoding for storage tables.
//!
//! Epoch-keyed format: `{epoch:020}:{segment}:{segment}...`
//! - epoch: non-negative epoch id, zero-padded to 20 digits
//! - segment: identifier with `%` and `:` percent-escaped
//!
//! Zero padding makes lexicographic order match epoch order, so an
//! epoch range is one forward scan. Escaping keeps `("a:b", "c")` and
//! `("a", "b:c")` from sharing a key.

use topics_types::{Contributor, EpochId, Topic};

use crate::error::StorageError;

/// Width of the zero-padded epoch component.
pub const EPOCH_WIDTH: usize = 20;

/// Escape a key segment.
pub fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace(':', "%3A")
}

/// Key prefix shared by every row of one epoch: `{epoch:020}:`
pub fn epoch_prefix(epoch: EpochId) -> Result<Vec<u8>, StorageError> {
    if epoch < 0 {
        return Err(StorageError::Key(format!("Negative epoch id: {}", epoch)));
    }
    Ok(format!("{:0width$}:", epoch, width = EPOCH_WIDTH).into_bytes())
}

/// Build an epoch-keyed row key from escaped segments.
pub fn epoch_key(epoch: EpochId, segments: &[&str]) -> Result<Vec<u8>, StorageError> {
    let mut key = epoch_prefix(epoch)?;
    let escaped: Vec<String> = segments.iter().map(|s| escape_segment(s)).collect();
    key.extend_from_slice(escaped.join(":").as_bytes());
    Ok(key)
}

/// Decode the epoch component of an epoch-keyed row.
pub fn epoch_of_key(key: &[u8]) -> Result<EpochId, StorageError> {
    let head = key
        .get(..EPOCH_WIDTH)
        .ok_or_else(|| StorageError::Key(format!("Key too short: {} bytes", key.len())))?;
    let s = std::str::from_utf8(head)
        .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
    s.parse()
        .map_err(|e| StorageError::Key(format!("Invalid epoch: {}", e)))
}

/// Segment naming a topic: `{topic_id}.{taxonomy_version}.{model_version}`
pub fn topic_segment(topic: &Topic) -> String {
    format!(
        "{}.{}.{}",
        topic.topic_id, topic.taxonomy_version, topic.model_version
    )
}

/// Segment naming a contributor: `app={app}` or `padding`
pub fn contributor_segment(contributor: &Contributor) -> String {
    match contributor {
        Contributor::App(app) => format!("app={}", app),
        Contributor::Padding => "padding".to_string(),
    }
}

/// Key for a blocked topic row (not epoch keyed).
pub fn blocked_topic_key(topic: &Topic) -> Vec<u8> {
    format!("blocked:{}", topic_segment(topic)).into_bytes()
}

/// Key holding the epoch origin timestamp.
pub const EPOCH_ORIGIN_KEY: &[u8] = b"origin";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_key_format() {
        let key = epoch_key(3, &["com.app", ""]).unwrap();
        assert_eq!(
            String::from_utf8(key).unwrap(),
            "00000000000000000003:com.app:"
        );
    }

    #[test]
    fn test_epoch_key_ordering() {
        let k9 = epoch_key(9, &["z"]).unwrap();
        let k10 = epoch_key(10, &["a"]).unwrap();
        assert!(k9 < k10);
    }

    #[test]
    fn test_negative_epoch_rejected() {
        assert!(matches!(epoch_prefix(-1), Err(StorageError::Key(_))));
    }

    #[test]
    fn test_escaped_segments_do_not_collide() {
        let a = epoch_key(1, &["a:b", "c"]).unwrap();
        let b = epoch_key(1, &["a", "b:c"]).unwrap();
        assert_ne!(a, b);
        assert_eq!(escape_segment("100%:x"), "100%25%3Ax");
    }

    #[test]
    fn test_epoch_of_key() {
        let key = epoch_key(42, &["app", "sdk"]).unwrap();
        assert_eq!(epoch_of_key(&key).unwrap(), 42);
        assert!(epoch_of_key(b"short").is_err());
    }

    #[test]
    fn test_topic_and_contributor_segments() {
        assert_eq!(topic_segment(&Topic::new(10004, 2, 5)), "10004.2.5");
        assert_eq!(contributor_segment(&Contributor::app("a")), "app=a");
        assert_eq!(contributor_segment(&Contributor::Padding), "padding");
        assert_eq!(
            blocked_topic_key(&Topic::new(1, 1, 1)),
            b"blocked:1.1.1".to_vec()
        );
    }
}
