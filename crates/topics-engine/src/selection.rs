//! Randomized topic assignment and caller learnability.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use topics_types::Topic;

use crate::error::EngineError;

/// Random source shared by the engine, reconciler and cache.
pub type SharedRng = Arc<Mutex<dyn RngCore + Send>>;

/// Random source seeded from the operating system.
pub fn os_rng() -> SharedRng {
    Arc::new(Mutex::new(StdRng::from_os_rng()))
}

/// Deterministic random source.
pub fn seeded_rng(seed: u64) -> SharedRng {
    Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))
}

pub(crate) fn lock_rng(rng: &SharedRng) -> Result<MutexGuard<'_, dyn RngCore + Send>, EngineError> {
    rng.lock().map_err(|e| EngineError::Lock(e.to_string()))
}

/// Topic → callers (apps or SDKs) entitled to learn it.
pub type CallersCanLearnMap = BTreeMap<Topic, BTreeSet<String>>;

/// Draw one topic to assign to a caller.
///
/// With both lists non-empty, a roll in `[0, 100)` below
/// `percentage_for_random` picks from `random`, otherwise from `regular`.
/// With one list empty the draw comes from the other. Returns `None`
/// when both are empty.
pub fn select_assigned_topic<R: RngCore + ?Sized>(
    regular: &[Topic],
    random: &[Topic],
    percentage_for_random: u32,
    rng: &mut R,
) -> Option<Topic> {
    match (regular.is_empty(), random.is_empty()) {
        (true, true) => None,
        (true, false) => Some(random[rng.random_range(0..random.len())]),
        (false, true) => Some(regular[rng.random_range(0..regular.len())]),
        (false, false) => {
            if rng.random_range(0..100u32) < percentage_for_random {
                Some(random[rng.random_range(0..random.len())])
            } else {
                Some(regular[rng.random_range(0..regular.len())])
            }
        }
    }
}

/// Whether `caller` may be told `topic`.
///
/// Random-slice topics (last index `>= number_of_top_topics`) are
/// learnable by anyone. Regular topics need the caller in the topic's
/// learner set. A topic absent from `top_topics` is never learnable.
pub fn is_topic_learnable_by_caller(
    topic: &Topic,
    caller: &str,
    callers_can_learn: &CallersCanLearnMap,
    top_topics: &[Topic],
    number_of_top_topics: usize,
) -> bool {
    let Some(index) = top_topics.iter().rposition(|t| t == topic) else {
        return false;
    };
    if index >= number_of_top_topics {
        return true;
    }
    callers_can_learn
        .get(topic)
        .is_some_and(|callers| callers.contains(caller))
}
