//! Wall clock and epoch id derivation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};

use topics_types::EpochId;

use crate::error::EngineError;
use crate::store::TopicStore;

/// Source of wall-clock time in milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// System time via chrono.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for tests.
#[derive(Debug, Default)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Derives epoch ids from a persisted origin and a fixed period.
///
/// Ids handed out by one clock never decrease while the origin stays the
/// same, even if the wall clock steps back.
pub struct EpochClock {
    store: Arc<TopicStore>,
    clock: Arc<dyn Clock>,
    period_ms: i64,
    /// Origin and highest id returned for it.
    last: Mutex<Option<(i64, EpochId)>>,
}

impl EpochClock {
    pub fn new(store: Arc<TopicStore>, clock: Arc<dyn Clock>, period_ms: i64) -> Result<Self, EngineError> {
        if period_ms <= 0 {
            return Err(EngineError::InvalidArgument(format!(
                "epoch period must be > 0, got {}",
                period_ms
            )));
        }
        Ok(Self {
            store,
            clock,
            period_ms,
            last: Mutex::new(None),
        })
    }

    /// Current epoch id: `floor((now - origin) / period)`.
    ///
    /// The origin is written on first use and never again; the check and
    /// the write happen under one lock. A clock behind the origin reads as
    /// epoch 0, and a clock stepping back keeps the last id returned.
    pub fn current_epoch_id(&self) -> Result<EpochId, EngineError> {
        let mut last = self
            .last
            .lock()
            .map_err(|e| EngineError::Lock(e.to_string()))?;

        let now = self.clock.now_millis();
        let origin = match self.store.epoch_origin()? {
            Some(origin) => origin,
            None => {
                self.store.persist_epoch_origin(now)?;
                info!(origin = now, "Epoch origin not found, persisted current time");
                now
            }
        };

        let mut epoch = if now < origin {
            warn!(now, origin, "Clock is behind the epoch origin, using epoch 0");
            0
        } else {
            (now - origin).div_euclid(self.period_ms)
        };
        if let Some((last_origin, last_epoch)) = *last {
            if last_origin == origin && epoch < last_epoch {
                warn!(epoch, last_epoch, "Clock moved backwards, keeping last epoch");
                epoch = last_epoch;
            }
        }
        *last = Some((origin, epoch));
        Ok(epoch)
    }

    pub fn period_ms(&self) -> i64 {
        self.period_ms
    }
}
