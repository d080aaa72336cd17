use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;
use crate::store::KeyValueStore;

/// Key suffix for the persisted latch
const LATCH_KEY_SUFFIX: &str = "sync";

pub(crate) fn latch_key(prefix: &str) -> String {
    format!("{}.{}", prefix, LATCH_KEY_SUFFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    /// Normal operation.
    Open,
    /// Halted after too many errors.
    Latched,
    /// Cooldown elapsed; the next tick sends a single probe.
    Probing,
}

/// What a tick is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Flush,
    Probe,
    Halted,
}

/// A latch as stored under `<prefix>.sync`, so it outlives the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatchRecord {
    pub latched_at: DateTime<Utc>,
}

impl LatchRecord {
    /// Read the stored latch, if any. Unreadable records are ignored.
    pub fn load(store: &dyn KeyValueStore, prefix: &str) -> Option<Self> {
        let key = latch_key(prefix);
        let contents = match store.load(&key) {
            Ok(contents) => contents?,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read latch record, starting open");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt latch record, starting open");
                None
            }
        }
    }

    /// Store `record`, or clear the key when the engine is open.
    pub fn save(record: Option<&Self>, store: &dyn KeyValueStore, prefix: &str) -> Result<(), StoreError> {
        let key = latch_key(prefix);
        match record {
            Some(record) => store.save(&key, &serde_json::to_string(record)?),
            None => store.remove(&key),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Breaker {
    state: EngineState,
    latched_at: Option<Instant>,
    latched_wall: Option<DateTime<Utc>>,
    cooldown: Option<Duration>,
}

impl Breaker {
    /// `cooldown: None` makes a latch permanent until [`Breaker::reset`].
    pub fn new(cooldown: Option<Duration>) -> Self {
        Self {
            state: EngineState::Open,
            latched_at: None,
            latched_wall: None,
            cooldown,
        }
    }

    /// Rebuild a breaker from a stored latch. The cooldown keeps running
    /// from the original latch time.
    pub fn restore(cooldown: Option<Duration>, record: Option<LatchRecord>, now: Instant) -> Self {
        let mut breaker = Self::new(cooldown);
        if let Some(record) = record {
            let elapsed = (Utc::now() - record.latched_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            breaker.state = EngineState::Latched;
            breaker.latched_at = Some(now.checked_sub(elapsed).unwrap_or(now));
            breaker.latched_wall = Some(record.latched_at);
        }
        breaker
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The latch to persist; `None` while open.
    pub fn record(&self) -> Option<LatchRecord> {
        match self.state {
            EngineState::Open => None,
            EngineState::Latched | EngineState::Probing => self
                .latched_wall
                .map(|latched_at| LatchRecord { latched_at }),
        }
    }

    pub fn gate(&mut self, now: Instant) -> Gate {
        match self.state {
            EngineState::Open => Gate::Flush,
            EngineState::Probing => Gate::Probe,
            EngineState::Latched => match (self.cooldown, self.latched_at) {
                (Some(cooldown), Some(at)) if now.saturating_duration_since(at) >= cooldown => {
                    self.state = EngineState::Probing;
                    Gate::Probe
                }
                _ => Gate::Halted,
            },
        }
    }

    pub fn trip(&mut self, now: Instant) {
        self.state = EngineState::Latched;
        self.latched_at = Some(now);
        self.latched_wall = Some(Utc::now());
    }

    /// Back to normal operation after a successful probe.
    pub fn recover(&mut self) {
        self.state = EngineState::Open;
        self.latched_at = None;
        self.latched_wall = None;
    }

    /// Manual reset, also valid for a permanent latch.
    pub fn reset(&mut self) -> EngineState {
        let previous = self.state;
        self.recover();
        previous
    }
}
