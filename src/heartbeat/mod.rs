use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::config::HeartbeatConfig;

pub const DEFAULT_INTERVAL_MS: u64 = 2_500;
pub const DEFAULT_LIVENESS: u32 = 3;
pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 60_000;
pub const MAX_LIVENESS: u32 = 100;

#[derive(Debug, PartialEq, Eq)]
pub enum HeartbeatError {
    InvalidInterval { provided_ms: u64 },
    InvalidLiveness { provided: u32 },
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "heartbeat interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::InvalidLiveness { provided } => write!(
                f,
                "heartbeat liveness must be between 1 and {MAX_LIVENESS}, got {provided}"
            ),
        }
    }
}

impl std::error::Error for HeartbeatError {}

/// How often idle workers are pinged and how many missed intervals a worker
/// survives before it is reaped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    interval_ms: u64,
    liveness: u32,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            liveness: DEFAULT_LIVENESS,
        }
    }
}

impl TryFrom<HeartbeatConfig> for HeartbeatPolicy {
    type Error = HeartbeatError;

    fn try_from(value: HeartbeatConfig) -> Result<Self, Self::Error> {
        Self::new(value.interval_ms, value.liveness)
    }
}

impl HeartbeatPolicy {
    pub fn new(interval_ms: u64, liveness: u32) -> Result<Self, HeartbeatError> {
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
            return Err(HeartbeatError::InvalidInterval {
                provided_ms: interval_ms,
            });
        }
        if !(1..=MAX_LIVENESS).contains(&liveness) {
            return Err(HeartbeatError::InvalidLiveness { provided: liveness });
        }

        Ok(Self {
            interval_ms,
            liveness,
        })
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn liveness(&self) -> u32 {
        self.liveness
    }

    /// Upper bound for a single transport poll.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn expiry_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.interval_ms * u64::from(self.liveness)) as i64)
    }

    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.expiry_window()
    }

    pub fn next_due_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::milliseconds(self.interval_ms as i64)
    }

    pub fn metadata_payload(&self) -> Value {
        json!({
            "interval_ms": self.interval_ms,
            "liveness": self.liveness,
            "expiry_ms": self.interval_ms * u64::from(self.liveness)
        })
    }
}
