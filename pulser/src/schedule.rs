//! Pulse arithmetic
//!
//! Every logical message is released at the first interval boundary after its
//! original send time, shifted by the configured offset:
//!
//! ```text
//! emit = floor(sent, interval) + interval + offset
//! delay = max(0, emit - now)
//! ```
//!
//! Boundaries are multiples of `interval` counted from the Unix epoch, at
//! millisecond precision. None of these functions read the wall clock; the
//! caller supplies `now`, usually from a [`Clock`].

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::attributes::OriginalAttributes;
use crate::error::{PulseError, Result};

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Jump to an instant
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    /// Move forward (or backward, for a negative delta)
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Convert epoch milliseconds to an instant
pub fn instant_from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or(PulseError::TimestampOutOfRange(millis))
}

/// Original send time of the logical message
pub fn sent_time(anchor: &OriginalAttributes) -> Result<DateTime<Utc>> {
    instant_from_millis(anchor.sent_timestamp)
}

/// Instant at which the message becomes eligible for release
///
/// Negative offsets are applied as-is and may land before the boundary they
/// are added to.
pub fn emit_time(anchor: &OriginalAttributes, interval: TimeDelta, offset: TimeDelta) -> Result<DateTime<Utc>> {
    let interval_ms = interval.num_milliseconds();
    if interval_ms <= 0 {
        return Err(PulseError::Configuration(format!(
            "emit interval must be at least 1ms, got {}",
            interval
        )));
    }

    let sent_ms = anchor.sent_timestamp;
    let floor_ms = sent_ms
        .div_euclid(interval_ms)
        .checked_mul(interval_ms)
        .ok_or(PulseError::TimestampOutOfRange(sent_ms))?;

    instant_from_millis(floor_ms)?
        .checked_add_signed(TimeDelta::milliseconds(interval_ms))
        .and_then(|t| t.checked_add_signed(offset))
        .ok_or(PulseError::TimestampOutOfRange(sent_ms))
}

/// Time left until the emit instant, floored at zero
pub fn delay_duration(
    anchor: &OriginalAttributes,
    interval: TimeDelta,
    offset: TimeDelta,
    now: DateTime<Utc>,
) -> Result<Duration> {
    let emit = emit_time(anchor, interval, offset)?;
    // to_std fails exactly when the difference is negative
    Ok((emit - now).to_std().unwrap_or(Duration::ZERO))
}
