//! Time slots for session-key rotation.
//!
//! A slot is a fixed 30-minute epoch counted from the Unix epoch. Keys are
//! derived per slot; a message sealed under slot `S` is accepted until
//! `end(S) + TOLERANCE` and refused afterwards.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of one slot in seconds.
pub const SLOT_DURATION_SECS: u64 = 1800;

/// Renewal and expiry tolerance in seconds.
pub const TOLERANCE_SECS: u64 = 180;

/// Source of "now" in Unix seconds.
///
/// Abstracted so slot boundaries can be tested deterministically.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// An epoch index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeSlot(u64);

impl TimeSlot {
    #[must_use]
    pub fn from_index(index: u64) -> Self {
        Self(index)
    }

    /// Slot containing `now`.
    #[must_use]
    pub fn at(now_secs: u64) -> Self {
        Self(now_secs / SLOT_DURATION_SECS)
    }

    /// Slot a fresh key should be derived for.
    ///
    /// Near the end of the current slot the next one is chosen, so a new key
    /// never starts life inside the renewal window.
    #[must_use]
    pub fn for_new_key(now_secs: u64) -> Self {
        let current = Self::at(now_secs);
        if current.needs_renewal(now_secs) {
            current.next()
        } else {
            current
        }
    }

    #[must_use]
    pub fn index(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// First second of the slot.
    #[must_use]
    pub fn start_secs(&self) -> u64 {
        self.0.saturating_mul(SLOT_DURATION_SECS)
    }

    /// First second after the slot.
    #[must_use]
    pub fn end_secs(&self) -> u64 {
        self.0.saturating_add(1).saturating_mul(SLOT_DURATION_SECS)
    }

    /// Past its end by more than the tolerance.
    #[must_use]
    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs > self.end_secs().saturating_add(TOLERANCE_SECS)
    }

    /// Within the tolerance of its end (or past it).
    #[must_use]
    pub fn needs_renewal(&self, now_secs: u64) -> bool {
        now_secs.saturating_add(TOLERANCE_SECS) >= self.end_secs()
    }

    /// Acceptable on an inbound message: not expired, and no later than the
    /// slot a server would hand out right now.
    #[must_use]
    pub fn is_acceptable(&self, now_secs: u64) -> bool {
        !self.is_expired(now_secs) && *self <= Self::at(now_secs).next()
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}
