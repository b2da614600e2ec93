//! Lock evaluation for capsule read attempts.
//!
//! [`evaluate`] is a pure function of the capsule and the reader context:
//! calling it any number of times never changes persisted state. Gates run
//! in a fixed order and the first failing gate decides the verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capsule::Capsule;
use crate::geo::Coordinates;

/// What the server knows about the reader at the time of the request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReaderContext {
    /// Server clock, never client supplied.
    pub now: DateTime<Utc>,
    /// Best-effort client position. Absence is valid but restrictive.
    pub position: Option<Coordinates>,
}

impl ReaderContext {
    pub fn new(now: DateTime<Utc>, position: Option<Coordinates>) -> Self {
        Self { now, position }
    }

    /// Builds a context from optional query parameters. A half-supplied
    /// pair counts as no position at all.
    pub fn from_parts(now: DateTime<Utc>, lat: Option<f64>, lon: Option<f64>) -> Self {
        let position = match (lat, lon) {
            (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
            _ => None,
        };
        Self { now, position }
    }
}

/// Closed set of reasons a capsule stays locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    UnlockDateNotReached,
    LocationRequired,
    OutsideRadius,
    AlreadyAccessed,
    AccessLimitReached,
}

impl LockReason {
    pub fn message(&self) -> &'static str {
        match self {
            LockReason::UnlockDateNotReached => "Unlock date not reached yet",
            LockReason::LocationRequired => "Location required but not provided",
            LockReason::OutsideRadius => "Location not within allowed radius",
            LockReason::AlreadyAccessed => "Already accessed (one-time only)",
            LockReason::AccessLimitReached => "Maximum access limit reached",
        }
    }
}

impl std::fmt::Display for LockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockVerdict {
    Unlocked,
    Locked(LockReason),
}

impl LockVerdict {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, LockVerdict::Unlocked)
    }

    pub fn reason(&self) -> Option<LockReason> {
        match self {
            LockVerdict::Unlocked => None,
            LockVerdict::Locked(reason) => Some(*reason),
        }
    }
}

/// Decide whether `capsule` may be revealed to the reader right now.
pub fn evaluate(capsule: &Capsule, reader: &ReaderContext) -> LockVerdict {
    // 1. temporal
    if capsule.unlock_date > reader.now {
        return LockVerdict::Locked(LockReason::UnlockDateNotReached);
    }

    // 2. spatial
    if let Some(fence) = &capsule.location {
        let Some(position) = reader.position else {
            return LockVerdict::Locked(LockReason::LocationRequired);
        };
        if !fence.contains(&position) {
            return LockVerdict::Locked(LockReason::OutsideRadius);
        }
    }

    // 3 + 4. one-time and quota
    match check_access_policy(capsule) {
        Ok(()) => LockVerdict::Unlocked,
        Err(reason) => LockVerdict::Locked(reason),
    }
}

/// The gates an open itself could violate: one-time and quota.
///
/// Used on its own by the two-step open, which trusts the caller for the
/// temporal and spatial gates but must never overrun the access limits.
pub fn check_access_policy(capsule: &Capsule) -> Result<(), LockReason> {
    if capsule.policy.is_one_time_access && capsule.state.is_accessed {
        return Err(LockReason::AlreadyAccessed);
    }

    if let Some(max) = capsule.policy.max_access {
        if capsule.state.access_count >= max {
            return Err(LockReason::AccessLimitReached);
        }
    }

    Ok(())
}
