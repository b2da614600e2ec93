//! The capsule entity and its one-way runtime state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KeepsakeError;
use crate::geo::Coordinates;
use crate::types::{CapsuleId, FileId, KeyMaterial, UserId};

// ---------------------------------------------------------------------------
// Spatial gate
// ---------------------------------------------------------------------------

/// Radius-based proximity requirement around a fixed coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoFence {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_name: Option<String>,
}

impl GeoFence {
    pub fn center(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    /// Inclusive: a reader exactly on the boundary is inside.
    pub fn contains(&self, reader: &Coordinates) -> bool {
        self.center().distance_to(reader) <= self.radius_meters
    }

    pub fn validate(&self) -> Result<(), KeepsakeError> {
        if !self.center().is_valid() {
            return Err(KeepsakeError::InvalidCapsule(format!(
                "location ({}, {}) is out of range",
                self.latitude, self.longitude
            )));
        }
        if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            return Err(KeepsakeError::InvalidCapsule(format!(
                "radius must be a positive number of meters, got {}",
                self.radius_meters
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Access policy (immutable after creation)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub is_one_time_access: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_access: Option<u32>,
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// Persisted runtime state. Every field only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessState {
    pub is_unlocked: bool,
    pub is_accessed: bool,
    pub access_count: u32,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl AccessState {
    /// State after one more successful open at `now`.
    ///
    /// `unlocked_at` is write-once; `last_accessed_at` is always replaced.
    pub fn after_open(&self, now: DateTime<Utc>) -> AccessState {
        AccessState {
            is_unlocked: true,
            is_accessed: true,
            access_count: self.access_count.saturating_add(1),
            unlocked_at: Some(self.unlocked_at.unwrap_or(now)),
            last_accessed_at: Some(now),
        }
    }
}

// ---------------------------------------------------------------------------
// Capsule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Capsule {
    pub id: CapsuleId,
    /// Immutable after creation.
    pub owner_id: UserId,
    pub title: String,
    pub content: Option<String>,
    pub file_id: Option<FileId>,
    pub encryption_key: KeyMaterial,
    pub unlock_date: DateTime<Utc>,
    pub location: Option<GeoFence>,
    pub policy: AccessPolicy,
    pub state: AccessState,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

/// Owner-supplied fields for a new capsule.
#[derive(Debug, Clone)]
pub struct NewCapsule {
    pub title: String,
    pub content: Option<String>,
    pub file_id: Option<FileId>,
    pub unlock_date: DateTime<Utc>,
    pub location: Option<GeoFence>,
    pub policy: AccessPolicy,
    pub is_public: bool,
}

impl NewCapsule {
    pub fn validate(&self) -> Result<(), KeepsakeError> {
        if self.title.trim().is_empty() {
            return Err(KeepsakeError::InvalidCapsule("title is required".into()));
        }
        if let Some(location) = &self.location {
            location.validate()?;
        }
        if self.policy.max_access == Some(0) {
            return Err(KeepsakeError::InvalidCapsule(
                "max_access must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Capsule {
    /// Build a fresh, sealed capsule. Runtime state starts zeroed.
    pub fn create(
        new: NewCapsule,
        owner_id: UserId,
        encryption_key: KeyMaterial,
        now: DateTime<Utc>,
    ) -> Result<Self, KeepsakeError> {
        new.validate()?;

        Ok(Self {
            id: CapsuleId::new(),
            owner_id,
            title: new.title,
            content: new.content,
            file_id: new.file_id,
            encryption_key,
            unlock_date: new.unlock_date,
            location: new.location,
            policy: new.policy,
            state: AccessState::default(),
            is_public: new.is_public,
            created_at: now,
        })
    }

    /// True once a one-time or quota limit has been hit. Terminal.
    pub fn is_exhausted(&self) -> bool {
        (self.policy.is_one_time_access && self.state.is_accessed)
            || self
                .policy
                .max_access
                .is_some_and(|max| self.state.access_count >= max)
    }

    /// Eligible for the public wall: public and unlocked either by the
    /// persisted flag or by the date having passed.
    pub fn is_publishable(&self, now: DateTime<Utc>) -> bool {
        self.is_public && (self.state.is_unlocked || self.unlock_date <= now)
    }
}
