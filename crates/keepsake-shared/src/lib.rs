//! # keepsake-shared
//!
//! Domain core for Keepsake time capsules: the lock evaluator, the
//! capsule state transition, the payload cipher and the geofence
//! predicate. Everything here is pure; persistence and transport live in
//! `keepsake-store` and `keepsake-server`.

pub mod access;
pub mod capsule;
pub mod constants;
pub mod crypto;
pub mod entitlement;
pub mod error;
pub mod geo;
pub mod types;
pub mod wall;

pub use access::{evaluate, LockReason, LockVerdict, ReaderContext};
pub use capsule::{AccessPolicy, AccessState, Capsule, GeoFence, NewCapsule};
pub use error::{CryptoError, KeepsakeError};
pub use types::{BlobHandle, CapsuleId, FileId, KeyMaterial, UserId};
