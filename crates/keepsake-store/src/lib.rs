//! # keepsake-store
//!
//! SQLite persistence for Keepsake capsules.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for users, capsules,
//! stored files and the public wall.  Every state change the access rules
//! depend on is written as a conditional update, so concurrent callers can
//! never both win a one-time open or publish the same capsule twice.

pub mod capsules;
pub mod database;
pub mod files;
pub mod migrations;
pub mod models;
pub mod public_wall;
pub mod users;

mod columns;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
