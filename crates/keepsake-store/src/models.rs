//! Row types returned by the store that have no counterpart in
//! `keepsake-shared`.
//!
//! Capsules themselves are returned as [`keepsake_shared::Capsule`].

use chrono::{DateTime, Utc};
use keepsake_shared::{BlobHandle, CapsuleId, FileId, KeyMaterial, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// Local mirror of an externally authenticated user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Profile fields supplied by the auth provider on sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub image: Option<String>,
}

// ---------------------------------------------------------------------------
// Stored file
// ---------------------------------------------------------------------------

/// Metadata for an encrypted blob.  The ciphertext itself lives in the blob
/// store under `storage_handle`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub id: FileId,
    pub storage_handle: BlobHandle,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    /// Never serialized to clients.
    pub encryption_key: KeyMaterial,
    pub uploaded_by: UserId,
    pub capsule_id: Option<CapsuleId>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Public wall
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WallEntry {
    pub id: Uuid,
    pub capsule_id: CapsuleId,
    pub user_id: UserId,
    /// Snapshot of the capsule content at publication time.
    pub content: String,
    pub unlocked_at: DateTime<Utc>,
    pub likes: i64,
    pub is_moderated: bool,
}

/// A wall entry joined with the fields the feed needs from its capsule and
/// author.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WallListing {
    pub entry: WallEntry,
    pub title: String,
    pub author_name: Option<String>,
    pub access_count: u32,
}

/// Feed ordering.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WallSort {
    #[default]
    Recent,
    Popular,
    Views,
}

impl WallSort {
    pub(crate) fn order_by(&self) -> &'static str {
        match self {
            WallSort::Recent => "w.unlocked_at DESC",
            WallSort::Popular => "w.likes DESC, w.unlocked_at DESC",
            WallSort::Views => "c.access_count DESC, w.unlocked_at DESC",
        }
    }
}

impl std::str::FromStr for WallSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recent" => Ok(WallSort::Recent),
            "popular" => Ok(WallSort::Popular),
            "views" => Ok(WallSort::Views),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerStats {
    pub total_capsules: u64,
    pub unlocked_capsules: u64,
    pub total_views: u64,
    pub total_likes: u64,
}

/// Totals reported by the admin status endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreCounts {
    pub users: u64,
    pub capsules: u64,
    pub files: u64,
    pub wall_entries: u64,
}
