//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `users`, `capsules`, `files` and
//! `public_wall`.  The CHECK constraints on `capsules` back the access
//! invariants at the storage level; the UNIQUE constraint on
//! `public_wall.capsule_id` makes wall publication idempotent.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (mirrors of external auth subjects)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- auth provider subject
    display_name TEXT,
    email        TEXT,
    image        TEXT,
    created_at   TEXT NOT NULL                -- RFC-3339, UTC, micros
);

-- ----------------------------------------------------------------
-- Capsules
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS capsules (
    id                 TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    owner_id           TEXT NOT NULL,              -- FK -> users(id)
    title              TEXT NOT NULL,
    content            TEXT,
    file_id            TEXT,                       -- UUID of files(id)
    encryption_key     TEXT NOT NULL,
    unlock_date        TEXT NOT NULL,
    loc_latitude       REAL,
    loc_longitude      REAL,
    loc_radius_m       REAL,
    loc_place_name     TEXT,
    is_one_time_access INTEGER NOT NULL DEFAULT 0,
    max_access         INTEGER,
    is_public          INTEGER NOT NULL DEFAULT 0,
    is_unlocked        INTEGER NOT NULL DEFAULT 0,
    is_accessed        INTEGER NOT NULL DEFAULT 0,
    access_count       INTEGER NOT NULL DEFAULT 0,
    unlocked_at        TEXT,
    last_accessed_at   TEXT,
    created_at         TEXT NOT NULL,

    CHECK (access_count >= 0),
    CHECK (max_access IS NULL OR access_count <= max_access),
    CHECK (is_one_time_access = 0 OR access_count <= 1),

    FOREIGN KEY (owner_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_capsules_owner ON capsules(owner_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_capsules_unlock_date ON capsules(unlock_date);
CREATE INDEX IF NOT EXISTS idx_capsules_public ON capsules(is_public, is_unlocked);

-- ----------------------------------------------------------------
-- Files (metadata; ciphertext lives in the blob store)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    id             TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    storage_handle TEXT NOT NULL UNIQUE,       -- opaque blob store handle
    file_name      TEXT NOT NULL,
    mime_type      TEXT NOT NULL,
    file_size      INTEGER NOT NULL,
    encryption_key TEXT NOT NULL,
    uploaded_by    TEXT NOT NULL,              -- FK -> users(id)
    capsule_id     TEXT,                       -- nullable FK -> capsules(id)
    created_at     TEXT NOT NULL,

    FOREIGN KEY (uploaded_by) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (capsule_id) REFERENCES capsules(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_files_capsule ON files(capsule_id);

-- ----------------------------------------------------------------
-- Public wall (at most one entry per capsule)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS public_wall (
    id           TEXT PRIMARY KEY NOT NULL,    -- UUID v4
    capsule_id   TEXT NOT NULL UNIQUE,         -- FK -> capsules(id)
    user_id      TEXT NOT NULL,
    content      TEXT NOT NULL,                -- snapshot at publication
    unlocked_at  TEXT NOT NULL,
    likes        INTEGER NOT NULL DEFAULT 0 CHECK (likes >= 0),
    is_moderated INTEGER NOT NULL DEFAULT 1,

    FOREIGN KEY (capsule_id) REFERENCES capsules(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_public_wall_unlocked ON public_wall(unlocked_at DESC);
CREATE INDEX IF NOT EXISTS idx_public_wall_likes ON public_wall(likes DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
