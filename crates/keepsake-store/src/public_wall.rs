//! The public wall: at most one entry per capsule, guaranteed by the
//! `UNIQUE(capsule_id)` constraint rather than a read-then-insert check.

use chrono::{DateTime, Utc};
use keepsake_shared::constants::EMPTY_WALL_CONTENT;
use keepsake_shared::{Capsule, CapsuleId, UserId};
use rusqlite::params;
use uuid::Uuid;

use crate::columns::{parse_ts, parse_uuid, to_u32, ts};
use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::models::{WallEntry, WallListing, WallSort};

const LISTING_SELECT: &str = "SELECT w.id, w.capsule_id, w.user_id, w.content, w.unlocked_at,
        w.likes, w.is_moderated, c.title, u.display_name, c.access_count
    FROM public_wall w
    JOIN capsules c ON c.id = w.capsule_id
    LEFT JOIN users u ON u.id = w.user_id";

impl Database {
    /// Insert a wall entry for `capsule` unless one already exists.
    ///
    /// Content is snapshotted now; later edits to the capsule do not reach
    /// the wall.  Returns `true` if this call created the entry.
    pub fn publish_to_wall(&self, capsule: &Capsule, now: DateTime<Utc>) -> Result<bool> {
        let content = capsule
            .content
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(EMPTY_WALL_CONTENT);

        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO public_wall
                (id, capsule_id, user_id, content, unlocked_at, likes, is_moderated)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 1)",
            params![
                Uuid::new_v4().to_string(),
                capsule.id.to_string(),
                capsule.owner_id.as_str(),
                content,
                ts(&now),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// A single entry, visible only while its capsule is public and
    /// unlocked.
    pub fn get_wall_listing(&self, capsule_id: CapsuleId, now: DateTime<Utc>) -> Result<WallListing> {
        self.conn()
            .query_row(
                &format!(
                    "{LISTING_SELECT}
                     WHERE w.capsule_id = ?1 AND c.is_public = 1
                       AND (c.is_unlocked = 1 OR c.unlock_date <= ?2)"
                ),
                params![capsule_id.to_string(), ts(&now)],
                row_to_listing,
            )
            .map_err(not_found)
    }

    /// Atomically add one like.  Returns the new total.
    pub fn like_wall_entry(&self, capsule_id: CapsuleId) -> Result<i64> {
        self.conn()
            .query_row(
                "UPDATE public_wall SET likes = likes + 1 WHERE capsule_id = ?1 RETURNING likes",
                params![capsule_id.to_string()],
                |row| row.get(0),
            )
            .map_err(not_found)
    }

    /// Feed of public capsules.  `search` matches the capsule title or the
    /// wall content, case-insensitively.
    pub fn list_wall(
        &self,
        sort: WallSort,
        search: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WallListing>> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern);

        let mut stmt = self.conn().prepare(&format!(
            "{LISTING_SELECT}
             WHERE c.is_public = 1
               AND (?1 IS NULL OR c.title LIKE ?1 ESCAPE '\\' OR w.content LIKE ?1 ESCAPE '\\')
             ORDER BY {}
             LIMIT ?2",
            sort.order_by()
        ))?;
        let rows = stmt.query_map(params![pattern, limit], row_to_listing)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Moderated entries with at least `min_likes`, most liked first.
    pub fn featured_wall(&self, min_likes: i64, limit: u32) -> Result<Vec<WallListing>> {
        let mut stmt = self.conn().prepare(&format!(
            "{LISTING_SELECT}
             WHERE c.is_public = 1 AND w.is_moderated = 1 AND w.likes >= ?1
             ORDER BY w.likes DESC, w.unlocked_at DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![min_likes, limit], row_to_listing)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<WallEntry> {
    let id: String = row.get(0)?;
    let capsule_id: String = row.get(1)?;
    let unlocked_at: String = row.get(4)?;

    Ok(WallEntry {
        id: parse_uuid(0, &id)?,
        capsule_id: CapsuleId(parse_uuid(1, &capsule_id)?),
        user_id: UserId::new(row.get::<_, String>(2)?),
        content: row.get(3)?,
        unlocked_at: parse_ts(4, &unlocked_at)?,
        likes: row.get(5)?,
        is_moderated: row.get(6)?,
    })
}

fn row_to_listing(row: &rusqlite::Row<'_>) -> rusqlite::Result<WallListing> {
    Ok(WallListing {
        entry: row_to_entry(row)?,
        title: row.get(7)?,
        author_name: row.get(8)?,
        access_count: to_u32(9, row.get(9)?)?,
    })
}
