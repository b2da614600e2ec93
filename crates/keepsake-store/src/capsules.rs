//! Capsule persistence.
//!
//! Runtime state (`is_unlocked`, `is_accessed`, `access_count`,
//! `unlocked_at`, `last_accessed_at`) is only ever changed through
//! [`Database::commit_open`] and [`Database::mark_due_unlocked`], both of
//! which are conditional updates.

use chrono::{DateTime, Utc};
use keepsake_shared::{
    AccessPolicy, AccessState, Capsule, CapsuleId, FileId, GeoFence, KeyMaterial, UserId,
};
use rusqlite::{params, OptionalExtension};

use crate::columns::{parse_opt_ts, parse_ts, parse_uuid, to_u32, ts};
use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::models::OwnerStats;

const CAPSULE_COLUMNS: &str = "c.id, c.owner_id, c.title, c.content, c.file_id, c.encryption_key,
    c.unlock_date, c.loc_latitude, c.loc_longitude, c.loc_radius_m, c.loc_place_name,
    c.is_one_time_access, c.max_access, c.is_public, c.is_unlocked, c.is_accessed,
    c.access_count, c.unlocked_at, c.last_accessed_at, c.created_at";

impl Database {
    /// Persist a freshly created capsule.
    ///
    /// The owner row is provisioned on the fly.  When the capsule references
    /// a file, that file is attached in the same transaction and must belong
    /// to the owner, otherwise nothing is written and `NotFound` is returned.
    pub fn insert_capsule(&self, capsule: &Capsule) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
            params![capsule.owner_id.as_str(), ts(&capsule.created_at)],
        )?;

        let fence = capsule.location.as_ref();
        tx.execute(
            "INSERT INTO capsules (
                id, owner_id, title, content, file_id, encryption_key, unlock_date,
                loc_latitude, loc_longitude, loc_radius_m, loc_place_name,
                is_one_time_access, max_access, is_public,
                is_unlocked, is_accessed, access_count, unlocked_at, last_accessed_at,
                created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                       ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                capsule.id.to_string(),
                capsule.owner_id.as_str(),
                capsule.title,
                capsule.content,
                capsule.file_id.map(|f| f.to_string()),
                capsule.encryption_key.expose(),
                ts(&capsule.unlock_date),
                fence.map(|f| f.latitude),
                fence.map(|f| f.longitude),
                fence.map(|f| f.radius_meters),
                fence.and_then(|f| f.place_name.clone()),
                capsule.policy.is_one_time_access,
                capsule.policy.max_access,
                capsule.is_public,
                capsule.state.is_unlocked,
                capsule.state.is_accessed,
                capsule.state.access_count,
                capsule.state.unlocked_at.as_ref().map(ts),
                capsule.state.last_accessed_at.as_ref().map(ts),
                ts(&capsule.created_at),
            ],
        )?;

        if let Some(file_id) = capsule.file_id {
            let attached = tx.execute(
                "UPDATE files SET capsule_id = ?1 WHERE id = ?2 AND uploaded_by = ?3",
                params![
                    capsule.id.to_string(),
                    file_id.to_string(),
                    capsule.owner_id.as_str()
                ],
            )?;
            if attached == 0 {
                return Err(StoreError::NotFound);
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_capsule(&self, id: CapsuleId) -> Result<Capsule> {
        self.conn()
            .query_row(
                &format!("SELECT {CAPSULE_COLUMNS} FROM capsules c WHERE c.id = ?1"),
                params![id.to_string()],
                row_to_capsule,
            )
            .map_err(not_found)
    }

    /// Newest first.
    pub fn list_capsules_for_owner(&self, owner: &UserId) -> Result<Vec<Capsule>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CAPSULE_COLUMNS} FROM capsules c
             WHERE c.owner_id = ?1 ORDER BY c.created_at DESC"
        ))?;
        let rows = stmt.query_map(params![owner.as_str()], row_to_capsule)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn count_capsules_for_owner(&self, owner: &UserId) -> Result<u64> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM capsules WHERE owner_id = ?1",
            params![owner.as_str()],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    /// Record one successful open, but only if the row still holds the
    /// `observed` counters.
    ///
    /// Sets `is_unlocked` and `is_accessed`, increments `access_count` by
    /// one, keeps an existing `unlocked_at` and overwrites
    /// `last_accessed_at`.  Returns [`StoreError::Conflict`] when another
    /// writer got there first and [`StoreError::NotFound`] when the capsule
    /// is gone.
    pub fn commit_open(
        &self,
        id: CapsuleId,
        observed: &AccessState,
        now: DateTime<Utc>,
    ) -> Result<AccessState> {
        let now_str = ts(&now);
        let stored_unlocked_at: Option<Option<String>> = self
            .conn()
            .query_row(
                "UPDATE capsules SET
                    is_unlocked      = 1,
                    is_accessed      = 1,
                    access_count     = access_count + 1,
                    unlocked_at      = COALESCE(unlocked_at, ?1),
                    last_accessed_at = ?1
                 WHERE id = ?2 AND access_count = ?3 AND is_accessed = ?4
                 RETURNING unlocked_at",
                params![
                    now_str,
                    id.to_string(),
                    observed.access_count,
                    observed.is_accessed
                ],
                |row| row.get(0),
            )
            .optional()?;

        match stored_unlocked_at {
            Some(unlocked_at) => Ok(AccessState {
                is_unlocked: true,
                is_accessed: true,
                access_count: observed.access_count.saturating_add(1),
                unlocked_at: parse_opt_ts(0, unlocked_at)?,
                last_accessed_at: Some(now),
            }),
            None if self.capsule_exists(id)? => {
                tracing::debug!(capsule = %id, "open lost a concurrent update");
                Err(StoreError::Conflict)
            }
            None => Err(StoreError::NotFound),
        }
    }

    /// Flip `is_unlocked` on every capsule whose date has passed.  Only rows
    /// still locked are touched; access counters and `unlocked_at` are left
    /// alone.  Returns the ids that changed.
    pub fn mark_due_unlocked(&self, now: DateTime<Utc>) -> Result<Vec<CapsuleId>> {
        let mut stmt = self.conn().prepare(
            "UPDATE capsules SET is_unlocked = 1
             WHERE is_unlocked = 0 AND unlock_date <= ?1
             RETURNING id",
        )?;
        let rows = stmt.query_map(params![ts(&now)], |row| {
            let raw: String = row.get(0)?;
            parse_uuid(0, &raw).map(CapsuleId)
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Public capsules that are unlocked (by flag or by date) but have no
    /// wall entry yet.
    pub fn publishable_without_wall_entry(&self, now: DateTime<Utc>) -> Result<Vec<Capsule>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CAPSULE_COLUMNS} FROM capsules c
             WHERE c.is_public = 1
               AND (c.is_unlocked = 1 OR c.unlock_date <= ?1)
               AND NOT EXISTS (SELECT 1 FROM public_wall w WHERE w.capsule_id = c.id)
             ORDER BY c.unlock_date ASC"
        ))?;
        let rows = stmt.query_map(params![ts(&now)], row_to_capsule)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn owner_stats(&self, owner: &UserId) -> Result<OwnerStats> {
        self.conn()
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(c.is_unlocked), 0),
                    COALESCE(SUM(c.access_count), 0),
                    COALESCE(SUM((SELECT w.likes FROM public_wall w WHERE w.capsule_id = c.id)), 0)
                 FROM capsules c WHERE c.owner_id = ?1",
                params![owner.as_str()],
                |row| {
                    let get = |i: usize| row.get::<_, i64>(i).map(|v| v.max(0) as u64);
                    Ok(OwnerStats {
                        total_capsules: get(0)?,
                        unlocked_capsules: get(1)?,
                        total_views: get(2)?,
                        total_likes: get(3)?,
                    })
                },
            )
            .map_err(StoreError::Sqlite)
    }

    fn capsule_exists(&self, id: CapsuleId) -> Result<bool> {
        Ok(self
            .conn()
            .query_row(
                "SELECT 1 FROM capsules WHERE id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }
}

pub(crate) fn row_to_capsule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Capsule> {
    let id: String = row.get(0)?;
    let file_id: Option<String> = row.get(4)?;
    let unlock_date: String = row.get(6)?;
    let created_at: String = row.get(19)?;

    let lat: Option<f64> = row.get(7)?;
    let lon: Option<f64> = row.get(8)?;
    let radius: Option<f64> = row.get(9)?;
    let location = match (lat, lon, radius) {
        (Some(latitude), Some(longitude), Some(radius_meters)) => Some(GeoFence {
            latitude,
            longitude,
            radius_meters,
            place_name: row.get(10)?,
        }),
        _ => None,
    };

    let max_access: Option<i64> = row.get(12)?;

    Ok(Capsule {
        id: CapsuleId(parse_uuid(0, &id)?),
        owner_id: UserId::new(row.get::<_, String>(1)?),
        title: row.get(2)?,
        content: row.get(3)?,
        file_id: file_id
            .map(|f| parse_uuid(4, &f).map(FileId))
            .transpose()?,
        encryption_key: KeyMaterial::new(row.get::<_, String>(5)?),
        unlock_date: parse_ts(6, &unlock_date)?,
        location,
        policy: AccessPolicy {
            is_one_time_access: row.get(11)?,
            max_access: max_access.map(|m| to_u32(12, m)).transpose()?,
        },
        is_public: row.get(13)?,
        state: AccessState {
            is_unlocked: row.get(14)?,
            is_accessed: row.get(15)?,
            access_count: to_u32(16, row.get(16)?)?,
            unlocked_at: parse_opt_ts(17, row.get(17)?)?,
            last_accessed_at: parse_opt_ts(18, row.get(18)?)?,
        },
        created_at: parse_ts(19, &created_at)?,
    })
}
