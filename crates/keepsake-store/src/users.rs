use chrono::{DateTime, Utc};
use keepsake_shared::UserId;
use rusqlite::{params, OptionalExtension};

use crate::columns::{parse_ts, ts};
use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{ProfileUpdate, UserProfile};

impl Database {
    /// Make sure a row exists for `id`.  Returns `true` if it was created.
    pub fn ensure_user(&self, id: &UserId, now: DateTime<Utc>) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
            params![id.as_str(), ts(&now)],
        )?;
        Ok(inserted > 0)
    }

    /// Insert or refresh a user's profile.  Fields left `None` keep their
    /// stored value.  Returns whether the user already existed.
    pub fn sync_user(
        &self,
        id: &UserId,
        profile: &ProfileUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let existed = self
            .conn()
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![id.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        self.conn().execute(
            "INSERT INTO users (id, display_name, email, image, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, users.display_name),
                email        = COALESCE(excluded.email, users.email),
                image        = COALESCE(excluded.image, users.image)",
            params![
                id.as_str(),
                profile.display_name,
                profile.email,
                profile.image,
                ts(&now),
            ],
        )?;

        Ok(existed)
    }

    pub fn get_user(&self, id: &UserId) -> Result<UserProfile> {
        self.conn()
            .query_row(
                "SELECT id, display_name, email, image, created_at FROM users WHERE id = ?1",
                params![id.as_str()],
                row_to_user,
            )
            .map_err(not_found)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    let created: String = row.get(4)?;
    Ok(UserProfile {
        id: UserId::new(row.get::<_, String>(0)?),
        display_name: row.get(1)?,
        email: row.get(2)?,
        image: row.get(3)?,
        created_at: parse_ts(4, &created)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("users.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn ensure_user_is_idempotent() {
        let (_dir, db) = open();
        let id = UserId::new("user_1");
        assert!(db.ensure_user(&id, Utc::now()).unwrap());
        assert!(!db.ensure_user(&id, Utc::now()).unwrap());
        assert_eq!(db.get_user(&id).unwrap().display_name, None);
    }

    #[test]
    fn sync_keeps_existing_fields() {
        let (_dir, db) = open();
        let id = UserId::new("user_1");

        let existed = db
            .sync_user(
                &id,
                &ProfileUpdate {
                    display_name: Some("Ada".into()),
                    email: Some("ada@example.com".into()),
                    image: None,
                },
                Utc::now(),
            )
            .unwrap();
        assert!(!existed);

        let existed = db
            .sync_user(
                &id,
                &ProfileUpdate {
                    display_name: None,
                    email: None,
                    image: Some("https://img/ada.png".into()),
                },
                Utc::now(),
            )
            .unwrap();
        assert!(existed);

        let profile = db.get_user(&id).unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("Ada"));
        assert_eq!(profile.email.as_deref(), Some("ada@example.com"));
        assert_eq!(profile.image.as_deref(), Some("https://img/ada.png"));
    }

    #[test]
    fn missing_user() {
        let (_dir, db) = open();
        assert!(matches!(
            db.get_user(&UserId::new("ghost")),
            Err(StoreError::NotFound)
        ));
    }
}
