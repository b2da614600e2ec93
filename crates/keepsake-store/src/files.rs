use keepsake_shared::{BlobHandle, CapsuleId, FileId, KeyMaterial, UserId};
use rusqlite::params;

use crate::columns::{parse_ts, parse_uuid, ts};
use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::models::StoredFile;

const FILE_COLUMNS: &str = "id, storage_handle, file_name, mime_type, file_size, encryption_key,
    uploaded_by, capsule_id, created_at";

impl Database {
    /// Record metadata for a blob that has already been stored.  When
    /// `capsule_id` is set, the capsule must belong to the uploader.
    pub fn insert_file(&self, file: &StoredFile) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
            params![file.uploaded_by.as_str(), ts(&file.created_at)],
        )?;

        if let Some(capsule_id) = file.capsule_id {
            let owned: i64 = tx.query_row(
                "SELECT COUNT(*) FROM capsules WHERE id = ?1 AND owner_id = ?2",
                params![capsule_id.to_string(), file.uploaded_by.as_str()],
                |row| row.get(0),
            )?;
            if owned == 0 {
                return Err(StoreError::NotFound);
            }
        }

        tx.execute(
            "INSERT INTO files (id, storage_handle, file_name, mime_type, file_size,
                                encryption_key, uploaded_by, capsule_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                file.id.to_string(),
                file.storage_handle.0,
                file.file_name,
                file.mime_type,
                file.file_size as i64,
                file.encryption_key.expose(),
                file.uploaded_by.as_str(),
                file.capsule_id.map(|c| c.to_string()),
                ts(&file.created_at),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_file(&self, id: FileId) -> Result<StoredFile> {
        self.conn()
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![id.to_string()],
                row_to_file,
            )
            .map_err(not_found)
    }

    pub fn list_files_for_capsule(&self, capsule_id: CapsuleId) -> Result<Vec<StoredFile>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE capsule_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![capsule_id.to_string()], row_to_file)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Attach a standalone file to a capsule.  Both must belong to `owner`.
    /// A capsule without a primary file adopts this one.
    pub fn attach_file(&self, file_id: FileId, capsule_id: CapsuleId, owner: &UserId) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        let attached = tx.execute(
            "UPDATE files SET capsule_id = ?1
             WHERE id = ?2 AND uploaded_by = ?3
               AND EXISTS (SELECT 1 FROM capsules WHERE id = ?1 AND owner_id = ?3)",
            params![capsule_id.to_string(), file_id.to_string(), owner.as_str()],
        )?;
        if attached == 0 {
            return Err(StoreError::NotFound);
        }

        tx.execute(
            "UPDATE capsules SET file_id = COALESCE(file_id, ?1) WHERE id = ?2",
            params![file_id.to_string(), capsule_id.to_string()],
        )?;

        tx.commit()?;
        Ok(())
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredFile> {
    let id: String = row.get(0)?;
    let size: i64 = row.get(4)?;
    let capsule_id: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok(StoredFile {
        id: FileId(parse_uuid(0, &id)?),
        storage_handle: BlobHandle(row.get(1)?),
        file_name: row.get(2)?,
        mime_type: row.get(3)?,
        file_size: u64::try_from(size)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(4, size))?,
        encryption_key: KeyMaterial::new(row.get::<_, String>(5)?),
        uploaded_by: UserId::new(row.get::<_, String>(6)?),
        capsule_id: capsule_id
            .map(|c| parse_uuid(7, &c).map(CapsuleId))
            .transpose()?,
        created_at: parse_ts(8, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, SubsecRound, Utc};
    use keepsake_shared::{AccessPolicy, Capsule, NewCapsule};

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("files.db")).unwrap();
        (dir, db)
    }

    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    fn stored_file(owner: &str, capsule_id: Option<CapsuleId>) -> StoredFile {
        StoredFile {
            id: FileId::new(),
            storage_handle: BlobHandle(uuid::Uuid::new_v4().to_string()),
            file_name: "letter.pdf".into(),
            mime_type: "application/pdf".into(),
            file_size: 2048,
            encryption_key: KeyMaterial::new("master"),
            uploaded_by: UserId::new(owner),
            capsule_id,
            created_at: now(),
        }
    }

    fn capsule_for(db: &Database, owner: &str) -> Capsule {
        let c = Capsule::create(
            NewCapsule {
                title: "t".into(),
                content: None,
                file_id: None,
                unlock_date: now() + Duration::days(1),
                location: None,
                policy: AccessPolicy::default(),
                is_public: false,
            },
            UserId::new(owner),
            KeyMaterial::new("master"),
            now(),
        )
        .unwrap();
        db.insert_capsule(&c).unwrap();
        c
    }

    #[test]
    fn insert_and_get() {
        let (_dir, db) = open();
        let file = stored_file("alice", None);
        db.insert_file(&file).unwrap();
        assert_eq!(db.get_file(file.id).unwrap(), file);
    }

    #[test]
    fn duplicate_storage_handle_rejected() {
        let (_dir, db) = open();
        let file = stored_file("alice", None);
        db.insert_file(&file).unwrap();

        let mut dup = stored_file("alice", None);
        dup.storage_handle = file.storage_handle.clone();
        assert!(db.insert_file(&dup).is_err());
    }

    #[test]
    fn upload_into_foreign_capsule_rejected() {
        let (_dir, db) = open();
        let capsule = capsule_for(&db, "alice");
        let file = stored_file("mallory", Some(capsule.id));
        assert!(matches!(db.insert_file(&file), Err(StoreError::NotFound)));
        assert!(matches!(db.get_file(file.id), Err(StoreError::NotFound)));
    }

    #[test]
    fn attach_sets_primary_file_once() {
        let (_dir, db) = open();
        let capsule = capsule_for(&db, "alice");
        let first = stored_file("alice", None);
        let second = stored_file("alice", None);
        db.insert_file(&first).unwrap();
        db.insert_file(&second).unwrap();

        let owner = UserId::new("alice");
        db.attach_file(first.id, capsule.id, &owner).unwrap();
        db.attach_file(second.id, capsule.id, &owner).unwrap();

        assert_eq!(db.get_capsule(capsule.id).unwrap().file_id, Some(first.id));
        assert_eq!(db.list_files_for_capsule(capsule.id).unwrap().len(), 2);
    }

    #[test]
    fn attach_requires_ownership() {
        let (_dir, db) = open();
        let capsule = capsule_for(&db, "alice");
        let file = stored_file("bob", None);
        db.insert_file(&file).unwrap();

        assert!(matches!(
            db.attach_file(file.id, capsule.id, &UserId::new("bob")),
            Err(StoreError::NotFound)
        ));
        assert_eq!(db.get_file(file.id).unwrap().capsule_id, None);
    }
}
