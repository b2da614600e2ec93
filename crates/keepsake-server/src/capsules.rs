//! Capsule read, open and publication flows on top of the store.
//!
//! SQLite work runs on the blocking pool through [`CapsuleService::with_db`];
//! the database lock is never held on an async worker.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use keepsake_shared::access::{check_access_policy, evaluate};
use keepsake_shared::{
    crypto, Capsule, CapsuleId, CryptoError, FileId, KeyMaterial, LockReason, LockVerdict,
    NewCapsule, ReaderContext, UserId,
};
use keepsake_store::{Database, StoreError, StoredFile};

use crate::blob_store::BlobStore;
use crate::error::ServerError;

/// Attempts at the conditional open before giving up with `Conflict`.
const MAX_OPEN_ATTEMPTS: usize = 3;

/// The decrypted attachment of an opened capsule.
#[derive(Debug, Clone)]
pub struct RevealedFile {
    pub file: StoredFile,
    pub plaintext: Vec<u8>,
}

/// A committed open: the capsule with its post-open state and its
/// attachment, already decrypted.
#[derive(Debug, Clone)]
pub struct OpenedCapsule {
    pub capsule: Capsule,
    pub file: Option<RevealedFile>,
}

#[derive(Debug, Clone)]
pub enum OpenOutcome {
    Opened(OpenedCapsule),
    Locked(LockReason),
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub unlocked: usize,
    pub published: usize,
}

#[derive(Clone)]
pub struct CapsuleService {
    db: Arc<Mutex<Database>>,
    blobs: Arc<BlobStore>,
}

impl CapsuleService {
    pub fn new(db: Arc<Mutex<Database>>, blobs: Arc<BlobStore>) -> Self {
        Self { db, blobs }
    }

    /// Run `f` against the database on the blocking pool.  Store calls can
    /// sit in the busy timeout, so they stay off the async workers.
    pub async fn with_db<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Database) -> Result<T, ServerError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let db = db
                .lock()
                .map_err(|_| ServerError::Internal("Database lock poisoned".into()))?;
            f(&db)
        })
        .await?
    }

    pub async fn create(
        &self,
        owner: UserId,
        new: NewCapsule,
        key: KeyMaterial,
        now: DateTime<Utc>,
    ) -> Result<Capsule, ServerError> {
        let capsule = Capsule::create(new, owner, key, now)?;
        let capsule = self
            .with_db(move |db| {
                db.insert_capsule(&capsule)?;
                Ok(capsule)
            })
            .await?;
        info!(capsule = %capsule.id, owner = %capsule.owner_id, "Capsule created");
        Ok(capsule)
    }

    pub async fn get(&self, id: CapsuleId) -> Result<Capsule, ServerError> {
        self.with_db(move |db| Ok(db.get_capsule(id)?)).await
    }

    /// Read-only verdict for a reader.  Also publishes the capsule to the
    /// wall when it is public and unlocked.
    pub async fn evaluate(
        &self,
        id: CapsuleId,
        reader: &ReaderContext,
    ) -> Result<(Capsule, LockVerdict), ServerError> {
        let capsule = self.get(id).await?;
        let verdict = evaluate(&capsule, reader);
        if let LockVerdict::Locked(reason) = verdict {
            debug!(capsule = %id, reason = %reason, "Capsule locked");
        }
        self.reconcile(&capsule, verdict, reader.now).await?;
        Ok((capsule, verdict))
    }

    /// Evaluate and commit in one step.  Losing a race re-reads the capsule
    /// and re-evaluates, so a one-time capsule can never be opened twice.
    pub async fn evaluate_and_open(
        &self,
        id: CapsuleId,
        reader: &ReaderContext,
    ) -> Result<OpenOutcome, ServerError> {
        let gate = |capsule: &Capsule| match evaluate(capsule, reader) {
            LockVerdict::Unlocked => Ok(()),
            LockVerdict::Locked(reason) => Err(reason),
        };
        self.open_gated(id, reader.now, gate).await
    }

    /// Second half of the two-step flow: the caller has already obtained an
    /// `Unlocked` verdict.  Time and location are not re-checked, but the
    /// one-time and quota limits are, against the row being committed.
    #[allow(dead_code)]
    pub async fn open(&self, id: CapsuleId, now: DateTime<Utc>) -> Result<OpenOutcome, ServerError> {
        self.open_gated(id, now, check_access_policy).await
    }

    /// The attachment is fetched and decrypted before the conditional
    /// update, so any failure on the way leaves the capsule state as it was.
    async fn open_gated<G>(
        &self,
        id: CapsuleId,
        now: DateTime<Utc>,
        gate: G,
    ) -> Result<OpenOutcome, ServerError>
    where
        G: Fn(&Capsule) -> Result<(), LockReason> + Send + Sync,
    {
        let mut revealed: Option<RevealedFile> = None;

        for attempt in 1..=MAX_OPEN_ATTEMPTS {
            let capsule = self.get(id).await?;
            if let Err(reason) = gate(&capsule) {
                debug!(capsule = %id, reason = %reason, "Open refused");
                return Ok(OpenOutcome::Locked(reason));
            }

            revealed = match (capsule.file_id, revealed.take()) {
                (Some(file_id), Some(done)) if done.file.id == file_id => Some(done),
                (Some(file_id), _) => Some(self.reveal_file(id, file_id).await?),
                (None, _) => None,
            };

            match self.commit(capsule, now).await? {
                Some(capsule) => {
                    return Ok(OpenOutcome::Opened(OpenedCapsule {
                        capsule,
                        file: revealed,
                    }))
                }
                None => debug!(capsule = %id, attempt, "Open raced, re-evaluating"),
            }
        }

        warn!(capsule = %id, "Open gave up after repeated conflicts");
        Err(ServerError::Conflict("Capsule is busy, try again".into()))
    }

    /// Load the attached file's record and blob and decrypt it.  A missing
    /// record or blob is an infrastructure error, never a silent omission.
    async fn reveal_file(
        &self,
        capsule_id: CapsuleId,
        file_id: FileId,
    ) -> Result<RevealedFile, ServerError> {
        let file = self
            .with_db(move |db| match db.get_file(file_id) {
                Ok(file) => Ok(file),
                Err(StoreError::NotFound) => {
                    error!(capsule = %capsule_id, file = %file_id, "Attached file record is missing");
                    Err(ServerError::Internal(format!("Attached file {file_id} is missing")))
                }
                Err(e) => Err(e.into()),
            })
            .await?;

        let raw = self.blobs.get(&file.storage_handle).await.map_err(|e| {
            error!(capsule = %capsule_id, file = %file_id, error = %e, "Attached blob is unreadable");
            ServerError::BlobStorage(format!("Blob for file {file_id} is unreadable"))
        })?;

        let key = file.encryption_key.clone();
        let plaintext = tokio::task::spawn_blocking(move || {
            let blob = String::from_utf8(raw)
                .map_err(|_| CryptoError::MalformedCiphertext("blob is not hex text".into()))?;
            crypto::decrypt(&blob, key.expose())
        })
        .await?
        .map_err(|e| {
            error!(
                capsule = %capsule_id,
                file = %file_id,
                error = %e,
                "Stored payload failed to decrypt"
            );
            ServerError::from(e)
        })?;

        Ok(RevealedFile { file, plaintext })
    }

    /// `None` when the conditional update lost a race.
    async fn commit(
        &self,
        mut capsule: Capsule,
        now: DateTime<Utc>,
    ) -> Result<Option<Capsule>, ServerError> {
        self.with_db(move |db| {
            capsule.state = match db.commit_open(capsule.id, &capsule.state, now) {
                Ok(state) => state,
                Err(StoreError::Conflict) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            info!(
                capsule = %capsule.id,
                access_count = capsule.state.access_count,
                "Capsule opened"
            );

            // The open is already committed; the sweep retries publication.
            if capsule.is_public {
                match db.publish_to_wall(&capsule, now) {
                    Ok(true) => info!(capsule = %capsule.id, "Published to public wall"),
                    Ok(false) => {}
                    Err(e) => warn!(capsule = %capsule.id, error = %e, "Wall publication failed"),
                }
            }

            Ok(Some(capsule))
        })
        .await
    }

    /// Make sure a public, unlocked capsule has its wall entry.  Unlocked
    /// means either the persisted flag or the current verdict.
    pub async fn reconcile(
        &self,
        capsule: &Capsule,
        verdict: LockVerdict,
        now: DateTime<Utc>,
    ) -> Result<bool, ServerError> {
        if !capsule.is_public || !(capsule.state.is_unlocked || verdict.is_unlocked()) {
            return Ok(false);
        }
        let id = capsule.id;
        let snapshot = capsule.clone();
        let created = self
            .with_db(move |db| Ok(db.publish_to_wall(&snapshot, now)?))
            .await?;
        if created {
            info!(capsule = %id, "Published to public wall");
        }
        Ok(created)
    }

    /// Flip every due capsule to unlocked and publish the public ones.
    pub async fn run_unlock_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ServerError> {
        let report = self
            .with_db(move |db| {
                let unlocked = db.mark_due_unlocked(now)?;

                let mut published = 0;
                for capsule in db.publishable_without_wall_entry(now)? {
                    if capsule.is_publishable(now) && db.publish_to_wall(&capsule, now)? {
                        published += 1;
                    }
                }

                Ok(SweepReport {
                    unlocked: unlocked.len(),
                    published,
                })
            })
            .await?;

        if report != SweepReport::default() {
            info!(unlocked = report.unlocked, published = report.published, "Unlock sweep");
        }
        Ok(report)
    }
}
