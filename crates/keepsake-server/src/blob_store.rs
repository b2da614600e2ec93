use std::path::{Path, PathBuf};

use keepsake_shared::BlobHandle;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    // Canonicalize base; target may not exist yet so normalize manually
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {} // RootDir, CurDir, Prefix
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Filesystem blob store for encrypted file payloads.
///
/// Handles are UUIDs issued here; the bytes behind them are ciphertext and
/// are served back verbatim.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
    public_base_url: String,
}

impl BlobStore {
    pub async fn new(
        base_path: PathBuf,
        max_size: usize,
        public_base_url: impl Into<String>,
    ) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::BlobStorage(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            max_size,
            public_base_url: public_base_url.into(),
        })
    }

    pub async fn put_encrypted_bytes(&self, data: &[u8]) -> Result<BlobHandle, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty blob".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::PayloadTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let handle = BlobHandle(Uuid::new_v4().to_string());
        let path = self.blob_path(&handle)?;

        fs::write(&path, data).await.map_err(|e| {
            ServerError::BlobStorage(format!("Failed to write blob {}: {}", handle, e))
        })?;

        debug!(handle = %handle, size = data.len(), "Stored blob");
        Ok(handle)
    }

    pub async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>, ServerError> {
        let path = self.blob_path(handle)?;

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServerError::NotFound(format!("Blob {handle}")));
            }
            Err(e) => {
                return Err(ServerError::BlobStorage(format!(
                    "Failed to read blob {}: {}",
                    handle, e
                )));
            }
        };

        debug!(handle = %handle, size = data.len(), "Retrieved blob");
        Ok(data)
    }

    pub async fn delete(&self, handle: &BlobHandle) -> Result<(), ServerError> {
        let path = self.blob_path(handle)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(handle = %handle, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::NotFound(format!("Blob {handle}")))
            }
            Err(e) => Err(ServerError::BlobStorage(format!(
                "Failed to delete blob {}: {}",
                handle, e
            ))),
        }
    }

    pub fn url_for(&self, handle: &BlobHandle) -> String {
        format!("{}/blobs/{}", self.public_base_url, handle)
    }

    /// Only handles this store issued (UUIDs) map to a path.
    fn blob_path(&self, handle: &BlobHandle) -> Result<PathBuf, ServerError> {
        let id = Uuid::parse_str(&handle.0)
            .map_err(|_| ServerError::BadRequest(format!("Invalid blob handle: {handle}")))?;
        ensure_within(&self.base_path, &self.base_path.join(id.to_string()))
    }
}
