//! Intermediate artifact storage: one JSON file per domain, overwritten wholesale.

use std::path::{Path, PathBuf};

use cmr_core::{Domain, Record};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cmr-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub domain: Domain,
    pub path: PathBuf,
    pub records: usize,
    pub byte_size: usize,
    pub content_hash: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no artifact for {domain} at {}", .path.display())]
    MissingArtifact { domain: Domain, path: PathBuf },
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact {} is not a JSON array of records: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing {domain} records: {source}")]
    Encode {
        domain: Domain,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_missing(&self) -> bool {
        matches!(self, StoreError::MissingArtifact { .. })
    }

    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Deterministic artifact location for a domain.
    pub fn artifact_path(&self, domain: Domain) -> PathBuf {
        self.root.join(format!("{}.json", domain.slug()))
    }

    pub async fn exists(&self, domain: Domain) -> Result<bool, StoreError> {
        let path = self.artifact_path(domain);
        fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io("checking artifact", &path, e))
    }

    /// Replace the domain's artifact with `records` via a temp file and an atomic rename.
    pub async fn write(&self, domain: Domain, records: &[Record]) -> Result<StoredArtifact, StoreError> {
        let bytes = serde_json::to_vec_pretty(records)
            .map_err(|source| StoreError::Encode { domain, source })?;
        let path = self.artifact_path(domain);

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io("creating artifact directory", &self.root, e))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", domain.slug(), Uuid::new_v4()));
        if let Err(err) = replace_via_temp(&temp_path, &path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        let stored = StoredArtifact {
            domain,
            path,
            records: records.len(),
            byte_size: bytes.len(),
            content_hash: Self::sha256_hex(&bytes),
        };
        debug!(
            domain = %domain,
            path = %stored.path.display(),
            bytes = stored.byte_size,
            sha256 = %stored.content_hash,
            "artifact written"
        );
        Ok(stored)
    }

    /// Read a domain's artifact back. Dates come back as the strings they were written as.
    pub async fn read(&self, domain: Domain) -> Result<Vec<Record>, StoreError> {
        let path = self.artifact_path(domain);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingArtifact { domain, path });
            }
            Err(err) => return Err(StoreError::io("reading artifact", &path, err)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })
    }
}

/// Write `bytes` to a fresh `temp_path`, then rename it over `path`. The caller
/// removes `temp_path` when this fails at any step.
async fn replace_via_temp(temp_path: &Path, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(|e| StoreError::io("opening temp artifact file", temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io("writing temp artifact file", temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StoreError::io("flushing temp artifact file", temp_path, e))?;
    drop(file);
    fs::rename(temp_path, path)
        .await
        .map_err(|e| StoreError::io("renaming temp artifact into", path, e))
}
