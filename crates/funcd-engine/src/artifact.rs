// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment artifact storage.
//!
//! Every deployment stores what it was built from: the tar build context, or a small JSON
//! manifest naming the pulled image. Keys are relative slash-separated paths.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Artifact store errors.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The key is empty, absolute or escapes the store root.
    #[error("Invalid artifact key: {0:?}")]
    InvalidKey(String),

    /// No artifact under this key.
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blob storage for deployment artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous content. Returns the key.
    async fn put(&self, key: &str, bytes: Bytes) -> Result<String, ArtifactError>;

    /// Read the artifact under `key`.
    async fn get(&self, key: &str) -> Result<Bytes, ArtifactError>;

    /// Whether an artifact exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool, ArtifactError>;
}

/// Filesystem artifact store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        if key.is_empty() {
            return Err(ArtifactError::InvalidKey(key.to_string()));
        }
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ArtifactError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<String, ArtifactError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial artifact.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(key, size_bytes = bytes.len(), "Stored artifact");
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ArtifactError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ArtifactError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Artifact key for a deployment: `functions/{function_id}/v{version}-{sha12}.{ext}`.
pub fn artifact_key(function_id: &str, version: i64, bytes: &[u8], ext: &str) -> String {
    let checksum = sha256_hex(bytes);
    format!(
        "functions/{}/v{}-{}.{}",
        function_id,
        version,
        &checksum[..12],
        ext
    )
}
