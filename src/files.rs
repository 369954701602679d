//! On-disk storage for message file attachments
//!
//! Attachments live as flat blobs under a single storage directory, named
//! `{file_id}_{sanitized_name}`. The store never touches the database; the
//! message row owns the path, size, and content hash.

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Configuration for attachment storage
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Directory where attachments are stored
    pub storage_dir: PathBuf,
    /// Maximum single-file size in bytes (default: 30MiB)
    pub max_file_size: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./courier_files"),
            max_file_size: 30 * 1024 * 1024,
        }
    }
}

/// Attachment store rooted at a single directory
#[derive(Debug)]
pub struct FileStore {
    config: FileConfig,
}

impl FileStore {
    pub fn new(config: FileConfig) -> Self {
        Self { config }
    }

    pub fn max_file_size(&self) -> u64 {
        self.config.max_file_size
    }

    /// Create the storage directory if it does not exist yet
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.config.storage_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create storage directory: {:?}",
                    self.config.storage_dir
                )
            })?;
        Ok(())
    }

    /// Write an attachment blob to disk
    ///
    /// Returns the storage path and the SHA-256 hash of the content.
    pub async fn store(&self, stored_name: &str, data: &[u8]) -> Result<(String, String)> {
        if data.len() as u64 > self.config.max_file_size {
            return Err(anyhow!(
                "File size exceeds maximum allowed size of {} bytes",
                self.config.max_file_size
            ));
        }

        let file_path = self.config.storage_dir.join(stored_name);

        let mut hasher = Sha256::new();
        hasher.update(data);
        let content_hash = hex::encode(hasher.finalize());

        fs::write(&file_path, data)
            .await
            .with_context(|| format!("Failed to write file to {:?}", file_path))?;

        Ok((file_path.to_string_lossy().to_string(), content_hash))
    }

    /// Canonicalize and check that a path stays inside the storage directory
    fn validate_path(&self, storage_path: &str) -> Result<PathBuf> {
        let file_path = Path::new(storage_path);

        let canonical_storage =
            std::fs::canonicalize(&self.config.storage_dir).with_context(|| {
                format!(
                    "Failed to canonicalize storage dir: {:?}",
                    self.config.storage_dir
                )
            })?;

        let canonical_file = std::fs::canonicalize(file_path)
            .with_context(|| format!("Failed to canonicalize file path: {:?}", file_path))?;

        if !canonical_file.starts_with(&canonical_storage) {
            return Err(anyhow!("Invalid file path: path traversal detected"));
        }

        Ok(canonical_file)
    }

    /// Read an attachment back from disk
    pub async fn read(&self, storage_path: &str) -> Result<Vec<u8>> {
        let canonical_path = self.validate_path(storage_path)?;

        fs::read(&canonical_path)
            .await
            .with_context(|| format!("Failed to read file from {:?}", canonical_path))
    }

    /// Delete an attachment; a blob that is already gone is not an error
    pub async fn remove(&self, storage_path: &str) -> Result<()> {
        if !Path::new(storage_path).exists() {
            return Ok(());
        }

        let canonical_path = self.validate_path(storage_path)?;
        fs::remove_file(&canonical_path)
            .await
            .with_context(|| format!("Failed to delete file at {:?}", canonical_path))?;

        Ok(())
    }

    /// Whether an attachment blob is present on disk
    pub fn exists(&self, storage_path: &str) -> bool {
        match self.validate_path(storage_path) {
            Ok(path) => path.exists(),
            Err(_) => false,
        }
    }

    /// Verify the content hash of a stored attachment
    pub async fn verify_content_hash(
        &self,
        storage_path: &str,
        expected_hash: &str,
    ) -> Result<bool> {
        let file_data = self.read(storage_path).await?;

        let mut hasher = Sha256::new();
        hasher.update(&file_data);
        let actual_hash = hex::encode(hasher.finalize());

        Ok(actual_hash == expected_hash)
    }
}
