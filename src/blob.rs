//! Blob store for files attached to chat messages.
//!
//! Files are uploaded before the message is sent; the chat request only
//! carries the returned URL and MIME type.

use crate::models::FileAttachment;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UploadedFile {
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
}

impl From<UploadedFile> for FileAttachment {
    fn from(file: UploadedFile) -> Self {
        Self {
            name: file.name,
            url: file.url,
            mime_type: file.mime_type,
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &Path) -> Result<UploadedFile>;
}

fn infer_mime_type(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .to_string()
}

/// Stores uploads as plain files under one directory and hands out `file://` URLs.
pub struct LocalBlobStore {
    root_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, path: &Path) -> Result<UploadedFile> {
        let metadata = fs::metadata(path)
            .await
            .with_context(|| format!("Failed to read file '{}'", path.display()))?;
        if !metadata.is_file() {
            bail!("'{}' is not a regular file", path.display());
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("'{}' has no usable file name", path.display()))?;

        fs::create_dir_all(&self.root_dir).await.with_context(|| {
            format!("Failed to create upload directory '{}'", self.root_dir.display())
        })?;

        // Same-named uploads must not overwrite each other
        let dest_path = self.root_dir.join(format!("{}-{}", Uuid::new_v4(), name));
        let size = fs::copy(path, &dest_path).await.with_context(|| {
            format!(
                "Failed to copy file from '{}' to '{}'",
                path.display(),
                dest_path.display()
            )
        })?;
        let stored = fs::canonicalize(&dest_path)
            .await
            .with_context(|| format!("Failed to resolve '{}'", dest_path.display()))?;

        log::info!("Uploaded {} ({} bytes) to {}", name, size, stored.display());
        Ok(UploadedFile {
            mime_type: infer_mime_type(&name),
            url: format!("file://{}", stored.display()),
            name,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_copies_the_file_and_describes_it() {
        let source_dir = tempfile::tempdir().unwrap();
        let upload_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("lab-report.pdf");
        std::fs::write(&source, b"%PDF-1.4 titration results").unwrap();

        let store = LocalBlobStore::new(upload_dir.path());
        let uploaded = store.upload(&source).await.unwrap();

        assert_eq!(uploaded.name, "lab-report.pdf");
        assert_eq!(uploaded.mime_type, "application/pdf");
        assert_eq!(uploaded.size, 26);
        assert!(uploaded.url.starts_with("file://"));
        assert!(uploaded.url.ends_with("-lab-report.pdf"));

        let stored = std::fs::read_dir(upload_dir.path()).unwrap().count();
        assert_eq!(stored, 1);
        assert!(source.exists());
    }

    #[tokio::test]
    async fn same_name_uploads_get_distinct_urls() {
        let source_dir = tempfile::tempdir().unwrap();
        let upload_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("notes.txt");
        std::fs::write(&source, "mitosis has four phases").unwrap();

        let store = LocalBlobStore::new(upload_dir.path().join("nested"));
        let first = store.upload(&source).await.unwrap();
        let second = store.upload(&source).await.unwrap();

        assert_ne!(first.url, second.url);
        assert_eq!(first.mime_type, "text/plain");
    }

    #[tokio::test]
    async fn unknown_extension_falls_back_to_octet_stream() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("dataset.zzq");
        std::fs::write(&source, [1u8, 2, 3]).unwrap();

        let store = LocalBlobStore::new(source_dir.path().join("uploads"));
        let attachment: FileAttachment = store.upload(&source).await.unwrap().into();
        assert_eq!(attachment.mime_type, "application/octet-stream");
        assert_eq!(attachment.name, "dataset.zzq");
    }

    #[tokio::test]
    async fn missing_files_and_directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("uploads"));

        assert!(store.upload(&dir.path().join("absent.pdf")).await.is_err());
        assert!(store.upload(dir.path()).await.is_err());
    }
}
