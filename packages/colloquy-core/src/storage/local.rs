//! Filesystem object store.
//!
//! Writes are atomic: data lands in a temp file that is fsynced and then
//! renamed over the final path, so readers never observe a half-written
//! object even across a crash.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{validate_key, ObjectStore};
use crate::error::{ColloquyError, ColloquyResult};

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, key: &str) -> ColloquyResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn io_err(op: &str, e: std::io::Error) -> ColloquyError {
    ColloquyError::Storage(format!("{op}: {e}"))
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, path: &str, data: &[u8], _content_type: &str) -> ColloquyResult<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("mkdir", e))?;
        }

        let tmp = target.with_extension("tmp-upload");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_err("create", e))?;
        file.write_all(data).await.map_err(|e| io_err("write", e))?;
        file.sync_all().await.map_err(|e| io_err("fsync", e))?;
        drop(file);

        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| io_err("rename", e))?;
        Ok(path.to_string())
    }

    async fn download(&self, path: &str) -> ColloquyResult<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ColloquyError::NotFound(format!("object {path}"))
            } else {
                io_err("read", e)
            }
        })
    }

    /// Local files have no URL scheme worth signing; a `file://` URI keeps
    /// the contract uniform for single-node deployments.
    async fn presign(&self, path: &str, _expires_secs: u64) -> ColloquyResult<String> {
        let target = self.resolve(path)?;
        Ok(format!("file://{}", target.display()))
    }

    async fn delete(&self, path: &str) -> ColloquyResult<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("delete", e)),
        }
    }

    async fn exists(&self, path: &str) -> ColloquyResult<bool> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target)
            .await
            .map_err(|e| io_err("stat", e))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store
            .upload("meetings/42/audio.wav", b"pcm-bytes", "audio/wav")
            .await
            .unwrap();
        assert!(store.exists("meetings/42/audio.wav").await.unwrap());
        let data = store.download("meetings/42/audio.wav").await.unwrap();
        assert_eq!(data, b"pcm-bytes");
    }

    #[tokio::test]
    async fn upload_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.upload("a/b.bin", &[1, 2, 3], "application/octet-stream").await.unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, ["b.bin"]);
    }

    #[tokio::test]
    async fn traversal_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store.download("../outside").await.unwrap_err();
        assert_eq!(err.code(), "invalid_storage_key");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.upload("x", b"1", "text/plain").await.unwrap();
        store.delete("x").await.unwrap();
        store.delete("x").await.unwrap();
        assert!(!store.exists("x").await.unwrap());
    }
}
