//! Object storage for recording media.
//!
//! Two interchangeable backends behind one trait: an S3-compatible service
//! (MinIO in development) and a plain filesystem tree for tests and
//! single-node deployments. Keys are validated against path traversal
//! before they reach either backend.

mod local;
mod s3;

pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StorageBackendKind, StorageConfig};
use crate::error::{ColloquyError, ColloquyResult};

/// Abstract interface for object storage operations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads data. Returns the storage path.
    async fn upload(&self, path: &str, data: &[u8], content_type: &str) -> ColloquyResult<String>;

    /// Downloads an object's full contents.
    async fn download(&self, path: &str) -> ColloquyResult<Vec<u8>>;

    /// Generates a time-limited download URL.
    async fn presign(&self, path: &str, expires_secs: u64) -> ColloquyResult<String>;

    async fn delete(&self, path: &str) -> ColloquyResult<()>;

    async fn exists(&self, path: &str) -> ColloquyResult<bool>;
}

/// Rejects keys that could escape the storage root: empty keys, absolute
/// paths, backslashes, and any `..` component.
pub fn validate_key(key: &str) -> ColloquyResult<()> {
    if key.is_empty() {
        return Err(ColloquyError::InvalidStorageKey("empty key".into()));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(ColloquyError::InvalidStorageKey(format!(
            "absolute or non-portable key: {key}"
        )));
    }
    if key.split('/').any(|part| part == "..") {
        return Err(ColloquyError::InvalidStorageKey(format!(
            "path traversal in key: {key}"
        )));
    }
    Ok(())
}

/// Builds the backend selected by configuration.
pub fn build_object_store(config: &StorageConfig) -> ColloquyResult<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackendKind::Local => Ok(Arc::new(LocalObjectStore::new(&config.local_root))),
        StorageBackendKind::S3 => Ok(Arc::new(S3ObjectStore::new(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_keys_are_rejected() {
        assert!(validate_key("recordings/../secrets").is_err());
        assert!(validate_key("..").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("a\\b").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn ordinary_keys_pass() {
        assert!(validate_key("meetings/42/audio.wav").is_ok());
        assert!(validate_key("a.b.c").is_ok());
        // A dot-dot substring inside a component is not traversal.
        assert!(validate_key("weird..name/file").is_ok());
    }
}
