use super::S3Pointer;
use crate::shared::fs_atomic::write_file_atomically;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("blob s3://{bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("blob key `{key}` is not a valid relative object key")]
    InvalidKey { key: String },
    #[error("blob s3://{bucket}/{key} could not be decoded: {reason}")]
    Decode {
        bucket: String,
        key: String,
        reason: String,
    },
    #[error("payload could not be encoded for offload: {0}")]
    Encode(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobObject {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Minimal object storage surface used for payload offload, execution-log
/// full records and email attachments.
pub trait BlobStore: Send + Sync {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobStoreError>;

    fn get_object(&self, bucket: &str, key: &str) -> Result<BlobObject, BlobStoreError>;

    fn get_pointer(&self, pointer: &S3Pointer) -> Result<BlobObject, BlobStoreError> {
        self.get_object(&pointer.bucket, &pointer.key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileBlobMetadata {
    content_type: String,
}

/// Stores objects as files under `<root>/<bucket>/<key>` with a
/// `<key>.meta.json` sidecar holding the content type.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, BlobStoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe || bucket.contains(['/', '\\']) || bucket.is_empty() {
            return Err(BlobStoreError::InvalidKey {
                key: format!("{bucket}/{key}"),
            });
        }
        Ok(self.root.join(bucket).join(relative))
    }

    fn metadata_path(object_path: &Path) -> PathBuf {
        let mut name = object_path
            .file_name()
            .map(|v| v.to_os_string())
            .unwrap_or_default();
        name.push(".meta.json");
        object_path.with_file_name(name)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> BlobStoreError {
    BlobStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl BlobStore for FileBlobStore {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobStoreError> {
        let path = self.object_path(bucket, key)?;
        write_file_atomically(&path, &body).map_err(|e| io_error(&path, e))?;
        let metadata = serde_json::to_vec(&FileBlobMetadata {
            content_type: content_type.to_string(),
        })
        .map_err(|err| BlobStoreError::Encode(err.to_string()))?;
        let metadata_path = Self::metadata_path(&path);
        write_file_atomically(&metadata_path, &metadata).map_err(|e| io_error(&metadata_path, e))
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<BlobObject, BlobStoreError> {
        let path = self.object_path(bucket, key)?;
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BlobStoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => return Err(io_error(&path, err)),
        };
        let metadata_path = Self::metadata_path(&path);
        let content_type = match fs::read(&metadata_path) {
            Ok(raw) => serde_json::from_slice::<FileBlobMetadata>(&raw)
                .map(|metadata| metadata.content_type)
                .map_err(|err| BlobStoreError::Decode {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    reason: format!("invalid metadata sidecar: {err}"),
                })?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                "application/octet-stream".to_string()
            }
            Err(err) => return Err(io_error(&metadata_path, err)),
        };
        Ok(BlobObject { body, content_type })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<BTreeMap<(String, String), BlobObject>>,
    puts: AtomicUsize,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put_object` calls served so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<S3Pointer> {
        self.objects
            .lock()
            .map(|objects| {
                objects
                    .keys()
                    .map(|(bucket, key)| S3Pointer::new(bucket, key))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobStoreError> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| BlobStoreError::Unavailable("blob lock poisoned".to_string()))?;
        objects.insert(
            (bucket.to_string(), key.to_string()),
            BlobObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<BlobObject, BlobStoreError> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| BlobStoreError::Unavailable("blob lock poisoned".to_string()))?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}
