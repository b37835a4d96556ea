use super::{is_offload_wrapper, BlobObject, BlobStore, BlobStoreError, S3Pointer};
use crate::config::{OffloadSettings, DEFAULT_OFFLOAD_THRESHOLD_BYTES};
use base64::Engine as _;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn content_key(key_prefix: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let digest = to_hex(&hasher.finalize());
    let prefix = key_prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{digest}.json")
    } else {
        format!("{prefix}/{digest}.json")
    }
}

/// Moves oversized JSON payloads into blob storage and swaps them for
/// `{_s3_output_pointer}` wrappers; resolves wrappers back on read.
#[derive(Clone)]
pub struct PayloadOffloader {
    store: Arc<dyn BlobStore>,
    bucket: String,
    threshold_bytes: usize,
}

impl PayloadOffloader {
    pub fn new(store: Arc<dyn BlobStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            threshold_bytes: DEFAULT_OFFLOAD_THRESHOLD_BYTES,
        }
    }

    pub fn from_settings(store: Arc<dyn BlobStore>, settings: &OffloadSettings) -> Self {
        Self::new(store, settings.bucket.clone()).with_threshold(settings.threshold_bytes)
    }

    pub fn with_threshold(mut self, threshold_bytes: usize) -> Self {
        self.threshold_bytes = threshold_bytes;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Returns `payload` unchanged when it fits under the threshold or is
    /// already a pointer wrapper; otherwise uploads it and returns the wrapper.
    pub fn offload_if_large(
        &self,
        payload: Value,
        key_prefix: &str,
    ) -> Result<Value, BlobStoreError> {
        if is_offload_wrapper(&payload) {
            return Ok(payload);
        }
        let body =
            serde_json::to_vec(&payload).map_err(|err| BlobStoreError::Encode(err.to_string()))?;
        if body.len() <= self.threshold_bytes {
            return Ok(payload);
        }
        let key = content_key(key_prefix, &body);
        let size = body.len();
        self.store
            .put_object(&self.bucket, &key, body, CONTENT_TYPE_JSON)?;
        tracing::debug!(bucket = %self.bucket, key = %key, size, "offloaded payload");
        Ok(S3Pointer::new(self.bucket.clone(), key).to_wrapper())
    }

    /// Walks objects and arrays and offloads each oversized leaf in place,
    /// keeping the surrounding structure.
    pub fn offload_large_fields(
        &self,
        payload: Value,
        key_prefix: &str,
    ) -> Result<Value, BlobStoreError> {
        if is_offload_wrapper(&payload) {
            return Ok(payload);
        }
        match payload {
            Value::Object(object) => {
                let mut walked = Map::with_capacity(object.len());
                for (key, value) in object {
                    let child_prefix = format!("{}/{}", key_prefix.trim_end_matches('/'), key);
                    walked.insert(key, self.offload_large_fields(value, &child_prefix)?);
                }
                Ok(Value::Object(walked))
            }
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    let child_prefix = format!("{}/{index}", key_prefix.trim_end_matches('/'));
                    self.offload_large_fields(item, &child_prefix)
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            leaf => self.offload_if_large(leaf, key_prefix),
        }
    }

    /// Uploads `value` under an exact key regardless of its size.
    pub fn put_json(&self, key: &str, value: &Value) -> Result<S3Pointer, BlobStoreError> {
        let body =
            serde_json::to_vec(value).map_err(|err| BlobStoreError::Encode(err.to_string()))?;
        self.store
            .put_object(&self.bucket, key, body, CONTENT_TYPE_JSON)?;
        Ok(S3Pointer::new(self.bucket.clone(), key))
    }

    pub fn get_raw(&self, pointer: &S3Pointer) -> Result<BlobObject, BlobStoreError> {
        self.store.get_pointer(pointer)
    }

    /// JSON content is parsed, text is returned as a string and anything else
    /// is passed through base64-encoded.
    pub fn resolve_pointer(&self, pointer: &S3Pointer) -> Result<Value, BlobStoreError> {
        let object = self.get_raw(pointer)?;
        let content_type = object.content_type.to_ascii_lowercase();
        let decode_error = |reason: String| BlobStoreError::Decode {
            bucket: pointer.bucket.clone(),
            key: pointer.key.clone(),
            reason,
        };

        if content_type.starts_with("application/json") || content_type.ends_with("+json") {
            return serde_json::from_slice(&object.body)
                .map_err(|err| decode_error(err.to_string()));
        }
        if content_type.starts_with("text/") {
            return String::from_utf8(object.body)
                .map(Value::String)
                .map_err(|err| decode_error(err.to_string()));
        }
        Ok(Value::String(
            base64::engine::general_purpose::STANDARD.encode(&object.body),
        ))
    }

    pub fn resolve_if_pointer(&self, value: Value) -> Result<Value, BlobStoreError> {
        match S3Pointer::from_wrapper(&value) {
            Some(pointer) => self.resolve_pointer(&pointer),
            None => Ok(value),
        }
    }

    /// Resolves every wrapper found anywhere inside `value`.
    pub fn resolve_deep(&self, value: Value) -> Result<Value, BlobStoreError> {
        let value = self.resolve_if_pointer(value)?;
        match value {
            Value::Object(object) => object
                .into_iter()
                .map(|(key, child)| Ok((key, self.resolve_deep(child)?)))
                .collect::<Result<Map<_, _>, BlobStoreError>>()
                .map(Value::Object),
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.resolve_deep(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other),
        }
    }
}
