use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const OFFLOAD_POINTER_KEY: &str = "_s3_output_pointer";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct S3Pointer {
    pub bucket: String,
    pub key: String,
}

impl S3Pointer {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Reads a bare `{bucket, key}` object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let bucket = object.get("bucket")?.as_str()?;
        let key = object.get("key")?.as_str()?;
        Some(Self::new(bucket, key))
    }

    /// Reads the pointer out of a `{_s3_output_pointer: {bucket, key}}` wrapper.
    pub fn from_wrapper(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        Self::from_value(object.get(OFFLOAD_POINTER_KEY)?)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(Map::from_iter([
            ("bucket".to_string(), Value::String(self.bucket.clone())),
            ("key".to_string(), Value::String(self.key.clone())),
        ]))
    }

    pub fn to_wrapper(&self) -> Value {
        Value::Object(Map::from_iter([(
            OFFLOAD_POINTER_KEY.to_string(),
            self.to_value(),
        )]))
    }
}

impl std::fmt::Display for S3Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

pub fn is_offload_wrapper(value: &Value) -> bool {
    S3Pointer::from_wrapper(value).is_some()
}
