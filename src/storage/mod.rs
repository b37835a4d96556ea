pub mod blob;
pub mod offload;
pub mod pointer;

pub use blob::{BlobObject, BlobStore, BlobStoreError, FileBlobStore, InMemoryBlobStore};
pub use offload::{PayloadOffloader, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT};
pub use pointer::{is_offload_wrapper, S3Pointer, OFFLOAD_POINTER_KEY};
