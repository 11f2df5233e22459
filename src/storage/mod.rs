//! Local state storage: path abstraction, blobs, and the KV cache

mod blob;
mod cache;
mod path;

pub use blob::{BlobStore, BlobWriter};
pub use cache::KeyValueCache;
pub use path::{safe_write, FileInfo, MemStore, OsStore, OverlayStore, PathStore, TempFile};
