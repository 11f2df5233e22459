//! Error types you might see while pulling, building, or exporting images

use crate::image::ContentDigest;
use thiserror::Error;

/// Errors during image operations
#[derive(Error, Debug)]
pub enum ImageError {
    /// invalid image reference format
    #[error("invalid image reference format: {0:?}")]
    InvalidReferenceFormat(String),

    /// illegal argument
    #[error("{0}")]
    IllegalArgument(String),

    /// malformed input data
    #[error("illegal format: {0}")]
    IllegalFormat(String),

    /// operation attempted against inconsistent state
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// a referenced object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// a requested feature is not implemented
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// internal error
    #[error("internal error: {0}")]
    Internal(String),

    /// storage io error
    #[error("storage io error: {0}")]
    Storage(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// config file error
    #[error("config file error: {0}")]
    ConfigFile(#[from] serde_yaml::Error),

    /// network request error
    #[error("network request error: {0}")]
    Network(#[from] reqwest::Error),

    /// unexpected status from a registry server
    #[error("unexpected registry response {status} for {url}")]
    RegistryStatus { status: u16, url: String },

    /// registry server requested an unsupported type of authentication
    #[error("registry server requested an unsupported type of authentication: {0:?}")]
    UnsupportedAuthentication(String),

    /// calculated digest of transferred content is not what we asked for
    #[error("digest mismatch, expected {expected}, found {found}")]
    ContentDigestMismatch {
        expected: ContentDigest,
        found: ContentDigest,
    },

    /// a chain of symlinks points back at itself
    #[error("loop detected by symlink: {0}")]
    LoopDetected(String),

    /// the operation was cancelled before it could finish
    #[error("operation cancelled")]
    Cancelled,

    /// asynchronous task failed during an image operation
    #[error("asynchronous task failed during an image operation")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// utf8 path conversion error
    #[error("utf8 path conversion error")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ImageError {
    /// True for errors caused by an object that simply is not there
    pub fn is_not_found(&self) -> bool {
        match self {
            ImageError::NotFound(_) => true,
            ImageError::Storage(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
