//! Cooperative cancellation for long-running operations

use crate::errors::ImageError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared flag used to interrupt pulls, pushes, builds, and exports
///
/// Clones share the same underlying flag. Operations check the token at I/O
/// boundaries: once per copied chunk and once per enumerated directory entry.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation of every operation holding a clone of this token
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [ImageError::Cancelled] once cancellation was requested
    pub fn check(&self) -> Result<(), ImageError> {
        if self.is_cancelled() {
            Err(ImageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(ImageError::Cancelled)));
    }
}
