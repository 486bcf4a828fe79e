//! Cooperative cancellation for long-running writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{FsError, Result};

/// Cancellation signal shared with a running write.
///
/// The write pipeline checks the token between chunks and before each block
/// write; a cancelled write fails with [`FsError::Interrupted`] and the
/// enclosing transaction stages nothing. Block files already written are
/// orphans reclaimed by the next commit's garbage collection.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(FsError::Interrupted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_trips_the_check() {
        let token = CancelToken::new();
        token.check().unwrap();

        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(FsError::Interrupted)));

        let shared = token.clone();
        assert!(shared.is_cancelled());
    }
}
