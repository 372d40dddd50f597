use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ArchiveError;

/// Cooperative cancellation for long running dumps, parses and restores.
///
/// The flag is checked at every directory entry and content block, so large
/// archives can be interrupted promptly. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Fails with [`ArchiveError::Aborted`] once [`abort`](Self::abort) was called.
    pub fn check_abort(&self) -> Result<(), ArchiveError> {
        if self.is_aborted() {
            return Err(ArchiveError::Aborted);
        }
        Ok(())
    }
}

/// Convenience for the optional handles stored by the codec.
pub(crate) fn check_abort(handle: &Option<AbortHandle>) -> Result<(), ArchiveError> {
    match handle {
        Some(handle) => handle.check_abort(),
        None => Ok(()),
    }
}
