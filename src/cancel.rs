//! Cooperative cancellation for long-running commits.
//!
//! A [`CancellationSource`] is held by whoever may abort the work; the
//! [`CancellationToken`]s handed out from it are observed by the commit
//! at every per-node decision boundary. Cancellation is cooperative and
//! never an error: a cancelled commit returns an inconsistent snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owner side of a cancellation pair.
#[derive(Clone, Debug, Default)]
pub struct CancellationSource {
    flag: Arc<AtomicBool>,
}

impl CancellationSource {
    /// Create a fresh, unsignalled source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            flag: self.flag.clone(),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) fn same_as(&self, other: &CancellationSource) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

/// Observer side of a cancellation pair. Cheap to clone.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_observes_source() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
        assert!(source.is_cancelled());
    }

    #[test]
    fn clones_share_the_flag() {
        let source = CancellationSource::new();
        let clone = source.clone();
        assert!(source.same_as(&clone));
        clone.cancel();
        assert!(source.is_cancelled());
        assert!(!source.same_as(&CancellationSource::new()));
    }
}
