//! Removal fence for a plugin's memory namespace.
//!
//! Memory host calls run under the fence's read lock. Removal takes the
//! write lock, marks the fence closed and purges the namespace before
//! releasing it, so a handler still running from before the removal can
//! no longer write into the purged namespace. A reinstall gets a fresh
//! fence; instances built before it keep the closed one.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryFence {
    closed: Arc<RwLock<bool>>,
}

/// Holds a closed fence until the namespace purge is done.
#[derive(Debug)]
pub(crate) struct Retirement {
    _closed: OwnedRwLockWriteGuard<bool>,
}

impl MemoryFence {
    /// Run `op` unless the plugin has been removed.
    pub(crate) async fn guard<T>(&self, op: impl Future<Output = T>) -> Option<T> {
        let closed = self.closed.read().await;
        if *closed {
            return None;
        }
        Some(op.await)
    }

    /// Wait for in-flight memory calls, then refuse every later one.
    pub(crate) async fn close(&self) -> Retirement {
        let mut closed = Arc::clone(&self.closed).write_owned().await;
        *closed = true;
        Retirement { _closed: closed }
    }

    /// Closed and no longer held by a purge.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.try_read().is_ok_and(|closed| *closed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn closing_waits_for_running_calls() {
        let fence = MemoryFence::default();
        let wrote = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let running = {
            let fence = fence.clone();
            let wrote = Arc::clone(&wrote);
            tokio::spawn(async move {
                fence
                    .guard(async {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        wrote.store(true, Ordering::SeqCst);
                        "written"
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let retirement = fence.close().await;
        assert!(wrote.load(Ordering::SeqCst));
        assert_eq!(running.await.unwrap(), Some("written"));
        assert!(!fence.is_closed(), "still held by the purge");
        drop(retirement);

        assert!(fence.is_closed());
        assert_eq!(fence.guard(async { "late" }).await, None);
    }
}
