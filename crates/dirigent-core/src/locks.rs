//! Per-record write serialization
//!
//! Synchronous execution, runner ticks, and callback folds all mutate
//! request records; a per-`request_id` async lock keeps those writes
//! linearizable. The engine owns one table (`Engine::locks`) and every
//! writer for a record must go through it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock table keyed by request id.
#[derive(Default)]
pub struct RecordLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one record, creating it on first use.
    pub async fn lock(&self, request_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = self.inner.lock();
            table
                .entry(request_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_serializes_same_record() {
        tokio_test::block_on(async {
            let locks = Arc::new(RecordLocks::new());
            let guard = locks.lock("r1").await;
            // a second lock on the same record must not be available
            let second = tokio::time::timeout(
                std::time::Duration::from_millis(20),
                locks.lock("r1"),
            )
            .await;
            assert!(second.is_err());
            drop(guard);
            assert!(tokio::time::timeout(
                std::time::Duration::from_millis(20),
                locks.lock("r1"),
            )
            .await
            .is_ok());
        });
    }

    #[test]
    fn test_different_records_do_not_contend() {
        tokio_test::block_on(async {
            let locks = RecordLocks::new();
            let _a = locks.lock("r1").await;
            let b = tokio::time::timeout(
                std::time::Duration::from_millis(20),
                locks.lock("r2"),
            )
            .await;
            assert!(b.is_ok());
        });
    }
}
