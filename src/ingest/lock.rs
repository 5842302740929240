use crate::error::IngestError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;

/// Keyed mutual exclusion: at most one body runs per key at a time, bodies
/// for different keys run fully concurrently. Process-scoped and advisory;
/// acquisition is bounded by a lease so a stuck holder surfaces as a
/// retryable `LockTimeout` instead of blocking a device forever.
pub struct KeyedLocks {
    entries: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    timeout: Duration,
}

impl KeyedLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Run `body` while holding the lock for `key`. The lock is released on
    /// every exit path and the outcome of `body` is propagated unchanged.
    pub async fn with_lock<T, F>(&self, key: &str, body: F) -> Result<T, IngestError>
    where
        F: Future<Output = Result<T, IngestError>>,
    {
        let entry = {
            let mut entries = self.entries.lock().expect("lock registry poisoned");
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };

        let guard = match tokio::time::timeout(self.timeout, entry.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.release_entry(key, &entry);
                return Err(IngestError::LockTimeout {
                    key: key.to_string(),
                });
            }
        };

        let result = body.await;
        drop(guard);
        self.release_entry(key, &entry);
        result
    }

    /// Drop the map entry once nobody else holds a clone. The registry mutex
    /// is held while counting, so no new clone can appear in between.
    fn release_entry(&self, key: &str, entry: &Arc<TokioMutex<()>>) {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        if Arc::strong_count(entry) == 2 {
            entries.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.entries.lock().expect("lock registry poisoned").len()
    }
}
