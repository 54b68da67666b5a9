//! Key–value rendezvous store contract and an in-process implementation.
//!
//! Ranks that share nothing but this store can mint and exchange
//! communicator ids and abort markers. Production deployments plug in a
//! distributed store; [`HashStore`] backs in-process clusters and tests.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{MusterError, Result};

/// Distributed key→bytes map shared by every rank of a process group.
pub trait Store: Send + Sync + 'static {
    /// Publish `value` under `key`, overwriting any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value for `key`, blocking until some rank publishes it.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Succeed once every key exists, failing if `timeout` elapses first.
    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()>;
}

/// In-memory [`Store`] for ranks that live in one process.
///
/// `get` blocks on a condition variable until the key appears, bounded by a
/// default timeout so a rendezvous mismatch fails loudly instead of hanging
/// forever.
pub struct HashStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
    cv: Condvar,
    get_timeout: Duration,
}

impl HashStore {
    pub fn new() -> Self {
        Self::with_get_timeout(Duration::from_secs(300))
    }

    pub fn with_get_timeout(get_timeout: Duration) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
            get_timeout,
        }
    }

    /// Snapshot of every key currently present. Diagnostic helper; the
    /// [`Store`] contract itself has no enumeration.
    pub fn keys(&self) -> Vec<String> {
        let map = lock(&self.map);
        map.keys().cloned().collect()
    }
}

impl Default for HashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for HashStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut map = lock(&self.map);
        map.insert(key.to_string(), value.to_vec());
        self.cv.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.get_timeout;
        let mut map = lock(&self.map);
        loop {
            if let Some(value) = map.get(key) {
                return Ok(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MusterError::store(format!(
                    "timed out waiting for key {key:?}"
                )));
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(map, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            map = guard;
        }
    }

    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut map = lock(&self.map);
        loop {
            if keys.iter().all(|k| map.contains_key(*k)) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MusterError::store(format!(
                    "timed out waiting for keys {keys:?}"
                )));
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(map, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            map = guard;
        }
    }
}

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
