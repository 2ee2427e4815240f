//! Short-lived session keys.
//!
//! A session key stands in for the long-lived token on transports that
//! cannot carry custom headers: a token holder asks for a key, then passes it
//! as a query parameter. Keys expire after a fixed window. Expired keys are
//! purged lazily, on the next issuance or on a failed lookup; there is no
//! background timer.

use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default lifetime of a session key.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(60);

/// Random bytes per key before hex encoding.
const KEY_BYTES: usize = 32;

/// Issues and validates session keys.
#[derive(Debug)]
pub struct SessionKeyStore {
    ttl: Duration,
    /// key -> expiry
    keys: Mutex<HashMap<String, Instant>>,
}

impl Default for SessionKeyStore {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_TTL)
    }
}

impl SessionKeyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a fresh key valid for the configured window.
    pub fn issue(&self) -> String {
        self.issue_at(Instant::now())
    }

    pub(crate) fn issue_at(&self, now: Instant) -> String {
        let mut bytes = [0u8; KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = hex::encode(bytes);

        let mut keys = self.keys();
        let before = keys.len();
        keys.retain(|_, expires| now < *expires);
        if keys.len() != before {
            debug!(purged = before - keys.len(), "expired session keys purged");
        }
        keys.insert(key.clone(), now + self.ttl);
        key
    }

    /// Whether `key` exists and has not expired.
    ///
    /// A valid key stays valid for its whole window; validation neither
    /// consumes nor extends it.
    pub fn validate(&self, key: &str) -> bool {
        self.validate_at(key, Instant::now())
    }

    pub(crate) fn validate_at(&self, key: &str, now: Instant) -> bool {
        let mut keys = self.keys();
        match keys.get(key) {
            Some(expires) if now < *expires => true,
            Some(_) => {
                keys.remove(key);
                false
            }
            None => false,
        }
    }

    /// Number of stored keys, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
