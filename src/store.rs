//! Key-value persistence: the identity store, the short-lived cache, and the
//! base64(JSON) codec for composite records.
//!
//! Long-lived identity entries (device/user/group id) and short-lived cache
//! entries (session, geo) share the same [`KvStore`] mechanism but use
//! independent TTL policies, defined in [`keys`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Persisted keys and their TTL policies.
pub mod keys {
    use std::time::Duration;

    pub const DEVICE_ID: &str = "beacon_device_id";
    pub const USER_ID: &str = "beacon_user_id";
    pub const GROUP_ID: &str = "beacon_group_id";
    pub const SESSION: &str = "beacon_session";
    pub const GEO_INFO: &str = "beacon_geo";

    /// Device ids outlive logins: 730 days.
    pub const DEVICE_ID_TTL: Duration = Duration::from_secs(730 * 24 * 60 * 60);
    /// User and group ids: 365 days.
    pub const IDENTITY_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
    /// Geo cache: 24 hours, never re-checked against the service within that
    /// window.
    pub const GEO_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    // The session record carries no store TTL; expiry is logical, by
    // timestamp comparison in the session manager.
}

/// Synchronous key-value store with per-key expiry.
///
/// The engine is the only writer and the execution model guarantees no two
/// writes interleave mid-operation, so implementations are last-write-wins
/// without locking requirements beyond `Send + Sync`.
pub trait KvStore: Send + Sync {
    /// Read a value. Expired entries read as absent.
    fn get(&self, key: &str) -> Option<String>;
    /// Write a value. `None` TTL means the entry never expires on its own.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>);
    /// Remove an entry if present.
    fn remove(&self, key: &str);
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process [`KvStore`] backed by a HashMap. The default store for
/// embedded use and the test double throughout the crate.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let expired = match entries.get(key) {
            Some(entry) => entry
                .expires_at
                .is_some_and(|expires_at| Instant::now() >= expires_at),
            None => return None,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), entry);
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .expect("store lock poisoned")
            .remove(key);
    }
}

/// Serialize a composite record as base64(JSON) for storage.
pub fn encode_record<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_vec(value) {
        Ok(json) => Some(BASE64.encode(json)),
        Err(e) => {
            warn!(error = %e, "failed to encode record for storage");
            None
        }
    }
}

/// Decode a base64(JSON) record. Any decode or parse failure reads as
/// "entry absent": corrupted storage regenerates rather than erroring.
pub fn decode_record<T: DeserializeOwned>(value: &str) -> Option<T> {
    let bytes = BASE64.decode(value).ok()?;
    serde_json::from_slice(&bytes).ok()
}
