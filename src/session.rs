//! Session lifecycle: idle-timeout expiry and debounced activity refresh.
//!
//! A session is a bounded window of continuous activity. The persisted
//! record carries no store TTL; expiry is logical, by comparing
//! `last_activity` against the configured timeout at read time.

use crate::device::random_base36;
use crate::store::{decode_record, encode_record, keys, KvStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Structured session record. Field names stay camelCase for compatibility
/// with records written by earlier releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    session_id: String,
    start_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// Produces session ids and keeps `last_activity` fresh.
pub struct SessionManager {
    store: Arc<dyn KvStore>,
    timeout: Duration,
    debounce_delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KvStore>, timeout: Duration, debounce_delay: Duration) -> Self {
        Self {
            store,
            timeout,
            debounce_delay,
            pending: Mutex::new(None),
        }
    }

    /// Return a session id that satisfies `now - last_activity < timeout`.
    ///
    /// Absent or expired sessions are replaced with a brand-new one (the old
    /// id is discarded). A legacy plain-string value is migrated into the
    /// structured form, preserving the old id with `start_time` reset to now.
    pub fn session_id(&self) -> String {
        let raw = match self.store.get(keys::SESSION) {
            Some(raw) => raw,
            None => return self.create_session(),
        };

        match decode_record::<serde_json::Value>(&raw) {
            Some(value) => match serde_json::from_value::<SessionRecord>(value) {
                Ok(record) => {
                    let max_idle =
                        chrono::Duration::from_std(self.timeout).unwrap_or_default();
                    if Utc::now() - record.last_activity < max_idle {
                        record.session_id
                    } else {
                        debug!("session expired, creating new session");
                        self.create_session()
                    }
                }
                // Structurally invalid record: regenerate.
                Err(_) => self.create_session(),
            },
            // Not base64(JSON): assume the legacy plain-id format.
            None => {
                debug!("migrating legacy session format");
                self.migrate_legacy_session(raw)
            }
        }
    }

    fn create_session(&self) -> String {
        let session_id = format!("session_{}", random_base36(13));
        let now = Utc::now();
        self.write_record(&SessionRecord {
            session_id: session_id.clone(),
            start_time: now,
            last_activity: now,
        });
        session_id
    }

    fn migrate_legacy_session(&self, old_id: String) -> String {
        // The original start time is unknown; reset it to now.
        let now = Utc::now();
        self.write_record(&SessionRecord {
            session_id: old_id.clone(),
            start_time: now,
            last_activity: now,
        });
        old_id
    }

    fn write_record(&self, record: &SessionRecord) {
        if let Some(encoded) = encode_record(record) {
            self.store.set(keys::SESSION, &encoded, None);
        }
    }

    /// Debounced activity refresh: repeated calls within the debounce delay
    /// coalesce into a single persisted write scheduled after the last call.
    /// The pending timer is replaced, never stacked.
    pub fn touch(&self) {
        let store = Arc::clone(&self.store);
        // Pin the deadline now, not at first poll of the spawned task, so
        // the write lands debounce_delay after this call even on a busy
        // executor.
        let sleep = tokio::time::sleep(self.debounce_delay);

        let mut pending = self.pending.lock().expect("session timer lock poisoned");
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        *pending = Some(tokio::spawn(async move {
            sleep.await;
            refresh_activity(&*store);
        }));
    }
}

/// Immediate `last_activity` write. An unparseable or missing record is
/// replaced with a fresh session.
fn refresh_activity(store: &dyn KvStore) {
    let now = Utc::now();
    let record = store
        .get(keys::SESSION)
        .and_then(|raw| decode_record::<SessionRecord>(&raw));

    let updated = match record {
        Some(mut record) => {
            record.last_activity = now;
            record
        }
        None => SessionRecord {
            session_id: format!("session_{}", random_base36(13)),
            start_time: now,
            last_activity: now,
        },
    };

    if let Some(encoded) = encode_record(&updated) {
        store.set(keys::SESSION, &encoded, None);
    }
}
