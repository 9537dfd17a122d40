//! Device identity resolution.
//!
//! Resolution order: persisted id, then an asynchronous fingerprinting
//! probe, then a randomly generated fallback. Exactly one resolution attempt
//! happens per engine instance, and readiness is monotonic: once set, the
//! device id never reverts to `None` for the lifetime of the instance.

use crate::error::Result;
use crate::store::{keys, KvStore};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

/// Asynchronous fingerprinting capability, injected by the platform.
///
/// There is no wall-clock timeout on the probe: fallback activates on probe
/// *rejection*, not elapsed time. A probe that never settles delays
/// resolution (and device-id backfilling) indefinitely, so implementations
/// should settle promptly.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Produce a stable device fingerprint.
    async fn probe(&self) -> Result<String>;
}

/// A probe for platforms without fingerprinting: always fails, which routes
/// resolution to the random fallback id.
pub struct ProbeUnavailable;

#[async_trait]
impl DeviceProbe for ProbeUnavailable {
    async fn probe(&self) -> Result<String> {
        Err(crate::error::BeaconError::InvalidCall(
            "no fingerprinting probe available".into(),
        ))
    }
}

/// Where the resolved device id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceIdSource {
    Persisted,
    Probe,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unresolved,
    Probing,
    Ready(DeviceIdSource),
}

/// Resolves and holds the device identifier.
pub struct DeviceIdResolver {
    store: Arc<dyn KvStore>,
    state: Mutex<State>,
    device_id: RwLock<Option<String>>,
    ready: AtomicBool,
}

impl DeviceIdResolver {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            state: Mutex::new(State::Unresolved),
            device_id: RwLock::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// Run the resolution state machine. At most one attempt per instance;
    /// repeated calls after the first are no-ops and return the settled
    /// source.
    pub async fn resolve(&self, probe: &dyn DeviceProbe) -> DeviceIdSource {
        {
            let mut state = self.state.lock().expect("device state lock poisoned");
            match *state {
                State::Ready(source) => return source,
                State::Probing => return DeviceIdSource::Probe,
                State::Unresolved => {
                    if let Some(existing) = self.store.get(keys::DEVICE_ID) {
                        debug!(device_id = %existing, "using persisted device id");
                        *state = State::Ready(DeviceIdSource::Persisted);
                        drop(state);
                        self.settle(existing, false);
                        return DeviceIdSource::Persisted;
                    }
                    *state = State::Probing;
                }
            }
        }

        debug!("no persisted device id, starting fingerprint probe");
        let source = match probe.probe().await {
            Ok(id) => {
                debug!(device_id = %id, "fingerprint probe resolved device id");
                self.settle(id, true);
                DeviceIdSource::Probe
            }
            Err(e) => {
                warn!(error = %e, "fingerprint probe failed, generating fallback id");
                let id = random_device_id();
                debug!(device_id = %id, "using fallback random device id");
                self.settle(id, true);
                DeviceIdSource::Fallback
            }
        };

        *self.state.lock().expect("device state lock poisoned") = State::Ready(source);
        source
    }

    fn settle(&self, id: String, persist: bool) {
        if persist {
            self.store.set(keys::DEVICE_ID, &id, Some(keys::DEVICE_ID_TTL));
        }
        *self.device_id.write().expect("device id lock poisoned") = Some(id);
        self.ready.store(true, Ordering::Release);
    }

    /// Monotonic readiness flag, consumed by the delivery queue to decide
    /// whether queued events may be flushed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// The resolved device id, or `None` while resolution is pending.
    pub fn device_id(&self) -> Option<String> {
        if !self.is_ready() {
            return None;
        }
        self.device_id
            .read()
            .expect("device id lock poisoned")
            .clone()
    }
}

/// `"device_"` plus two random base36 fragments.
fn random_device_id() -> String {
    format!("device_{}{}", random_base36(13), random_base36(13))
}

/// A random lowercase base36 string of the given length.
pub(crate) fn random_base36(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
