//! Batched, retrying delivery of captured events to the collection endpoint.
//!
//! Events accumulate in a FIFO queue and are flushed either when the batch
//! size threshold is reached or when the batch interval elapses after the
//! first unflushed event. Flushing is deferred entirely until the device id
//! has resolved, so every delivered event carries a stable device identity.

use crate::config::EngineConfig;
use crate::device::DeviceIdResolver;
use crate::error::{BeaconError, Result};
use crate::events::EventRecord;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Per-batch delivery attempt budget.
const MAX_ATTEMPTS: u32 = 3;

/// Base wait between delivery attempts; the wait grows linearly with the
/// attempt number (1s, 2s).
const RETRY_WAIT: Duration = Duration::from_millis(1000);

/// Property keys whose values are redacted before transmission.
const REDACTED_KEYS: [&str; 7] = [
    "password",
    "secret",
    "token",
    "api_key",
    "credit_card",
    "card_number",
    "ssn",
];

/// Destination for captured events. The production implementation is
/// [`DeliveryQueue`]; tests substitute an in-memory collector.
pub trait EventSink: Send + Sync {
    fn submit(&self, events: Vec<EventRecord>);
}

/// A batch that exhausted its attempt budget. Published on a watch channel
/// so collaborators can observe delivery health.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub attempts: u32,
    pub events: usize,
    pub error: String,
    pub at: DateTime<Utc>,
}

struct Inner {
    pending: Mutex<VecDeque<EventRecord>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    device: Arc<DeviceIdResolver>,
    client: Client,
    endpoint: String,
    api_key: String,
    batch_size: usize,
    batch_interval: Duration,
    retry_wait: Duration,
    failures: watch::Sender<Option<DeliveryFailure>>,
}

/// FIFO event queue with size- and time-based flush triggers.
pub struct DeliveryQueue {
    inner: Arc<Inner>,
}

impl DeliveryQueue {
    pub fn new(config: &EngineConfig, client: Client, device: Arc<DeviceIdResolver>) -> Self {
        let (failures, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(VecDeque::new()),
                timer: Mutex::new(None),
                device,
                client,
                endpoint: config.endpoint.clone(),
                api_key: config.api_key.clone(),
                batch_size: config.batch_size,
                batch_interval: config.batch_interval(),
                retry_wait: RETRY_WAIT,
                failures,
            }),
        }
    }

    /// Append events and evaluate the flush triggers. When the device id is
    /// not yet resolved, events accumulate silently; [`kick`](Self::kick)
    /// flushes them once resolution completes.
    pub fn enqueue(&self, events: Vec<EventRecord>) {
        if events.is_empty() {
            return;
        }
        let len = {
            let mut pending = self.inner.pending.lock().expect("queue lock poisoned");
            pending.extend(events);
            pending.len()
        };

        if !self.inner.device.is_ready() {
            debug!(queued = len, "device id unresolved; deferring flush");
            return;
        }

        if len >= self.inner.batch_size {
            self.cancel_timer();
            self.spawn_flush();
        } else {
            self.arm_timer();
        }
    }

    /// Flush immediately if anything is pending. Invoked when the device id
    /// resolves to drain events deferred during startup.
    pub fn kick(&self) {
        let has_pending = !self
            .inner
            .pending
            .lock()
            .expect("queue lock poisoned")
            .is_empty();
        if has_pending {
            self.cancel_timer();
            self.spawn_flush();
        }
    }

    /// Watch channel carrying the most recent exhausted-batch failure.
    pub fn failure_watch(&self) -> watch::Receiver<Option<DeliveryFailure>> {
        self.inner.failures.subscribe()
    }

    fn spawn_flush(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            flush(inner).await;
        });
    }

    /// Arm the interval timer unless one is already pending.
    fn arm_timer(&self) {
        let mut timer = self.inner.timer.lock().expect("timer lock poisoned");
        if timer.as_ref().map_or(false, |t| !t.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.batch_interval).await;
            *inner.timer.lock().expect("timer lock poisoned") = None;
            flush(inner).await;
        }));
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self
            .inner
            .timer
            .lock()
            .expect("timer lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn set_retry_wait(&mut self, wait: Duration) {
        Arc::get_mut(&mut self.inner)
            .expect("queue already shared")
            .retry_wait = wait;
    }

    #[cfg(test)]
    fn pending_snapshot(&self) -> Vec<EventRecord> {
        self.inner
            .pending
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect()
    }
}

impl EventSink for DeliveryQueue {
    fn submit(&self, events: Vec<EventRecord>) {
        self.enqueue(events);
    }
}

/// Drain the queue and deliver it as one batch, retrying up to the attempt
/// budget. An exhausted batch is pushed back at the front of the queue in
/// its original order and waits for the next trigger.
async fn flush(inner: Arc<Inner>) {
    let batch: Vec<EventRecord> = {
        let mut pending = inner.pending.lock().expect("queue lock poisoned");
        pending.drain(..).collect()
    };
    if batch.is_empty() {
        return;
    }

    let device_id = inner.device.device_id();
    let batch: Vec<EventRecord> = batch
        .into_iter()
        .map(|mut event| {
            event.context.device_id = device_id.clone();
            event.properties = scrub_properties(&event.properties);
            event
        })
        .collect();

    let mut last_error = String::new();
    for attempt in 1..=MAX_ATTEMPTS {
        match post_batch(&inner, &batch).await {
            Ok(()) => {
                debug!(events = batch.len(), attempt, "batch delivered");
                return;
            }
            Err(err) => {
                warn!(attempt, events = batch.len(), error = %err, "batch delivery failed");
                last_error = err.to_string();
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(inner.retry_wait * attempt).await;
                }
            }
        }
    }

    let events = batch.len();
    {
        let mut pending = inner.pending.lock().expect("queue lock poisoned");
        for event in batch.into_iter().rev() {
            pending.push_front(event);
        }
    }
    warn!(
        events,
        attempts = MAX_ATTEMPTS,
        "delivery attempts exhausted; batch requeued"
    );
    let _ = inner.failures.send(Some(DeliveryFailure {
        attempts: MAX_ATTEMPTS,
        events,
        error: last_error,
        at: Utc::now(),
    }));
}

async fn post_batch(inner: &Inner, batch: &[EventRecord]) -> Result<()> {
    let response = inner
        .client
        .post(format!("{}/track", inner.endpoint))
        .header("x-api-key", &inner.api_key)
        .json(batch)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BeaconError::Delivery {
            status: status.as_u16(),
            body,
        });
    }
    Ok(())
}

/// Structural deep copy of the property map with sensitive values redacted.
fn scrub_properties(properties: &Map<String, Value>) -> Map<String, Value> {
    properties
        .iter()
        .map(|(key, value)| {
            let scrubbed = if is_sensitive(key) {
                Value::String("[redacted]".to_string())
            } else {
                scrub_value(value)
            };
            (key.clone(), scrubbed)
        })
        .collect()
}

fn scrub_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(scrub_properties(map)),
        Value::Array(items) => Value::Array(items.iter().map(scrub_value).collect()),
        other => other.clone(),
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    REDACTED_KEYS.iter().any(|needle| key.contains(needle))
}
