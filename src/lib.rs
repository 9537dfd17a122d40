//! Beacon — client-side telemetry capture and delivery.
//!
//! Resolves a durable device identity, tracks user/account identity and
//! activity-based sessions, auto-captures page, click, and form events, and
//! delivers everything in consent-gated, retried batches to a collection
//! endpoint. The host environment plugs in through three small seams:
//! a key-value store, a device probe, and a do-not-track signal.

pub mod capture;
pub mod config;
pub mod consent;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod geo;
pub mod identity;
pub mod queue;
pub mod session;
pub mod store;

pub use capture::{ClickEvent, ElementInfo, EventCapture, FormDescriptor, PageView};
pub use config::EngineConfig;
pub use consent::{ConsentCategory, DoNotTrackSignal, StaticDnt};
pub use device::{DeviceIdSource, DeviceProbe, ProbeUnavailable};
pub use engine::{Engine, Platform};
pub use error::{BeaconError, Result};
pub use events::EventRecord;
pub use queue::DeliveryFailure;
pub use store::{KvStore, MemoryStore};
