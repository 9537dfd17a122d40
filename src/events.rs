//! Wire types: event records and the identify/group payloads.

use crate::error::{BeaconError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single telemetry event. Immutable once queued except for the
/// `context.device_id` injection at flush time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_name: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    /// Open key-value bag; only the envelope is validated.
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub context: EventContext,
}

/// Identity and session context attached to every event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Null until device resolution completes; backfilled at flush time.
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EventRecord {
    /// Start a record with the current timestamp and an empty context.
    pub fn new(event_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            properties: Map::new(),
            context: EventContext::default(),
        }
    }

    /// Validate the typed envelope. The `properties` bag is deliberately
    /// schema-less and not inspected.
    pub fn validate(&self) -> Result<()> {
        if self.event_name.is_empty() {
            return Err(BeaconError::InvalidCall(
                "event_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Body element for `POST {endpoint}/identify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub user_id: String,
    pub traits: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Body element for `POST {endpoint}/group`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPayload {
    pub group_id: String,
    pub user_id: String,
    pub traits: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}
