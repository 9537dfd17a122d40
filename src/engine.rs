//! The public engine surface: construction, explicit tracking and identity
//! calls, consent control, and delivery/readiness observation.

use crate::capture::EventCapture;
use crate::consent::{ConsentCategory, ConsentGate, DoNotTrackSignal};
use crate::device::{DeviceIdResolver, DeviceProbe};
use crate::error::{BeaconError, Result};
use crate::events::{EventRecord, GroupPayload, IdentifyPayload};
use crate::geo::GeoResolver;
use crate::identity::IdentityHandle;
use crate::queue::{DeliveryFailure, DeliveryQueue, EventSink};
use crate::session::SessionManager;
use crate::store::KvStore;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;

/// Host-environment capabilities the engine cannot provide itself: durable
/// storage, device identification, and the platform do-not-track signal.
pub struct Platform {
    pub store: Arc<dyn KvStore>,
    pub probe: Arc<dyn DeviceProbe>,
    pub dnt: Box<dyn DoNotTrackSignal>,
}

/// Telemetry engine handle. Cheap to share via `Arc`; all methods take
/// `&self`.
pub struct Engine {
    client: Client,
    endpoint: String,
    api_key: String,
    consent: Arc<ConsentGate>,
    identity: Arc<IdentityHandle>,
    device: Arc<DeviceIdResolver>,
    queue: Arc<DeliveryQueue>,
    capture: EventCapture,
    source: Arc<RwLock<String>>,
    ready: Arc<watch::Sender<bool>>,
}

impl Engine {
    /// Build the engine and start its background resolutions. Must be called
    /// within a tokio runtime: device and geolocation resolution are spawned
    /// immediately and run concurrently with event capture.
    pub fn new(config: EngineConfig, platform: Platform) -> Result<Arc<Self>> {
        config.validate()?;

        let client = Client::new();
        let consent = Arc::new(ConsentGate::new(
            config.respect_do_not_track,
            config.enable_consent,
            config.default_consent,
            platform.dnt,
        ));
        let identity = Arc::new(IdentityHandle::new(platform.store.clone()));
        let device = Arc::new(DeviceIdResolver::new(platform.store.clone()));
        let session = Arc::new(SessionManager::new(
            platform.store.clone(),
            config.session_timeout(),
            config.debounce_delay(),
        ));
        let geo = Arc::new(GeoResolver::new(
            platform.store.clone(),
            client.clone(),
            config.geo_service_url.clone(),
        ));
        let queue = Arc::new(DeliveryQueue::new(&config, client.clone(), device.clone()));
        let source = Arc::new(RwLock::new(config.source.clone()));
        let (ready, _) = watch::channel(false);
        let ready = Arc::new(ready);

        let sink: Arc<dyn EventSink> = queue.clone();
        let capture = EventCapture::new(
            consent.clone(),
            identity.clone(),
            device.clone(),
            session,
            geo.clone(),
            sink,
            source.clone(),
            config.track_clicks,
            config.track_forms,
        );

        let engine = Arc::new(Self {
            client,
            endpoint: config.endpoint,
            api_key: config.api_key,
            consent,
            identity,
            device: device.clone(),
            queue: queue.clone(),
            capture,
            source,
            ready: ready.clone(),
        });

        // Device resolution gates all delivery; flushing anything deferred
        // the moment it completes.
        let probe = platform.probe;
        tokio::spawn(async move {
            let resolved = device.resolve(probe.as_ref()).await;
            info!(source = ?resolved, "device id resolved");
            let _ = ready.send(true);
            queue.kick();
        });

        tokio::spawn(async move {
            geo.resolve().await;
        });

        Ok(engine)
    }

    /// Queue explicit events for batched delivery. Rejects events with an
    /// empty name; never performs network I/O synchronously.
    pub fn track(&self, mut events: Vec<EventRecord>) -> Result<()> {
        if !self.consent.should_track() {
            return Ok(());
        }
        for event in &events {
            event.validate()?;
        }
        let source = self.source.read().expect("source lock poisoned").clone();
        for event in &mut events {
            if event.user_id.is_empty() {
                event.user_id = self.identity.current_user_id();
            }
            if event.context.group_id.is_none() {
                event.context.group_id = Some(self.identity.current_group_id());
            }
            if event.context.source.is_none() {
                event.context.source = Some(source.clone());
            }
        }
        self.queue.enqueue(events);
        Ok(())
    }

    /// Associate the current device with a user and send one identify call.
    ///
    /// Idempotent against the persisted user id: repeating the same id skips
    /// the network call. Returns whether a call was made.
    pub async fn set_user(
        &self,
        user_id: &str,
        email: Option<&str>,
        name: Option<&str>,
        properties: Map<String, Value>,
    ) -> Result<bool> {
        if user_id.is_empty() {
            warn!("set_user called without a user id");
            return Err(BeaconError::InvalidCall(
                "set_user requires a non-empty user id".to_string(),
            ));
        }
        if !self.consent.should_track() {
            return Ok(false);
        }

        let already_set = self.identity.persisted_user_id().as_deref() == Some(user_id);
        self.identity.set_user_id(user_id);
        if already_set {
            debug!(user_id, "user id unchanged; identify skipped");
            return Ok(false);
        }

        let mut traits = Map::new();
        traits.insert("user_email".into(), opt_string(email));
        traits.insert("user_name".into(), opt_string(name));
        traits.extend(properties);

        let payload = vec![IdentifyPayload {
            user_id: user_id.to_string(),
            traits,
            timestamp: Utc::now(),
        }];
        self.post_identity("identify", &payload).await?;
        info!(user_id, "user identified");
        Ok(true)
    }

    /// Associate the current user with an account and send one group call.
    ///
    /// Idempotent against the persisted group id, like [`set_user`](Self::set_user).
    pub async fn set_group(
        &self,
        group_id: &str,
        domain: Option<&str>,
        name: Option<&str>,
        properties: Map<String, Value>,
    ) -> Result<bool> {
        if group_id.is_empty() {
            warn!("set_group called without a group id");
            return Err(BeaconError::InvalidCall(
                "set_group requires a non-empty group id".to_string(),
            ));
        }
        if !self.consent.should_track() {
            return Ok(false);
        }

        let already_set = self.identity.persisted_group_id().as_deref() == Some(group_id);
        self.identity.set_group_id(group_id);
        if already_set {
            debug!(group_id, "group id unchanged; group call skipped");
            return Ok(false);
        }

        let mut traits = Map::new();
        traits.insert("group_type".into(), Value::String("Account".to_string()));
        traits.insert("account_domain".into(), opt_string(domain));
        traits.insert("account_name".into(), opt_string(name));
        traits.extend(properties);

        let payload = vec![GroupPayload {
            group_id: group_id.to_string(),
            user_id: self.identity.current_user_id(),
            traits,
            timestamp: Utc::now(),
        }];
        self.post_identity("group", &payload).await?;
        info!(group_id, "group identified");
        Ok(true)
    }

    pub fn set_consent(&self, category: ConsentCategory, granted: bool) {
        self.consent.set_consent(category, granted);
    }

    /// Override the source label stamped on every subsequent event.
    pub fn set_source(&self, source: &str) {
        *self.source.write().expect("source lock poisoned") = source.to_string();
    }

    /// Auto-capture entry points for the platform adapter.
    pub fn capture(&self) -> &EventCapture {
        &self.capture
    }

    pub fn interaction_history(&self) -> Vec<crate::capture::Interaction> {
        self.capture.interaction_history()
    }

    /// True once the device id has resolved.
    pub fn is_ready(&self) -> bool {
        self.device.is_ready()
    }

    /// Watch channel that flips to `true` when the device id resolves.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Watch channel carrying the most recent exhausted delivery batch.
    pub fn delivery_failures(&self) -> watch::Receiver<Option<DeliveryFailure>> {
        self.queue.failure_watch()
    }

    /// Single-attempt POST for identify/group calls. Unlike batched track
    /// delivery, errors propagate to the caller, who awaited the call.
    async fn post_identity<T: Serialize>(&self, path: &str, payload: &[T]) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/{}", self.endpoint, path))
            .header("x-api-key", &self.api_key)
            .json(payload)
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
}

fn opt_string(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::String(v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PageView;
    use crate::consent::StaticDnt;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedProbe(&'static str);

    #[async_trait::async_trait]
    impl DeviceProbe for FixedProbe {
        async fn probe(&self) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn platform(store: Arc<dyn KvStore>) -> Platform {
        Platform {
            store,
            probe: Arc::new(FixedProbe("device_fixed")),
            dnt: Box::new(StaticDnt(false)),
        }
    }

    fn config(endpoint: &str) -> EngineConfig {
        let mut cfg = EngineConfig::new("test-key", "product");
        cfg.endpoint = endpoint.to_string();
        cfg.geo_service_url = "http://127.0.0.1:1/json".to_string();
        cfg.batch_size = 1;
        cfg
    }

    async fn wait_ready(engine: &Engine) {
        let mut ready = engine.ready();
        while !*ready.borrow() {
            ready.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn construction_rejects_missing_api_key() {
        let mut cfg = EngineConfig::new("", "product");
        cfg.geo_service_url = "http://127.0.0.1:1/json".to_string();
        let Err(err) = Engine::new(cfg, platform(Arc::new(MemoryStore::new()))) else {
            panic!("construction should fail without an api key");
        };
        assert!(matches!(err, BeaconError::Config(_)));
    }

    #[tokio::test]
    async fn readiness_flips_once_device_resolves() {
        let server = MockServer::start().await;
        let engine = Engine::new(config(&server.uri()), platform(Arc::new(MemoryStore::new())))
            .unwrap();
        wait_ready(&engine).await;
        assert!(engine.is_ready());
    }

    #[tokio::test]
    async fn track_delivers_enriched_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/track"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let engine = Engine::new(config(&server.uri()), platform(Arc::new(MemoryStore::new())))
            .unwrap();
        wait_ready(&engine).await;

        engine.track(vec![EventRecord::new("plan_upgraded", "")]).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: Vec<serde_json::Value> = requests[0].body_json().unwrap();
        assert_eq!(body[0]["event_name"], "plan_upgraded");
        assert_eq!(body[0]["context"]["source"], "product");
        assert_eq!(body[0]["context"]["device_id"], "device_fixed");
    }

    #[tokio::test]
    async fn track_rejects_unnamed_events() {
        let server = MockServer::start().await;
        let engine = Engine::new(config(&server.uri()), platform(Arc::new(MemoryStore::new())))
            .unwrap();
        let err = engine.track(vec![EventRecord::new("", "user-1")]).unwrap_err();
        assert!(matches!(err, BeaconError::InvalidCall(_)));
    }

    #[tokio::test]
    async fn set_user_is_idempotent_per_persisted_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/identify"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let engine = Engine::new(config(&server.uri()), platform(Arc::new(MemoryStore::new())))
            .unwrap();

        let mut props = Map::new();
        props.insert("plan".into(), json!("pro"));
        let sent = engine
            .set_user("user-1", Some("u@example.com"), Some("Usha"), props)
            .await
            .unwrap();
        assert!(sent);

        let sent_again = engine
            .set_user("user-1", Some("u@example.com"), None, Map::new())
            .await
            .unwrap();
        assert!(!sent_again);

        // A different id is not a repeat: it issues a second identify call.
        let sent_new = engine
            .set_user("user-2", None, None, Map::new())
            .await
            .unwrap();
        assert!(sent_new);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let body: Vec<serde_json::Value> = requests[0].body_json().unwrap();
        assert_eq!(body[0]["user_id"], "user-1");
        assert_eq!(body[0]["traits"]["user_email"], "u@example.com");
        assert_eq!(body[0]["traits"]["user_name"], "Usha");
        assert_eq!(body[0]["traits"]["plan"], "pro");
    }

    #[tokio::test]
    async fn set_user_requires_an_id() {
        let server = MockServer::start().await;
        let engine = Engine::new(config(&server.uri()), platform(Arc::new(MemoryStore::new())))
            .unwrap();
        let err = engine
            .set_user("", None, None, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BeaconError::InvalidCall(_)));
    }

    #[tokio::test]
    async fn set_group_sends_account_traits_with_current_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/identify"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/group"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let engine = Engine::new(config(&server.uri()), platform(Arc::new(MemoryStore::new())))
            .unwrap();
        engine
            .set_user("user-1", None, None, Map::new())
            .await
            .unwrap();
        let sent = engine
            .set_group("acct-1", Some("example.com"), Some("Example"), Map::new())
            .await
            .unwrap();
        assert!(sent);

        let requests = server.received_requests().await.unwrap();
        let group_req = requests
            .iter()
            .find(|r| r.url.path() == "/group")
            .unwrap();
        let body: Vec<serde_json::Value> = group_req.body_json().unwrap();
        assert_eq!(body[0]["group_id"], "acct-1");
        assert_eq!(body[0]["user_id"], "user-1");
        assert_eq!(body[0]["traits"]["group_type"], "Account");
        assert_eq!(body[0]["traits"]["account_domain"], "example.com");
        assert_eq!(body[0]["traits"]["account_name"], "Example");
    }

    #[tokio::test]
    async fn set_user_propagates_delivery_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/identify"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let engine = Engine::new(config(&server.uri()), platform(Arc::new(MemoryStore::new())))
            .unwrap();
        let err = engine
            .set_user("user-1", None, None, Map::new())
            .await
            .unwrap_err();
        match err {
            BeaconError::Delivery { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn do_not_track_suppresses_identity_calls() {
        let server = MockServer::start().await;
        let engine = Engine::new(
            config(&server.uri()),
            Platform {
                store: Arc::new(MemoryStore::new()),
                probe: Arc::new(FixedProbe("device_fixed")),
                dnt: Box::new(StaticDnt(true)),
            },
        )
        .unwrap();

        let sent = engine
            .set_user("user-1", None, None, Map::new())
            .await
            .unwrap();
        assert!(!sent);
        engine.track(vec![EventRecord::new("ev", "user-1")]).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_source_restamps_subsequent_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/track"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let engine = Engine::new(config(&server.uri()), platform(Arc::new(MemoryStore::new())))
            .unwrap();
        wait_ready(&engine).await;

        engine.set_source("marketing-site");
        engine.capture().page_visit(&PageView {
            title: "Home".into(),
            url: "https://example.com/".into(),
            path: "/".into(),
            referrer: None,
            language: None,
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: Vec<serde_json::Value> = requests[0].body_json().unwrap();
        assert_eq!(body[0]["context"]["source"], "marketing-site");
        assert_eq!(body[0]["event_name"], "page_visit");
        assert_eq!(engine.interaction_history().len(), 1);
    }
}
