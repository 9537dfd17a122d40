//! Auto-instrumented event capture: page visits, clicks, and form lifecycle.
//!
//! The capture layer is platform-independent: a platform adapter observes
//! page changes, clicks, and form interactions however it likes and hands in
//! the snapshot types defined here. Each flow is consent-gated before any
//! enrichment work happens.

use crate::consent::{ConsentCategory, ConsentGate};
use crate::device::DeviceIdResolver;
use crate::events::{EventContext, EventRecord};
use crate::geo::GeoResolver;
use crate::identity::IdentityHandle;
use crate::queue::EventSink;
use crate::session::SessionManager;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// At most one captured click per this window, bounding event volume under
/// rapid or synthetic click storms.
const CLICK_THROTTLE: Duration = Duration::from_millis(300);

/// Bound on the per-element hierarchy memoization before eviction.
const HIERARCHY_CACHE_MAX: usize = 256;

/// Bound on the diagnostic interaction history.
const MAX_HISTORY_LEN: usize = 20;

/// Snapshot of the current page.
#[derive(Debug, Clone, Default)]
pub struct PageView {
    pub title: String,
    pub url: String,
    pub path: String,
    pub referrer: Option<String>,
    pub language: Option<String>,
}

/// A captured element, identified by a stable platform-assigned handle.
#[derive(Debug, Clone)]
pub struct ElementInfo {
    /// Stable identity for the element, used as the hierarchy cache key.
    pub handle: u64,
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub text: Option<String>,
    pub href: Option<String>,
    pub aria_label: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ElementPosition {
    pub left: f64,
    pub top: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// A click observed by the platform adapter.
#[derive(Debug, Clone)]
pub struct ClickEvent {
    pub page: PageView,
    pub target: ElementInfo,
    /// Ancestor chain from the target's parent up to the root.
    pub ancestors: Vec<ElementInfo>,
    pub position: Option<ElementPosition>,
    pub viewport: Option<Viewport>,
}

/// A form observed by the platform adapter, identified by a stable key.
#[derive(Debug, Clone)]
pub struct FormDescriptor {
    pub key: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub action: Option<String>,
    /// Trackable fields only: button/submit/reset controls excluded.
    pub total_fields: usize,
}

/// One entry of the bounded diagnostic history. Never transmitted.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub kind: String,
    pub details: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

struct FormState {
    descriptor: FormDescriptor,
    started: Instant,
    filled: HashSet<String>,
    submitted: bool,
}

/// Builds enriched event records from platform snapshots and hands them to
/// the delivery queue.
pub struct EventCapture {
    consent: Arc<ConsentGate>,
    identity: Arc<IdentityHandle>,
    device: Arc<DeviceIdResolver>,
    session: Arc<SessionManager>,
    geo: Arc<GeoResolver>,
    sink: Arc<dyn EventSink>,
    source: Arc<RwLock<String>>,
    track_clicks: bool,
    track_forms: bool,
    hierarchy_cache: Mutex<HashMap<u64, String>>,
    forms: Mutex<HashMap<String, FormState>>,
    last_click: Mutex<Option<Instant>>,
    history: Mutex<VecDeque<Interaction>>,
    next_sequence: Mutex<u64>,
}

impl EventCapture {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        consent: Arc<ConsentGate>,
        identity: Arc<IdentityHandle>,
        device: Arc<DeviceIdResolver>,
        session: Arc<SessionManager>,
        geo: Arc<GeoResolver>,
        sink: Arc<dyn EventSink>,
        source: Arc<RwLock<String>>,
        track_clicks: bool,
        track_forms: bool,
    ) -> Self {
        Self {
            consent,
            identity,
            device,
            session,
            geo,
            sink,
            source,
            track_clicks,
            track_forms,
            hierarchy_cache: Mutex::new(HashMap::new()),
            forms: Mutex::new(HashMap::new()),
            last_click: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            next_sequence: Mutex::new(0),
        }
    }

    /// Capture a page visit. Invoked for initial loads, back/forward
    /// navigation, and programmatic history navigation alike, so single-page
    /// transitions track identically to full loads.
    pub fn page_visit(&self, view: &PageView) {
        if !self.consent.is_allowed(ConsentCategory::Functional) {
            return;
        }

        let mut properties = Map::new();
        properties.insert("page_title".into(), Value::String(view.title.clone()));
        properties.insert("page_url".into(), Value::String(view.url.clone()));
        properties.insert("page_path".into(), Value::String(view.path.clone()));
        properties.insert("page_referrer".into(), opt_string(&view.referrer));
        properties.insert("language".into(), opt_string(&view.language));

        let geo = self.geo.current().unwrap_or_default();
        properties.insert("ip_address".into(), opt_string(&geo.ip));
        properties.insert("city".into(), opt_string(&geo.city));
        properties.insert("region".into(), opt_string(&geo.region));
        properties.insert("country".into(), opt_string(&geo.country));
        properties.insert("postal".into(), opt_string(&geo.postal));
        properties.insert("loc".into(), opt_string(&geo.loc));
        properties.insert("timezone".into(), opt_string(&geo.timezone));

        self.attach_utm(&view.url, &mut properties);
        self.emit("page_visit", properties);
    }

    /// Capture a click, throttled to one per 300ms. No-op unless click
    /// tracking was enabled at construction.
    pub fn click(&self, event: &ClickEvent) {
        if !self.track_clicks || !self.consent.is_allowed(ConsentCategory::Analytics) {
            return;
        }

        {
            let mut last_click = self.last_click.lock().expect("click lock poisoned");
            let now = Instant::now();
            if let Some(last) = *last_click {
                if now.duration_since(last) < CLICK_THROTTLE {
                    return;
                }
            }
            *last_click = Some(now);
        }

        let target = &event.target;
        let mut properties = Map::new();
        properties.insert("page_title".into(), Value::String(event.page.title.clone()));
        properties.insert("page_url".into(), Value::String(event.page.url.clone()));
        properties.insert("element_text".into(), opt_string(&target.text));
        properties.insert("element_tag".into(), Value::String(target.tag.clone()));
        properties.insert("element_id".into(), opt_string(&target.id));
        properties.insert("element_href".into(), opt_string(&target.href));
        properties.insert("element_aria_label".into(), opt_string(&target.aria_label));
        properties.insert(
            "element_class".into(),
            if target.classes.is_empty() {
                Value::Null
            } else {
                Value::String(target.classes.join(" "))
            },
        );
        properties.insert(
            "element_hierarchy".into(),
            Value::String(self.element_hierarchy(target, &event.ancestors)),
        );
        properties.insert(
            "element_selector".into(),
            Value::String(element_selector(target)),
        );
        properties.insert(
            "element_position_left".into(),
            event.position.map_or(Value::Null, |p| json_f64(p.left)),
        );
        properties.insert(
            "element_position_top".into(),
            event.position.map_or(Value::Null, |p| json_f64(p.top)),
        );
        properties.insert(
            "viewport_width".into(),
            event.viewport.map_or(Value::Null, |v| v.width.into()),
        );
        properties.insert(
            "viewport_height".into(),
            event.viewport.map_or(Value::Null, |v| v.height.into()),
        );
        properties.insert("referrer".into(), opt_string(&event.page.referrer));

        self.attach_utm(&event.page.url, &mut properties);
        self.emit("element_click", properties);
    }

    /// Record a field fill/unfill for a form. This only accumulates state;
    /// no event is emitted until submission or abandonment.
    pub fn form_input(&self, form: &FormDescriptor, field: &str, filled: bool) {
        if !self.track_forms {
            return;
        }
        let mut forms = self.forms.lock().expect("form state lock poisoned");
        let state = forms
            .entry(form.key.clone())
            .or_insert_with(|| FormState {
                descriptor: form.clone(),
                started: Instant::now(),
                filled: HashSet::new(),
                submitted: false,
            });
        state.descriptor = form.clone();
        if filled {
            state.filled.insert(field.to_string());
        } else {
            state.filled.remove(field);
        }
    }

    /// Capture a form submission.
    pub fn form_submitted(&self, page: &PageView, form: &FormDescriptor) {
        if !self.track_forms || !self.consent.is_allowed(ConsentCategory::Analytics) {
            return;
        }

        let properties = {
            let mut forms = self.forms.lock().expect("form state lock poisoned");
            match forms.get_mut(&form.key) {
                Some(state) => {
                    let properties = form_properties(page, form, Some(state));
                    state.submitted = true;
                    properties
                }
                None => form_properties(page, form, None),
            }
        };
        self.emit("form_submit", properties);
    }

    /// Page visibility transitioned to hidden: every form with nonzero
    /// filled fields and no submission yet is captured as abandoned.
    pub fn page_hidden(&self, page: &PageView) {
        if !self.track_forms || !self.consent.is_allowed(ConsentCategory::Analytics) {
            return;
        }

        let abandoned: Vec<Map<String, Value>> = {
            let forms = self.forms.lock().expect("form state lock poisoned");
            forms
                .values()
                .filter(|state| !state.submitted && !state.filled.is_empty())
                .map(|state| form_properties(page, &state.descriptor, Some(state)))
                .collect()
        };

        for properties in abandoned {
            self.emit("form_abandoned", properties);
        }
    }

    /// Snapshot of the bounded diagnostic history.
    pub fn interaction_history(&self) -> Vec<Interaction> {
        self.history
            .lock()
            .expect("history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Enrich with identity/session/context fields, queue, and record in the
    /// local history.
    fn emit(&self, event_name: &str, properties: Map<String, Value>) {
        // Validate the session first, then refresh activity (debounced).
        let session_id = self.session.session_id();
        self.session.touch();

        let user_id = self.identity.current_user_id();
        let group_id = self.identity.current_group_id();
        let source = self.source.read().expect("source lock poisoned").clone();

        let record = EventRecord {
            event_name: event_name.to_string(),
            user_id,
            timestamp: Utc::now(),
            properties: properties.clone(),
            context: EventContext {
                group_id: Some(group_id),
                device_id: self.device.device_id(),
                session_id: Some(session_id),
                source: Some(source),
            },
        };

        self.push_history(event_name, properties);
        self.sink.submit(vec![record]);
    }

    fn push_history(&self, kind: &str, details: Map<String, Value>) {
        let sequence = {
            let mut next = self.next_sequence.lock().expect("sequence lock poisoned");
            *next += 1;
            *next
        };
        let mut history = self.history.lock().expect("history lock poisoned");
        history.push_back(Interaction {
            kind: kind.to_string(),
            details,
            timestamp: Utc::now(),
            sequence,
        });
        if history.len() > MAX_HISTORY_LEN {
            history.pop_front();
        }
    }

    /// UTM parameters, attached only under marketing consent.
    fn attach_utm(&self, url: &str, properties: &mut Map<String, Value>) {
        if !self.consent.is_allowed(ConsentCategory::Marketing) {
            return;
        }
        let params = utm_parameters(url);
        for (key, value) in params {
            properties.insert(key, value);
        }
    }

    /// Ancestor-path string for the target, memoized per element handle with
    /// manual eviction.
    fn element_hierarchy(&self, target: &ElementInfo, ancestors: &[ElementInfo]) -> String {
        let mut cache = self.hierarchy_cache.lock().expect("hierarchy lock poisoned");
        if let Some(cached) = cache.get(&target.handle) {
            return cached.clone();
        }

        let mut path: Vec<String> = ancestors.iter().rev().map(element_selector).collect();
        path.push(element_selector(target));
        let hierarchy = path.join(" > ");

        if cache.len() >= HIERARCHY_CACHE_MAX {
            cache.clear();
        }
        cache.insert(target.handle, hierarchy.clone());
        hierarchy
    }
}

/// CSS-selector-like string: `TAG#id.class1.class2`.
fn element_selector(element: &ElementInfo) -> String {
    let id = element
        .id
        .as_deref()
        .map(|id| format!("#{id}"))
        .unwrap_or_default();
    let classes = if element.classes.is_empty() {
        String::new()
    } else {
        format!(".{}", element.classes.join("."))
    };
    format!("{}{}{}", element.tag, id, classes)
}

/// The five standard UTM parameters, each null when absent from the query.
fn utm_parameters(url: &str) -> Vec<(String, Value)> {
    const UTM_KEYS: [&str; 5] = [
        "utm_campaign",
        "utm_medium",
        "utm_source",
        "utm_term",
        "utm_content",
    ];

    let parsed = reqwest::Url::parse(url).ok();
    UTM_KEYS
        .iter()
        .map(|key| {
            let value = parsed.as_ref().and_then(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.into_owned())
            });
            (
                (*key).to_string(),
                value.map_or(Value::Null, Value::String),
            )
        })
        .collect()
}

fn form_properties(
    page: &PageView,
    form: &FormDescriptor,
    state: Option<&FormState>,
) -> Map<String, Value> {
    let filled = state.map_or(0, |s| s.filled.len());
    // Denominator floored at 1 to avoid division by zero.
    let completion =
        ((filled as f64 / form.total_fields.max(1) as f64) * 100.0).round() as u64;

    let mut properties = Map::new();
    properties.insert("page_title".into(), Value::String(page.title.clone()));
    properties.insert("page_url".into(), Value::String(page.url.clone()));
    properties.insert("form_id".into(), opt_string(&form.id));
    properties.insert("form_name".into(), opt_string(&form.name));
    properties.insert("form_action".into(), opt_string(&form.action));
    properties.insert("form_fields".into(), form.total_fields.into());
    properties.insert("form_completion".into(), completion.into());
    properties.insert(
        "interaction_time".into(),
        state.map_or(Value::Null, |s| {
            (s.started.elapsed().as_millis() as u64).into()
        }),
    );
    properties
}

fn opt_string(value: &Option<String>) -> Value {
    value.clone().map_or(Value::Null, Value::String)
}

fn json_f64(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}
