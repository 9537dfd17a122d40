//! Consent and do-not-track gating.
//!
//! Two layers, evaluated in order on every capture decision: the browser/UA
//! do-not-track signal first, then the three-category consent model. The
//! result is never cached — consent can change mid-session.

use std::sync::Mutex;
use tracing::warn;

/// Platform-provided do-not-track signal.
pub trait DoNotTrackSignal: Send + Sync {
    fn do_not_track(&self) -> bool;
}

/// A fixed do-not-track value, for platforms without the signal and for
/// tests.
pub struct StaticDnt(pub bool);

impl DoNotTrackSignal for StaticDnt {
    fn do_not_track(&self) -> bool {
        self.0
    }
}

/// Event classes gated by consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentCategory {
    /// Always permitted once the DNT gate passes.
    Functional,
    Analytics,
    Marketing,
}

#[derive(Debug, Clone)]
struct Categories {
    analytics: bool,
    marketing: bool,
}

/// Decides whether an event class may be captured.
pub struct ConsentGate {
    respect_do_not_track: bool,
    enable_consent: bool,
    dnt: Box<dyn DoNotTrackSignal>,
    categories: Mutex<Categories>,
}

impl ConsentGate {
    /// `default_consent` seeds the analytics and marketing categories;
    /// functional consent is implicit and cannot be revoked.
    pub fn new(
        respect_do_not_track: bool,
        enable_consent: bool,
        default_consent: bool,
        dnt: Box<dyn DoNotTrackSignal>,
    ) -> Self {
        Self {
            respect_do_not_track,
            enable_consent,
            dnt,
            categories: Mutex::new(Categories {
                analytics: default_consent,
                marketing: default_consent,
            }),
        }
    }

    /// Global gate: false when the engine respects do-not-track and the
    /// platform signals it.
    pub fn should_track(&self) -> bool {
        if self.respect_do_not_track && self.dnt.do_not_track() {
            warn!("do-not-track is enabled; tracking is disabled");
            return false;
        }
        true
    }

    /// Category gate: DNT first, then the stored consent when consent mode
    /// is enabled. With consent mode disabled, any category passes once the
    /// DNT gate does.
    pub fn is_allowed(&self, category: ConsentCategory) -> bool {
        if !self.should_track() {
            return false;
        }
        if !self.enable_consent {
            return true;
        }
        let categories = self.categories.lock().expect("consent lock poisoned");
        match category {
            ConsentCategory::Functional => true,
            ConsentCategory::Analytics => categories.analytics,
            ConsentCategory::Marketing => categories.marketing,
        }
    }

    /// Update consent for a category. Functional consent is always granted
    /// and attempts to change it are ignored.
    pub fn set_consent(&self, category: ConsentCategory, granted: bool) {
        let mut categories = self.categories.lock().expect("consent lock poisoned");
        match category {
            ConsentCategory::Functional => {}
            ConsentCategory::Analytics => categories.analytics = granted,
            ConsentCategory::Marketing => categories.marketing = granted,
        }
    }
}
