use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Snapshot of the upstream registration/consent shared state.
#[derive(Debug, Clone, Default)]
pub struct SharedConsentState {
    /// Whether a consent provider is registered at all.
    pub provider_registered: bool,
    /// The provider's published collect value, once it has one.
    pub collect_value: Option<String>,
}

/// Source of the upstream shared state. Returns `None` while the
/// upstream registry itself is still unknown.
pub trait SharedStateSource: Send + Sync {
    fn registration_state(&self) -> Option<SharedConsentState>;
}

/// Cached gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    Allowed,
    /// Upstream unknown or provider registered without a published
    /// value yet. Deny, but nothing has been revoked.
    Pending,
    /// Explicit opt-out or an unrecognized published value.
    Denied,
}

impl ConsentDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Synchronous allow/deny gate over cached upstream consent state.
///
/// The cache is refreshed only by explicit `refresh()` calls driven by
/// external state-change notifications, never polled on a timer. All
/// reads go through one lock so a concurrent refresh is never observed
/// mid-update.
pub struct ConsentGate {
    source: Arc<dyn SharedStateSource>,
    cached: Mutex<ConsentDecision>,
}

impl ConsentGate {
    /// Creates the gate and evaluates the initial decision.
    pub fn new(source: Arc<dyn SharedStateSource>) -> Self {
        let initial = evaluate(source.registration_state());
        Self {
            source,
            cached: Mutex::new(initial),
        }
    }

    /// Re-evaluates the upstream state and returns the new decision.
    pub fn refresh(&self) -> ConsentDecision {
        let decision = evaluate(self.source.registration_state());
        let mut cached = self.cached.lock();
        if *cached != decision {
            info!(?decision, "consent decision changed");
        }
        *cached = decision;
        decision
    }

    /// Current cached decision without touching the upstream source.
    pub fn decision(&self) -> ConsentDecision {
        *self.cached.lock()
    }

    pub fn is_allowed(&self) -> bool {
        self.decision().is_allowed()
    }
}

/// Decision table, evaluated in order:
/// 1. upstream unknown => deny (fail closed, waiting for init)
/// 2. no provider registered => allow (no opt-in system present)
/// 3. provider registered, no value yet => deny (assume pending)
/// 4. "yes"/"y" => allow; "no"/"n", "pending"/"p", anything else => deny
fn evaluate(state: Option<SharedConsentState>) -> ConsentDecision {
    let Some(state) = state else {
        debug!("upstream state unknown, failing closed");
        return ConsentDecision::Pending;
    };

    if !state.provider_registered {
        return ConsentDecision::Allowed;
    }

    let Some(value) = state.collect_value else {
        return ConsentDecision::Pending;
    };

    match value.to_ascii_lowercase().as_str() {
        "y" | "yes" => ConsentDecision::Allowed,
        "n" | "no" => ConsentDecision::Denied,
        "p" | "pending" => ConsentDecision::Pending,
        other => {
            debug!(value = other, "unrecognized consent value, denying");
            ConsentDecision::Pending
        }
    }
}

/// In-process state source for the default wiring and tests. The host
/// integration replaces the held snapshot as its own state changes.
#[derive(Default)]
pub struct StaticStateSource {
    state: Mutex<Option<SharedConsentState>>,
}

impl StaticStateSource {
    /// Starts with the upstream entirely unknown.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Starts with no consent provider registered.
    pub fn unregistered() -> Self {
        Self {
            state: Mutex::new(Some(SharedConsentState::default())),
        }
    }

    pub fn set(&self, state: Option<SharedConsentState>) {
        *self.state.lock() = state;
    }

    pub fn set_collect_value(&self, value: &str) {
        *self.state.lock() = Some(SharedConsentState {
            provider_registered: true,
            collect_value: Some(value.to_string()),
        });
    }
}

impl SharedStateSource for StaticStateSource {
    fn registration_state(&self) -> Option<SharedConsentState> {
        self.state.lock().clone()
    }
}
