//! Ducking coordinator — lowers competing audio while speech is sounding.
//!
//! Resources register once and are ducked/restored as a set. Both operations
//! are idempotent and atomic per transition: starting speech while already
//! ducked never compounds the attenuation, and restoring twice never
//! overwrites a user volume change made in between.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Attenuation applied to background music while speech is active.
pub const MUSIC_DUCK_FACTOR: f32 = 0.35;

/// Attenuation applied to ambient beds while speech is active.
pub const AMBIENT_DUCK_FACTOR: f32 = 0.6;

// ── Resource trait ─────────────────────────────────────────────────

/// An audio resource that can be attenuated while speech plays.
///
/// Implementations are expected to be cheap to query — the coordinator
/// reads `volume` and `is_active` under its own lock on every transition.
#[cfg_attr(test, mockall::automock)]
pub trait DuckableResource: Send + Sync {
    /// Stable identifier, used to key the saved pre-duck volume.
    fn id(&self) -> String;

    /// Current volume, `[0, 1]`.
    fn volume(&self) -> f32;

    /// Apply a new volume, `[0, 1]`.
    fn set_volume(&self, volume: f32);

    /// Whether the resource is currently producing sound. Inactive
    /// resources are left untouched.
    fn is_active(&self) -> bool;

    /// Multiplier applied to the saved volume while ducked.
    fn duck_factor(&self) -> f32;

    /// Whether this resource participates in ducking at all.
    fn supports_ducking(&self) -> bool {
        true
    }
}

// ── Coordinator ────────────────────────────────────────────────────

struct DuckingState {
    resources: Vec<Arc<dyn DuckableResource>>,

    /// Pre-duck volume per resource id. Non-empty iff currently ducked.
    ducked: HashMap<String, f32>,
}

/// Coordinates attenuation of registered resources around speech.
pub struct DuckingCoordinator {
    state: Mutex<DuckingState>,
}

impl Default for DuckingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl DuckingCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DuckingState {
                resources: Vec::new(),
                ducked: HashMap::new(),
            }),
        }
    }

    /// Register a resource for ducking. Registration while speech is
    /// already sounding takes effect on the next transition.
    pub fn register(&self, resource: Arc<dyn DuckableResource>) {
        let mut state = self.state.lock().unwrap();
        tracing::debug!(id = %resource.id(), "ducking resource registered");
        state.resources.push(resource);
    }

    /// Attenuate every active, duckable resource. Idempotent — resources
    /// already ducked keep their saved volume and are not re-attenuated.
    pub fn duck_all(&self) {
        let mut state = self.state.lock().unwrap();

        // Split-borrow the two fields so saved volumes can be recorded
        // while iterating the resource list.
        let DuckingState {
            ref resources,
            ref mut ducked,
        } = *state;

        for resource in resources {
            let id = resource.id();
            if !resource.supports_ducking() || !resource.is_active() || ducked.contains_key(&id) {
                continue;
            }

            let original = resource.volume();
            let target = (original * resource.duck_factor()).clamp(0.0, 1.0);
            tracing::debug!(id = %id, original, target, "ducking resource");
            resource.set_volume(target);
            ducked.insert(id, original);
        }
    }

    /// Restore every ducked resource to its saved volume. Idempotent — a
    /// second call finds nothing saved and does nothing.
    pub fn restore_all(&self) {
        let mut state = self.state.lock().unwrap();

        let DuckingState {
            ref resources,
            ref mut ducked,
        } = *state;

        for resource in resources {
            let id = resource.id();
            if let Some(original) = ducked.remove(&id) {
                tracing::debug!(id = %id, original, "restoring ducked resource");
                resource.set_volume(original);
            }
        }
        ducked.clear();
    }

    /// Drive ducking from `is_speaking` transitions.
    ///
    /// Holds only a weak reference so dropping the coordinator ends the
    /// task. Must be called from within a tokio runtime.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        mut speaking_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            while speaking_rx.changed().await.is_ok() {
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                let speaking = *speaking_rx.borrow_and_update();
                if speaking {
                    coordinator.duck_all();
                } else {
                    coordinator.restore_all();
                }
            }
        })
    }
}
