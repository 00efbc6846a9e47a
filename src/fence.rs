//! Signal-once completion fences.
//!
//! A [`Fence`] stands for a single asynchronous hardware or software
//! completion event. The producer (typically a driver completion callback)
//! signals it exactly once with a success or error outcome; any number of
//! waiters observe the shared state but may never signal it themselves.
//!
//! Fences are cheap cloneable handles over shared state so the scheduler
//! can consult the signaled flag at registration time without racing the
//! producer.

use crate::ids::FenceId;
use crate::types::FenceOutcome;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

const STATE_PENDING: u8 = 0;
const STATE_SUCCESS: u8 = 1;
const STATE_ERROR: u8 = 2;

struct FenceShared {
    id: FenceId,
    /// Request this fence was armed for. Used to clear the per-request
    /// fence list when the producer signals.
    request: u64,
    label: String,
    state: AtomicU8,
}

/// Cloneable handle to a single completion event.
#[derive(Clone)]
pub struct Fence {
    shared: Arc<FenceShared>,
}

impl Fence {
    pub fn id(&self) -> FenceId {
        self.shared.id
    }

    /// The request this fence was armed for.
    pub fn request(&self) -> u64 {
        self.shared.request
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Record the final outcome. Returns `false` (and leaves the original
    /// outcome in place) if the fence was already signaled.
    pub fn signal(&self, outcome: FenceOutcome) -> bool {
        let next = match outcome {
            FenceOutcome::Success => STATE_SUCCESS,
            FenceOutcome::Error => STATE_ERROR,
        };
        let swapped = self
            .shared
            .state
            .compare_exchange(STATE_PENDING, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !swapped {
            tracing::warn!(
                fence = %self.shared.id,
                label = %self.shared.label,
                "fence signaled more than once; keeping first outcome"
            );
        }
        swapped
    }

    /// Observed outcome, or `None` while the producer has not signaled.
    pub fn outcome(&self) -> Option<FenceOutcome> {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_SUCCESS => Some(FenceOutcome::Success),
            STATE_ERROR => Some(FenceOutcome::Error),
            _ => None,
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) != STATE_PENDING
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.shared.id)
            .field("request", &self.shared.request)
            .field("label", &self.shared.label)
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Hands out fences with pipeline-unique ids.
pub struct FenceRegistry {
    next: AtomicU32,
}

impl FenceRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
        }
    }

    /// Create an unsignaled fence armed for `request`.
    pub fn create(&self, request: u64, label: impl Into<String>) -> Fence {
        let id = FenceId(self.next.fetch_add(1, Ordering::Relaxed));
        Fence {
            shared: Arc::new(FenceShared {
                id,
                request,
                label: label.into(),
                state: AtomicU8::new(STATE_PENDING),
            }),
        }
    }
}

impl Default for FenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
