//! Per-request bookkeeping.
//!
//! Requests live in a sliding window of `2W` reusable slots indexed by
//! `request % 2W`. Completion counters are atomic because the common path
//! is a lock-free increment-and-compare against a node total fixed at
//! pipeline finalization; only the outstanding-fence list needs a mutex.

use crate::error::{Result, SchedError};
use crate::fence::Fence;
use crate::ids::FenceId;
use crate::types::CaptureRequest;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

const VACANT: u64 = u64::MAX;

/// Node participation totals, captured once at pipeline finalization and
/// never mutated afterwards.
#[derive(Debug, Clone, Copy)]
pub struct NodeTotals {
    /// Nodes in the pipeline; each reports request-done exactly once.
    pub total: usize,
    /// Nodes reporting final metadata.
    pub metadata: usize,
    /// Nodes reporting partial (early) metadata.
    pub partial: usize,
    /// Nodes participating in stream configuration.
    pub config: usize,
    /// Nodes producing output buffers.
    pub buffers: usize,
}

/// State for one request slot. Reset exactly once when the slot is
/// claimed for a new request.
pub struct PerRequestInfo {
    request: AtomicU64,
    active: AtomicBool,
    error: AtomicBool,
    nodes_done: AtomicUsize,
    metadata_done: AtomicUsize,
    partial_done: AtomicUsize,
    config_done: AtomicUsize,
    buffers_done: AtomicUsize,
    metadata_fired: AtomicBool,
    partial_fired: AtomicBool,
    config_fired: AtomicBool,
    buffers_fired: AtomicBool,
    completion_fired: AtomicBool,
    fences: Mutex<Vec<Fence>>,
    descriptor: Mutex<Option<CaptureRequest>>,
}

impl PerRequestInfo {
    pub fn new() -> Self {
        Self {
            request: AtomicU64::new(VACANT),
            active: AtomicBool::new(false),
            error: AtomicBool::new(false),
            nodes_done: AtomicUsize::new(0),
            metadata_done: AtomicUsize::new(0),
            partial_done: AtomicUsize::new(0),
            config_done: AtomicUsize::new(0),
            buffers_done: AtomicUsize::new(0),
            metadata_fired: AtomicBool::new(false),
            partial_fired: AtomicBool::new(false),
            config_fired: AtomicBool::new(false),
            buffers_fired: AtomicBool::new(false),
            completion_fired: AtomicBool::new(false),
            fences: Mutex::new(Vec::new()),
            descriptor: Mutex::new(None),
        }
    }

    /// Claim the slot for `request`, resetting every counter. Fails with
    /// `SlotBusy` while the previous occupant has not fully retired.
    pub fn claim(&self, request: u64, descriptor: CaptureRequest) -> Result<()> {
        if self.active.load(Ordering::Acquire) {
            return Err(SchedError::SlotBusy {
                request,
                occupant: self.request.load(Ordering::Acquire),
            });
        }
        self.request.store(request, Ordering::Release);
        self.error.store(false, Ordering::Release);
        self.nodes_done.store(0, Ordering::Release);
        self.metadata_done.store(0, Ordering::Release);
        self.partial_done.store(0, Ordering::Release);
        self.config_done.store(0, Ordering::Release);
        self.buffers_done.store(0, Ordering::Release);
        self.metadata_fired.store(false, Ordering::Release);
        self.partial_fired.store(false, Ordering::Release);
        self.config_fired.store(false, Ordering::Release);
        self.buffers_fired.store(false, Ordering::Release);
        self.completion_fired.store(false, Ordering::Release);
        *self.descriptor.lock().expect("slot poisoned") = Some(descriptor);
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Release the slot after every node reported done. Clears the fence
    /// list exactly once per occupancy.
    pub fn retire(&self) {
        self.fences.lock().expect("slot poisoned").clear();
        *self.descriptor.lock().expect("slot poisoned") = None;
        self.active.store(false, Ordering::Release);
    }

    pub fn occupied_by(&self, request: u64) -> bool {
        self.active.load(Ordering::Acquire) && self.request.load(Ordering::Acquire) == request
    }

    /// The in-flight occupant, if any.
    pub fn occupant(&self) -> Option<u64> {
        if self.active.load(Ordering::Acquire) {
            Some(self.request.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn mark_error(&self) {
        self.error.store(true, Ordering::Release);
    }

    pub fn is_errored(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub fn descriptor(&self) -> Option<CaptureRequest> {
        self.descriptor.lock().expect("slot poisoned").clone()
    }

    pub fn config_fired(&self) -> bool {
        self.config_fired.load(Ordering::Acquire)
    }

    // Completion counters. Each returns true exactly once: when the
    // counter reaches the pipeline total for the first time.

    pub fn note_request_done(&self, total: usize) -> bool {
        let count = self.nodes_done.fetch_add(1, Ordering::AcqRel) + 1;
        count == total && !self.completion_fired.swap(true, Ordering::AcqRel)
    }

    pub fn note_metadata_done(&self, total: usize) -> bool {
        let count = self.metadata_done.fetch_add(1, Ordering::AcqRel) + 1;
        count == total && !self.metadata_fired.swap(true, Ordering::AcqRel)
    }

    pub fn note_partial_metadata_done(&self, total: usize) -> bool {
        let count = self.partial_done.fetch_add(1, Ordering::AcqRel) + 1;
        count == total && !self.partial_fired.swap(true, Ordering::AcqRel)
    }

    pub fn note_config_done(&self, total: usize) -> bool {
        let count = self.config_done.fetch_add(1, Ordering::AcqRel) + 1;
        count == total && !self.config_fired.swap(true, Ordering::AcqRel)
    }

    pub fn note_buffer_done(&self, total: usize) -> bool {
        let count = self.buffers_done.fetch_add(1, Ordering::AcqRel) + 1;
        count == total && !self.buffers_fired.swap(true, Ordering::AcqRel)
    }

    // Outstanding fences, walked by flush.

    pub fn add_fence(&self, fence: Fence) {
        self.fences.lock().expect("slot poisoned").push(fence);
    }

    pub fn remove_fence(&self, id: FenceId) {
        self.fences
            .lock()
            .expect("slot poisoned")
            .retain(|f| f.id() != id);
    }

    pub fn outstanding_fences(&self) -> Vec<Fence> {
        self.fences.lock().expect("slot poisoned").clone()
    }
}

impl Default for PerRequestInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the highest request id below which every request has fully
/// completed, even though individual requests may finish out of order.
/// Flush waits on this single scalar instead of enumerating slots.
pub struct CompletionTracker {
    last_in_order: u64,
    parked: BTreeSet<u64>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self {
            last_in_order: 0,
            parked: BTreeSet::new(),
        }
    }

    pub fn complete(&mut self, request: u64) {
        if request == self.last_in_order + 1 {
            self.last_in_order = request;
            while self.parked.remove(&(self.last_in_order + 1)) {
                self.last_in_order += 1;
            }
        } else {
            self.parked.insert(request);
        }
    }

    pub fn last_in_order(&self) -> u64 {
        self.last_in_order
    }
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}
