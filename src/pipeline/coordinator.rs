//! Pipeline coordinator — slot ownership, completion aggregation, flush.
//!
//! The coordinator owns the per-request slot array, counts completion
//! signals from every node, and emits exactly one metadata event and one
//! completion event per request, on the success or the error path but
//! never both. It also wires the deferred queue to the worker pool:
//! producers call [`Pipeline::on_fence_signaled`] / property writes land
//! through [`Pipeline::write_property`], and any units those resolve are
//! handed to the workers.

use crate::config::PipelineConfig;
use crate::error::{Result, SchedError};
use crate::fence::{Fence, FenceRegistry};
use crate::ids::NodeId;
use crate::metadata::{MetadataPool, PropertyId, PropertyPool, PropertyValue};
use crate::pipeline::bridge::{PipelineBridge, ResultEvent};
use crate::pipeline::node::{AnyNode, BuiltinNode, StageContext, StageResult};
use crate::pipeline::nodes::{AfNode, IspNode, SensorNode, StatsNode};
use crate::pipeline::request::{CompletionTracker, NodeTotals, PerRequestInfo};
use crate::scheduler::{DeferredQueue, Job, RegisterOutcome, Stage, WorkerPool};
use crate::types::{CaptureRequest, FenceOutcome};
use crossbeam_channel::{bounded, unbounded, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// First request id handed out by [`Pipeline::submit`].
pub const FIRST_REQUEST_ID: u64 = 1;

struct NodeSlot {
    id: NodeId,
    name: String,
    node: Mutex<AnyNode>,
}

/// Builder for assembling a pipeline before finalization.
pub struct PipelineBuilder {
    config: PipelineConfig,
    nodes: Vec<AnyNode>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
        }
    }

    pub fn add_node(mut self, node: AnyNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add the standard sensor → ISP → stats → autofocus topology.
    pub fn with_default_nodes(self) -> Self {
        let stripe = self.config.stripe;
        self.add_node(AnyNode::Builtin(BuiltinNode::Sensor(SensorNode::new())))
            .add_node(AnyNode::Builtin(BuiltinNode::Isp(IspNode::new(stripe))))
            .add_node(AnyNode::Builtin(BuiltinNode::Stats(StatsNode::new())))
            .add_node(AnyNode::Builtin(BuiltinNode::Autofocus(AfNode::new())))
    }

    /// Freeze the topology, capture the node totals, and start the worker
    /// pool. The totals are immutable from here on; nodes cannot be added
    /// to a finalized pipeline.
    pub fn finalize(self) -> Result<(Arc<Pipeline>, PipelineBridge)> {
        self.config.validate()?;
        if self.nodes.is_empty() {
            return Err(SchedError::Config("pipeline has no nodes".into()));
        }

        let totals = NodeTotals {
            total: self.nodes.len(),
            metadata: self.nodes.iter().filter(|n| n.produces_metadata()).count(),
            partial: self
                .nodes
                .iter()
                .filter(|n| n.produces_partial_metadata())
                .count(),
            config: self.nodes.iter().filter(|n| n.reports_config()).count(),
            buffers: self.nodes.iter().filter(|n| n.produces_buffers()).count(),
        };

        let window = self.config.queue_depth;
        let slot_count = window * 2;
        let (msg_tx, msg_rx) = bounded(self.config.result_capacity);
        let (job_tx, job_rx) = unbounded();

        let nodes = self
            .nodes
            .into_iter()
            .enumerate()
            .map(|(i, node)| NodeSlot {
                id: NodeId(i as u32),
                name: node.name().to_string(),
                node: Mutex::new(node),
            })
            .collect::<Vec<_>>();

        tracing::info!(
            nodes = nodes.len(),
            window,
            workers = self.config.worker_threads,
            "finalizing pipeline"
        );

        let pipeline = Arc::new(Pipeline {
            nodes,
            totals,
            slots: (0..slot_count).map(|_| PerRequestInfo::new()).collect(),
            pool: MetadataPool::new(window),
            fences: FenceRegistry::new(),
            queue: DeferredQueue::new(window),
            job_tx: Mutex::new(Some(job_tx)),
            workers: Mutex::new(None),
            msg_tx,
            next_request: Mutex::new(FIRST_REQUEST_ID),
            last_submitted: AtomicU64::new(0),
            completion: Mutex::new(CompletionTracker::new()),
            done_cv: Condvar::new(),
            config_lock: Mutex::new(()),
            config_cv: Condvar::new(),
            config: self.config,
        });

        let weak = Arc::downgrade(&pipeline);
        let workers = WorkerPool::spawn(pipeline.config.worker_threads, job_rx, move |job| {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.execute(job);
            }
        });
        *pipeline.workers.lock().expect("worker slot poisoned") = Some(workers);

        Ok((pipeline, PipelineBridge::new(msg_rx)))
    }
}

/// The per-pipeline request coordinator.
pub struct Pipeline {
    config: PipelineConfig,
    nodes: Vec<NodeSlot>,
    totals: NodeTotals,
    slots: Vec<PerRequestInfo>,
    pool: MetadataPool,
    fences: FenceRegistry,
    queue: DeferredQueue,
    job_tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Option<WorkerPool>>,
    msg_tx: Sender<ResultEvent>,
    next_request: Mutex<u64>,
    last_submitted: AtomicU64,
    completion: Mutex<CompletionTracker>,
    done_cv: Condvar,
    config_lock: Mutex<()>,
    config_cv: Condvar,
}

impl Pipeline {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn node_totals(&self) -> NodeTotals {
        self.totals
    }

    fn slot(&self, request: u64) -> &PerRequestInfo {
        &self.slots[(request % self.slots.len() as u64) as usize]
    }

    // ── Submission ──

    /// Submit a capture request. Returns the assigned frame number, or
    /// `SlotBusy` when the request `2W` back has not fully retired.
    pub fn submit(&self, descriptor: CaptureRequest) -> Result<u64> {
        let mut next = self.next_request.lock().expect("submit lock poisoned");
        let request = *next;
        self.slot(request).claim(request, descriptor)?;
        // The reclaimed slot's previous occupant left the window long
        // ago; drop its metadata exactly once.
        if let Some(old) = request.checked_sub(self.slots.len() as u64) {
            if old >= FIRST_REQUEST_ID {
                self.pool.purge(old);
            }
        }
        *next = request + 1;
        self.last_submitted.store(request, Ordering::SeqCst);
        drop(next);

        tracing::debug!(request, "request submitted");
        let jobs = self
            .nodes
            .iter()
            .map(|n| Job {
                node: n.id,
                request,
                stage: Stage::INITIAL,
                error_path: false,
            })
            .collect::<Vec<_>>();
        self.enqueue(jobs);
        Ok(request)
    }

    pub fn last_submitted(&self) -> u64 {
        self.last_submitted.load(Ordering::SeqCst)
    }

    // ── Dependency resolution entry points ──

    /// Called by the fence producer exactly once per fence. An error
    /// outcome marks the fence's request errored; waiters then resolve
    /// through the error path instead of normal re-invocation.
    pub fn on_fence_signaled(&self, fence: &Fence, outcome: FenceOutcome) {
        if !fence.signal(outcome) {
            return; // duplicate signal, first outcome already handled
        }
        let request = fence.request();
        let slot = self.slot(request);
        if slot.occupied_by(request) {
            slot.remove_fence(fence.id());
        }
        if outcome == FenceOutcome::Error {
            tracing::warn!(request, fence = %fence.id(), label = fence.label(), "fence error");
            self.mark_slot_error(request);
        }
        let resolution = self.queue.on_fence_signaled(fence.id(), outcome);
        for errored in &resolution.errored_requests {
            self.mark_slot_error(*errored);
        }
        self.enqueue(resolution.jobs);
    }

    /// Write a property and wake anything waiting on it. Producers write
    /// at most once per (property, request).
    pub fn write_property(
        &self,
        pool: PropertyPool,
        id: PropertyId,
        request: u64,
        value: PropertyValue,
    ) -> Result<()> {
        self.pool.write(pool, id, request, value)?;
        let jobs = self.queue.on_property_written(pool, id, request);
        self.enqueue(jobs);
        Ok(())
    }

    /// Non-blocking property read; `None` when unwritten or recycled.
    pub fn read_property(
        &self,
        pool: PropertyPool,
        id: PropertyId,
        request: u64,
        offset: u64,
    ) -> Result<Option<PropertyValue>> {
        self.pool.read(pool, id, request, offset)
    }

    pub(crate) fn create_fence(&self, request: u64, label: &str) -> Fence {
        let fence = self.fences.create(request, label);
        let slot = self.slot(request);
        if slot.occupied_by(request) {
            slot.add_fence(fence.clone());
        }
        let _ = self.msg_tx.send(ResultEvent::FenceArmed {
            request,
            label: label.to_string(),
            fence: fence.clone(),
        });
        fence
    }

    pub(crate) fn request_descriptor(&self, request: u64) -> Option<CaptureRequest> {
        let slot = self.slot(request);
        if slot.occupied_by(request) {
            slot.descriptor()
        } else {
            None
        }
    }

    // ── Error handling ──

    /// Whether an earlier stage marked this request failed. Later stages
    /// use this to short-circuit into default/error output.
    pub fn request_in_error_state(&self, request: u64) -> bool {
        let slot = self.slot(request);
        slot.occupied_by(request) && slot.is_errored()
    }

    fn mark_slot_error(&self, request: u64) {
        let slot = self.slot(request);
        if slot.occupied_by(request) {
            slot.mark_error();
        }
    }

    /// Mark a request errored and force-resolve every dependency unit it
    /// still has registered, regardless of satisfaction.
    pub fn mark_request_error(&self, request: u64) {
        self.mark_slot_error(request);
        let jobs = self.queue.mark_request_error(request);
        self.enqueue(jobs);
    }

    // ── Completion aggregation ──

    pub(crate) fn notify_node_metadata_done(&self, request: u64) {
        let slot = self.slot(request);
        if !slot.occupied_by(request) {
            tracing::warn!(request, "metadata-done for retired request ignored");
            return;
        }
        if slot.note_metadata_done(self.totals.metadata) {
            let error = slot.is_errored();
            tracing::debug!(request, error, "metadata complete");
            let _ = self.msg_tx.send(ResultEvent::Metadata { request, error });
        }
    }

    pub(crate) fn notify_node_partial_metadata_done(&self, request: u64) {
        let slot = self.slot(request);
        if !slot.occupied_by(request) {
            return;
        }
        if slot.note_partial_metadata_done(self.totals.partial) {
            let _ = self.msg_tx.send(ResultEvent::PartialMetadata { request });
        }
    }

    pub(crate) fn notify_node_config_done(&self, request: u64) {
        let slot = self.slot(request);
        if !slot.occupied_by(request) {
            return;
        }
        if slot.note_config_done(self.totals.config) {
            let _ = self.msg_tx.send(ResultEvent::StreamConfigured { request });
            let _guard = self.config_lock.lock().expect("config lock poisoned");
            self.config_cv.notify_all();
        }
    }

    pub(crate) fn notify_node_buffer_done(&self, request: u64) {
        let slot = self.slot(request);
        if !slot.occupied_by(request) {
            return;
        }
        if slot.note_buffer_done(self.totals.buffers) {
            let error = slot.is_errored();
            let _ = self
                .msg_tx
                .send(ResultEvent::BuffersReady { request, error });
        }
    }

    fn notify_node_request_done(&self, node: NodeId, request: u64) {
        let slot = self.slot(request);
        if !slot.occupied_by(request) {
            tracing::warn!(request, node = %node, "request-done for retired request ignored");
            return;
        }
        if slot.note_request_done(self.totals.total) {
            let error = slot.is_errored();
            slot.retire();
            {
                let mut tracker = self.completion.lock().expect("completion poisoned");
                tracker.complete(request);
            }
            self.done_cv.notify_all();
            tracing::debug!(request, error, "request retired");
            let _ = self
                .msg_tx
                .send(ResultEvent::RequestComplete { request, error });
        }
    }

    /// True iff every submitted request has fully completed, in order.
    pub fn all_nodes_done(&self) -> bool {
        let tracker = self.completion.lock().expect("completion poisoned");
        self.last_submitted.load(Ordering::SeqCst) == tracker.last_in_order()
    }

    /// Block a non-worker thread until stream configuration completed for
    /// `request` (or the request retired). Returns false on timeout.
    pub fn wait_stream_config(&self, request: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.config_lock.lock().expect("config lock poisoned");
        loop {
            let slot = self.slot(request);
            if !slot.occupied_by(request) || slot.config_fired() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _) = self
                .config_cv
                .wait_timeout(guard, deadline - now)
                .expect("config lock poisoned");
            guard = g;
        }
    }

    // ── Flush ──

    /// Force every in-flight request onto the error path and wait for the
    /// pipeline to drain. Not itself an error: every outstanding request
    /// still reaches a well-defined terminal state with its exactly-once
    /// notifications delivered.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let in_flight: Vec<u64> = self.slots.iter().filter_map(|s| s.occupant()).collect();
        tracing::info!(requests = in_flight.len(), "flush started");
        for request in in_flight {
            let outstanding = self.slot(request).outstanding_fences();
            if !outstanding.is_empty() {
                tracing::debug!(
                    request,
                    fences = outstanding.len(),
                    "abandoning unsignaled fences"
                );
            }
            self.mark_request_error(request);
        }

        let deadline = Instant::now() + timeout;
        let mut tracker = self.completion.lock().expect("completion poisoned");
        while self.last_submitted.load(Ordering::SeqCst) != tracker.last_in_order() {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("flush timed out");
                return Err(SchedError::FlushTimeout(timeout));
            }
            let (t, _) = self
                .done_cv
                .wait_timeout(tracker, deadline - now)
                .expect("completion poisoned");
            tracker = t;
        }
        tracing::info!("flush complete");
        Ok(())
    }

    /// Stop the worker pool and close the result channel. Callers should
    /// flush first; stages still queued when the senders drop are lost.
    pub fn shutdown(&self) {
        let tx = self.job_tx.lock().expect("job sender poisoned").take();
        drop(tx);
        let workers = self.workers.lock().expect("worker slot poisoned").take();
        if let Some(pool) = workers {
            pool.join();
        }
        let _ = self.msg_tx.send(ResultEvent::Shutdown);
        tracing::info!("pipeline shut down");
    }

    // ── Stage execution ──

    fn enqueue(&self, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        let guard = self.job_tx.lock().expect("job sender poisoned");
        match guard.as_ref() {
            Some(tx) => {
                for job in jobs {
                    let _ = tx.send(job);
                }
            }
            None => tracing::warn!("dropping jobs after shutdown"),
        }
    }

    fn execute(self: &Arc<Self>, job: Job) {
        let slot = self.slot(job.request);
        if !slot.occupied_by(job.request) {
            tracing::trace!(request = job.request, "stale job dropped");
            return;
        }
        let errored = job.error_path || slot.is_errored();
        let node_slot = &self.nodes[job.node.index()];

        let outcome = {
            let mut node = node_slot.node.lock().expect("node poisoned");
            let mut ctx = StageContext::new(self, job.node, job.request, job.stage, errored);
            node.execute_stage(&mut ctx)
        };

        match outcome {
            Ok(StageResult::Complete) => {
                self.notify_node_request_done(job.node, job.request);
            }
            Ok(StageResult::Pending(unit)) => {
                let next_stage = unit.next_stage();
                match self.queue.register(job.node, job.request, unit, &self.pool) {
                    Ok(RegisterOutcome::Deferred) => {
                        // The request may have been failed while this
                        // stage was still running; force-resolve the unit
                        // we just parked so it cannot outlive the flush.
                        if slot.is_errored() {
                            let jobs = self.queue.mark_request_error(job.request);
                            self.enqueue(jobs);
                        }
                    }
                    Ok(RegisterOutcome::Ready(next)) => self.enqueue(vec![next]),
                    Ok(RegisterOutcome::Errored(next)) => {
                        self.mark_slot_error(job.request);
                        self.enqueue(vec![next]);
                    }
                    Err(e) => {
                        // Fatal to this unit: log, fail the request, and
                        // let the node finish on the error path.
                        tracing::error!(
                            node = %node_slot.name,
                            request = job.request,
                            error = %e,
                            "dependency registration failed"
                        );
                        self.mark_request_error(job.request);
                        self.enqueue(vec![Job {
                            node: job.node,
                            request: job.request,
                            stage: next_stage,
                            error_path: true,
                        }]);
                    }
                }
            }
            Err(e) if !errored => {
                tracing::warn!(
                    node = %node_slot.name,
                    request = job.request,
                    error = %e,
                    "stage failed; taking error path"
                );
                self.mark_request_error(job.request);
                self.enqueue(vec![Job {
                    node: job.node,
                    request: job.request,
                    stage: job.stage,
                    error_path: true,
                }]);
            }
            Err(e) => {
                // The error branch itself failed; complete the node so the
                // request cannot wedge.
                tracing::error!(
                    node = %node_slot.name,
                    request = job.request,
                    error = %e,
                    "error-path stage failed; forcing completion"
                );
                self.notify_node_request_done(job.node, job.request);
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Workers hold only weak references; dropping the sender lets
        // them drain and exit. Detach rather than join: drop may run on a
        // worker thread.
        if let Ok(mut guard) = self.job_tx.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.workers.lock() {
            guard.take();
        }
    }
}
