//! Property-based tests for the deferred queue and a concurrency probe
//! for stage dispatch.

mod common;

use framesched::{
    AnyNode, DependencyUnit, DeferredQueue, FenceOutcome, FenceRegistry, MetadataPool,
    NodeBehavior, NodeId, PipelineBuilder, PropertyId, PropertyPool, PropertyValue, ResultEvent,
    Stage, StageContext, StageResult,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Property ids usable as independent dependency keys in tests.
const PROP_IDS: [PropertyId; 3] = [
    PropertyId::SensorExposure,
    PropertyId::StatsParsed,
    PropertyId::LensPosition,
];

proptest! {
    /// Conjunctive resolution: with K fences and M properties, resolving
    /// all but one dependency never dispatches; resolving the last
    /// dispatches exactly once.
    #[test]
    fn prop_conjunctive_resolution(
        fences in 0usize..4,
        props in 0usize..4,
        last_index in 0usize..16,
    ) {
        let total = fences + props;
        prop_assume!(total >= 1);
        let last_index = last_index % total;

        let queue = DeferredQueue::new(4);
        let pool = MetadataPool::new(4);
        let registry = FenceRegistry::new();
        let request = 10u64;

        let fence_handles: Vec<_> = (0..fences)
            .map(|i| registry.create(request, format!("f{}", i)))
            .collect();
        let mut builder = DependencyUnit::builder(Stage(1));
        for fence in &fence_handles {
            builder = builder.await_fence(fence.clone());
        }
        for id in PROP_IDS.iter().take(props) {
            builder = builder.await_property(PropertyPool::PerFrame, *id);
        }
        queue
            .register(NodeId(0), request, builder.build(), &pool)
            .unwrap();

        // Dependency index space: fences first, then properties.
        let mut dispatched = Vec::new();
        for index in (0..total).filter(|i| *i != last_index) {
            dispatched.extend(resolve(&queue, &pool, &fence_handles, request, index));
        }
        prop_assert!(dispatched.is_empty(), "dispatched before final dependency");
        prop_assert_eq!(queue.pending_units(), 1);

        dispatched.extend(resolve(&queue, &pool, &fence_handles, request, last_index));
        prop_assert_eq!(dispatched.len(), 1, "exactly one dispatch");
        prop_assert_eq!(queue.pending_units(), 0);
    }
}

/// Resolve dependency `index` (fences first, then properties) and return
/// any jobs it released.
fn resolve(
    queue: &DeferredQueue,
    pool: &MetadataPool,
    fences: &[framesched::Fence],
    request: u64,
    index: usize,
) -> Vec<framesched::scheduler::Job> {
    if index < fences.len() {
        let fence = &fences[index];
        fence.signal(FenceOutcome::Success);
        queue.on_fence_signaled(fence.id(), FenceOutcome::Success).jobs
    } else {
        let id = PROP_IDS[index - fences.len()];
        pool.write(PropertyPool::PerFrame, id, request, PropertyValue::U32(0))
            .unwrap();
        queue.on_property_written(PropertyPool::PerFrame, id, request)
    }
}

/// Plugin node that arms a batch of fences and records stage concurrency.
struct ReentrancyProbe {
    fences_per_request: usize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    publishes: Arc<AtomicUsize>,
}

impl NodeBehavior for ReentrancyProbe {
    fn name(&self) -> &str {
        "ReentrancyProbe"
    }

    fn execute_stage(&mut self, ctx: &mut StageContext<'_>) -> framesched::Result<StageResult> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        // Hold the stage long enough for racing fence signals to overlap
        // with it if dispatch were broken.
        std::thread::sleep(Duration::from_millis(2));

        let result = if ctx.is_errored() || ctx.stage() == Stage(1) {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            ctx.notify_metadata_done();
            Ok(StageResult::Complete)
        } else {
            let mut builder = DependencyUnit::builder(Stage(1));
            for i in 0..self.fences_per_request {
                builder = builder.await_fence(ctx.acquire_fence(&format!("probe-{}", i)));
            }
            Ok(StageResult::Pending(builder.build()))
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Stage non-reentrancy and exactly-once dispatch under concurrent fence
/// resolution from multiple producer threads.
#[test]
fn test_stage_non_reentrancy_under_concurrent_signals() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let publishes = Arc::new(AtomicUsize::new(0));

    let probe = ReentrancyProbe {
        fences_per_request: 4,
        in_flight: in_flight.clone(),
        max_in_flight: max_in_flight.clone(),
        publishes: publishes.clone(),
    };
    let mut config = common::test_config();
    config.worker_threads = 4;
    let (pipeline, bridge) = PipelineBuilder::new(config)
        .add_node(AnyNode::Plugin(Box::new(probe)))
        .finalize()
        .unwrap();

    let frames = 6usize;
    common::submit_n(&pipeline, frames);

    let mut completed = 0;
    while completed < frames {
        let event = bridge
            .recv_timeout(Duration::from_secs(5))
            .expect("probe pipeline stalled");
        match event {
            ResultEvent::FenceArmed { fence, .. } => {
                // Signal from a separate thread to race the workers.
                let pipeline = pipeline.clone();
                std::thread::spawn(move || {
                    pipeline.on_fence_signaled(&fence, FenceOutcome::Success);
                });
            }
            ResultEvent::RequestComplete { .. } => completed += 1,
            _ => {}
        }
    }

    assert_eq!(
        max_in_flight.load(Ordering::SeqCst),
        1,
        "two stages of one node must never overlap"
    );
    assert_eq!(
        publishes.load(Ordering::SeqCst),
        frames,
        "terminal stage runs exactly once per request"
    );
    pipeline.shutdown();
}

/// A second registration for the same (node, request) is rejected unless
/// the race is declared preemptable.
#[test]
fn test_duplicate_registration_requires_preemptable() {
    let queue = DeferredQueue::new(4);
    let pool = MetadataPool::new(4);
    let registry = FenceRegistry::new();

    let first = DependencyUnit::builder(Stage(1))
        .await_fence(registry.create(1, "a"))
        .build();
    queue.register(NodeId(0), 1, first, &pool).unwrap();

    let second = DependencyUnit::builder(Stage(2))
        .await_fence(registry.create(1, "b"))
        .build();
    assert!(queue.register(NodeId(0), 1, second, &pool).is_err());

    let racing = DependencyUnit::builder(Stage(2))
        .await_fence(registry.create(1, "c"))
        .preemptable()
        .build();
    queue.register(NodeId(0), 1, racing, &pool).unwrap();
    assert_eq!(queue.pending_units(), 2);
}
