//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

use framesched::{
    CaptureRequest, FenceOutcome, Pipeline, PipelineBridge, PipelineBuilder, PipelineConfig,
    PropertyId, PropertyPool, PropertyValue, ResultEvent, StripeGeometry,
};
use std::sync::Arc;
use std::time::Duration;

/// Small geometry so stripe payloads stay readable in failures.
pub fn test_geometry() -> StripeGeometry {
    StripeGeometry {
        left_regions: 2,
        right_regions: 3,
        rows: 2,
        element_size: 4,
    }
}

/// Pipeline configuration sized for tests: window of 4, two workers.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        queue_depth: 4,
        worker_threads: 2,
        result_capacity: 1024,
        stripe: test_geometry(),
    }
}

/// Build the default four-node pipeline on the test configuration.
pub fn test_pipeline() -> (Arc<Pipeline>, PipelineBridge) {
    PipelineBuilder::new(test_config())
        .with_default_nodes()
        .finalize()
        .expect("pipeline finalize failed")
}

/// Synthesize a stripe payload for the geometry the ISP programmed.
pub fn synth_stripe(pipeline: &Pipeline, request: u64, label: &str) -> Vec<u8> {
    let geometry = pipeline
        .read_property(PropertyPool::Internal, PropertyId::StatsConfig, request, 0)
        .ok()
        .flatten()
        .and_then(|v| v.as_geometry())
        .unwrap_or_else(test_geometry);
    let regions = if label.ends_with("left") {
        geometry.rows * geometry.left_regions
    } else {
        geometry.rows * geometry.right_regions
    };
    let mut blob = Vec::new();
    for n in 0..regions {
        blob.extend_from_slice(&(500u32 + n as u32).to_le_bytes());
    }
    blob
}

/// Drive the pipeline as the hardware producer until `frames` requests
/// complete, choosing each fence's outcome via `outcome_for`.
///
/// Returns every event observed, in arrival order.
pub fn drive<F>(
    pipeline: &Arc<Pipeline>,
    bridge: &PipelineBridge,
    frames: usize,
    outcome_for: F,
) -> Vec<ResultEvent>
where
    F: Fn(&str, u64) -> FenceOutcome,
{
    let mut events = Vec::new();
    let mut completed = 0;
    while completed < frames {
        let event = bridge
            .recv_timeout(Duration::from_secs(5))
            .expect("pipeline stalled while driving");
        match &event {
            ResultEvent::FenceArmed {
                request,
                label,
                fence,
            } => {
                if label.starts_with("stats-stripe") {
                    let id = if label.ends_with("left") {
                        PropertyId::StatsLeftStripe
                    } else {
                        PropertyId::StatsRightStripe
                    };
                    let blob = synth_stripe(pipeline, *request, label);
                    let _ = pipeline.write_property(
                        PropertyPool::Internal,
                        id,
                        *request,
                        PropertyValue::Blob(blob),
                    );
                }
                pipeline.on_fence_signaled(fence, outcome_for(label, *request));
            }
            ResultEvent::RequestComplete { .. } => completed += 1,
            _ => {}
        }
        events.push(event);
    }
    events
}

/// Submit `count` default requests, panicking on window overrun.
pub fn submit_n(pipeline: &Arc<Pipeline>, count: usize) -> Vec<u64> {
    (0..count)
        .map(|_| pipeline.submit(CaptureRequest::default()).expect("submit failed"))
        .collect()
}

/// Count metadata events for one request, split success/error.
pub fn metadata_counts(events: &[ResultEvent], request: u64) -> (usize, usize) {
    let mut ok = 0;
    let mut err = 0;
    for event in events {
        if let ResultEvent::Metadata {
            request: r,
            error,
        } = event
        {
            if *r == request {
                if *error {
                    err += 1;
                } else {
                    ok += 1;
                }
            }
        }
    }
    (ok, err)
}
