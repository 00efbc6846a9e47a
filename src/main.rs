//! framesched demo - Main Entry Point
//!
//! Runs a synthetic capture session against the default four-node
//! pipeline. The binary plays the role of the hardware driver: whenever a
//! node arms a fence it fabricates the corresponding stripe payloads and
//! signals completion.

use anyhow::Context;
use framesched::{
    CaptureRequest, FenceOutcome, Pipeline, PipelineBuilder, PipelineConfig, PropertyId,
    PropertyPool, PropertyValue, ResultEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Frames captured by the demo session.
const TOTAL_FRAMES: u64 = 24;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,framesched=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting framesched demo session");

    let config = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!("Loading pipeline config from {}", path);
            PipelineConfig::load(&path).with_context(|| format!("loading {}", path))?
        }
        None => PipelineConfig::default(),
    };

    let (pipeline, bridge) = PipelineBuilder::new(config)
        .with_default_nodes()
        .finalize()
        .context("failed to finalize pipeline")?;

    let first = pipeline
        .submit(CaptureRequest::default())
        .context("failed to submit first request")?;
    if !pipeline.wait_stream_config(first, Duration::from_secs(1)) {
        anyhow::bail!("stream configuration did not complete");
    }
    tracing::info!(request = first, "stream configured");

    let mut submitted = 1u64;
    let mut completed = 0u64;
    let mut errored = 0u64;

    // Keep the window full without overrunning it.
    while submitted < pipeline.config().queue_depth as u64 && submitted < TOTAL_FRAMES {
        pipeline.submit(CaptureRequest::default())?;
        submitted += 1;
    }

    while completed < submitted {
        let Some(event) = bridge.recv_timeout(Duration::from_secs(2)) else {
            anyhow::bail!("pipeline stalled: {} of {} frames done", completed, submitted);
        };
        match event {
            ResultEvent::FenceArmed {
                request,
                label,
                fence,
            } => {
                // Hardware stand-in: produce stripe payloads, then signal.
                if label.starts_with("stats-stripe") {
                    let (id, base) = if label.ends_with("left") {
                        (PropertyId::StatsLeftStripe, 400u32)
                    } else {
                        (PropertyId::StatsRightStripe, 600u32)
                    };
                    let blob = synth_stripe(&pipeline, request, base, &label);
                    let _ = pipeline.write_property(
                        PropertyPool::Internal,
                        id,
                        request,
                        PropertyValue::Blob(blob),
                    );
                }
                pipeline.on_fence_signaled(&fence, FenceOutcome::Success);
            }
            ResultEvent::Metadata { request, error } => {
                tracing::info!(request, error, "metadata delivered");
            }
            ResultEvent::RequestComplete { request, error } => {
                completed += 1;
                if error {
                    errored += 1;
                }
                tracing::debug!(request, error, "frame complete");
                if submitted < TOTAL_FRAMES {
                    pipeline.submit(CaptureRequest::default())?;
                    submitted += 1;
                }
            }
            _ => {}
        }
    }

    pipeline
        .flush(Duration::from_secs(2))
        .context("flush did not converge")?;
    pipeline.shutdown();

    tracing::info!(
        frames = completed,
        errored,
        "session finished; all nodes done: {}",
        pipeline.all_nodes_done()
    );
    Ok(())
}

/// Fabricate a stripe payload matching the geometry the ISP programmed.
fn synth_stripe(pipeline: &Arc<Pipeline>, request: u64, base: u32, label: &str) -> Vec<u8> {
    let geometry = pipeline
        .read_property(PropertyPool::Internal, PropertyId::StatsConfig, request, 0)
        .ok()
        .flatten()
        .and_then(|v| v.as_geometry())
        .unwrap_or(pipeline.config().stripe);
    let regions = if label.ends_with("left") {
        geometry.rows * geometry.left_regions
    } else {
        geometry.rows * geometry.right_regions
    };
    let mut blob = Vec::with_capacity(regions * geometry.element_size);
    for n in 0..regions {
        let lane = base + (request as u32 + n as u32) % 64;
        blob.extend_from_slice(&lane.to_le_bytes()[..geometry.element_size.min(4)]);
        if geometry.element_size > 4 {
            blob.extend(std::iter::repeat_n(0u8, geometry.element_size - 4));
        }
    }
    blob
}
