//! Statistics node — merges dual-IFE stripe results and drives AEC.
//!
//! Full multi-stage machine: decide skip versus process, wait for the
//! exposure actually applied plus the previous frame's AEC decision, then
//! wait for both hardware stripe fences together with the programmed
//! geometry, and finally merge, post-process and publish without further
//! suspension.
//!
//! Every terminal path — skip, publish, error — still publishes
//! `StatsParsed` and `AecFrameControl`, so consumers with per-frame or
//! lookback dependencies on them never stall.

use crate::error::{Result, SchedError};
use crate::metadata::{PropertyId, PropertyPool, PropertyValue};
use crate::pipeline::node::{NodeBehavior, StageContext, StageResult};
use crate::scheduler::{DependencyUnit, Stage};
use crate::stripe::{MergeMode, StripeMerger};
use crate::types::ExposureSettings;

/// Target average for the toy AEC loop.
const AEC_TARGET: f32 = 512.0;
/// Post-processing clamp for the parsed average.
const STATS_MAX: f32 = 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatsStage {
    Setup,
    Preprocess,
    Publish,
}

impl From<StatsStage> for Stage {
    fn from(stage: StatsStage) -> Stage {
        Stage(stage as u32)
    }
}

impl TryFrom<Stage> for StatsStage {
    type Error = SchedError;

    fn try_from(stage: Stage) -> Result<Self> {
        match stage.0 {
            0 => Ok(StatsStage::Setup),
            1 => Ok(StatsStage::Preprocess),
            2 => Ok(StatsStage::Publish),
            _ => Err(SchedError::InvalidStage {
                node: "stats".into(),
                stage,
            }),
        }
    }
}

/// Consumes hardware statistics stripes and publishes the AEC decision
/// for the next frame.
pub struct StatsNode;

impl StatsNode {
    pub fn new() -> Self {
        Self
    }

    /// Previous frame's AEC decision, or defaults before history exists.
    fn previous_aec(&self, ctx: &StageContext<'_>) -> ExposureSettings {
        ctx.read(PropertyPool::PerFrame, PropertyId::AecFrameControl, 1)
            .ok()
            .flatten()
            .and_then(|v| v.as_exposure())
            .unwrap_or_default()
    }

    /// Terminal path shared by skip and error handling: publish defaults
    /// and deliver the outstanding notifications.
    fn finish_with_defaults(&self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        let carried = self.previous_aec(ctx);
        let _ = ctx.publish(
            PropertyPool::PerFrame,
            PropertyId::StatsParsed,
            PropertyValue::F32(0.0),
        );
        let _ = ctx.publish(
            PropertyPool::PerFrame,
            PropertyId::AecFrameControl,
            PropertyValue::Exposure(carried),
        );
        ctx.notify_partial_metadata_done();
        ctx.notify_metadata_done();
        Ok(StageResult::Complete)
    }

    fn publish_results(&self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        let geometry = ctx
            .read(PropertyPool::Internal, PropertyId::StatsConfig, 0)?
            .and_then(|v| v.as_geometry());
        let left = ctx
            .read(PropertyPool::Internal, PropertyId::StatsLeftStripe, 0)?
            .and_then(|v| v.as_blob().map(<[u8]>::to_vec));
        let right = ctx
            .read(PropertyPool::Internal, PropertyId::StatsRightStripe, 0)?
            .and_then(|v| v.as_blob().map(<[u8]>::to_vec));

        let average = match (geometry, left, right) {
            (Some(geometry), Some(left), Some(right)) => {
                let merger = StripeMerger::new(geometry, MergeMode::Interleave)?;
                let merged = merger.merge(&left, &right)?;
                average_lane(&merged, geometry.element_size)
            }
            _ => {
                // Buffers signaled but payloads never landed; treat as an
                // empty frame rather than failing the request.
                tracing::warn!(request = ctx.request(), "stripe payloads missing");
                0.0
            }
        };
        // Bounds clamp happens in-process; no further suspension.
        let average = average.clamp(0.0, STATS_MAX);

        let previous = self.previous_aec(ctx);
        let next = aec_step(previous, average);
        tracing::trace!(
            request = ctx.request(),
            average,
            next_exposure_us = next.exposure_us,
            "stats published"
        );
        ctx.publish(
            PropertyPool::PerFrame,
            PropertyId::StatsParsed,
            PropertyValue::F32(average),
        )?;
        ctx.publish(
            PropertyPool::PerFrame,
            PropertyId::AecFrameControl,
            PropertyValue::Exposure(next),
        )?;
        ctx.notify_partial_metadata_done();
        ctx.notify_metadata_done();
        Ok(StageResult::Complete)
    }
}

impl Default for StatsNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBehavior for StatsNode {
    fn name(&self) -> &str {
        "Stats"
    }

    fn produces_partial_metadata(&self) -> bool {
        true
    }

    fn execute_stage(&mut self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        if ctx.is_errored() {
            return self.finish_with_defaults(ctx);
        }
        match StatsStage::try_from(ctx.stage())? {
            StatsStage::Setup => {
                let process = ctx.descriptor().map(|d| d.enable_stats).unwrap_or(false);
                if !process {
                    return self.finish_with_defaults(ctx);
                }
                let unit = DependencyUnit::builder(StatsStage::Preprocess)
                    .await_property(PropertyPool::PerFrame, PropertyId::SensorExposure)
                    .await_property_at(PropertyPool::PerFrame, PropertyId::AecFrameControl, 1)
                    .build();
                Ok(StageResult::Pending(unit))
            }
            StatsStage::Preprocess => {
                let left = ctx.acquire_fence("stats-stripe-left");
                let right = ctx.acquire_fence("stats-stripe-right");
                // Buffers and the programmed geometry resolve together;
                // the stage runs once all three are in.
                let unit = DependencyUnit::builder(StatsStage::Publish)
                    .await_fence(left)
                    .await_fence(right)
                    .await_property(PropertyPool::Internal, PropertyId::StatsConfig)
                    .build();
                Ok(StageResult::Pending(unit))
            }
            StatsStage::Publish => self.publish_results(ctx),
        }
    }
}

/// Average of the unsigned little-endian lanes in `buf`.
fn average_lane(buf: &[u8], element_size: usize) -> f32 {
    if buf.is_empty() {
        return 0.0;
    }
    let mut sum = 0u64;
    let mut count = 0u64;
    for chunk in buf.chunks_exact(element_size) {
        let lane = match element_size {
            1 => chunk[0] as u64,
            2 => u16::from_le_bytes(chunk.try_into().unwrap()) as u64,
            4 => u32::from_le_bytes(chunk.try_into().unwrap()) as u64,
            8 => u64::from_le_bytes(chunk.try_into().unwrap()),
            _ => 0,
        };
        sum += lane;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum / count) as f32
    }
}

/// Proportional exposure step toward the target average. Stands in for
/// the vendor AEC library, which is out of scope.
fn aec_step(previous: ExposureSettings, average: f32) -> ExposureSettings {
    let ratio = if average <= 0.0 {
        2.0
    } else {
        (AEC_TARGET / average).clamp(0.5, 2.0)
    };
    ExposureSettings {
        exposure_us: ((previous.exposure_us as f32 * ratio) as u32).clamp(100, 100_000),
        gain: previous.gain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_lane_u32() {
        let buf: Vec<u8> = [10u32, 20, 30].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(average_lane(&buf, 4), 20.0);
    }

    #[test]
    fn test_aec_converges_toward_target() {
        let previous = ExposureSettings {
            exposure_us: 10_000,
            gain: 1.0,
        };
        // Underexposed frame: exposure must grow.
        let brighter = aec_step(previous, 256.0);
        assert!(brighter.exposure_us > previous.exposure_us);
        // Overexposed frame: exposure must shrink.
        let darker = aec_step(previous, 1024.0);
        assert!(darker.exposure_us < previous.exposure_us);
    }

    #[test]
    fn test_aec_step_is_bounded() {
        let previous = ExposureSettings {
            exposure_us: 100,
            gain: 1.0,
        };
        let next = aec_step(previous, 0.0);
        assert!(next.exposure_us <= 100_000);
        assert!(next.exposure_us >= 100);
    }
}
