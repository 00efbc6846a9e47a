//! Autofocus node — consumes parsed statistics and drives the lens.
//!
//! Publishes its focus-region frame settings early in Setup so hardware
//! configuration downstream is unblocked before the heavy wait begins,
//! then suspends on the same frame's parsed statistics plus its own lens
//! position one frame back.

use crate::error::{Result, SchedError};
use crate::metadata::{PropertyId, PropertyPool, PropertyValue};
use crate::pipeline::node::{NodeBehavior, StageContext, StageResult};
use crate::scheduler::{DependencyUnit, Stage};
use crate::types::Region;

/// Lens position used before any focus history exists.
const LENS_REST_POSITION: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfStage {
    Setup,
    Compute,
}

impl From<AfStage> for Stage {
    fn from(stage: AfStage) -> Stage {
        Stage(stage as u32)
    }
}

impl TryFrom<Stage> for AfStage {
    type Error = SchedError;

    fn try_from(stage: Stage) -> Result<Self> {
        match stage.0 {
            0 => Ok(AfStage::Setup),
            1 => Ok(AfStage::Compute),
            _ => Err(SchedError::InvalidStage {
                node: "autofocus".into(),
                stage,
            }),
        }
    }
}

/// Moves the lens toward focus using per-frame statistics.
pub struct AfNode;

impl AfNode {
    pub fn new() -> Self {
        Self
    }

    fn previous_position(&self, ctx: &StageContext<'_>) -> f32 {
        ctx.read(PropertyPool::PerFrame, PropertyId::LensPosition, 1)
            .ok()
            .flatten()
            .and_then(|v| v.as_f32())
            .unwrap_or(LENS_REST_POSITION)
    }

    /// Terminal path for skip and error handling: hold the lens and
    /// deliver the outstanding notifications.
    fn finish_with_defaults(&self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        let held = self.previous_position(ctx);
        let _ = ctx.publish(
            PropertyPool::PerFrame,
            PropertyId::LensPosition,
            PropertyValue::F32(held),
        );
        ctx.notify_partial_metadata_done();
        ctx.notify_metadata_done();
        Ok(StageResult::Complete)
    }
}

impl Default for AfNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBehavior for AfNode {
    fn name(&self) -> &str {
        "Autofocus"
    }

    fn produces_partial_metadata(&self) -> bool {
        true
    }

    fn execute_stage(&mut self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        if ctx.is_errored() {
            return self.finish_with_defaults(ctx);
        }
        match AfStage::try_from(ctx.stage())? {
            AfStage::Setup => {
                let descriptor = ctx.descriptor().unwrap_or_default();
                // Frame settings go out before any dependency so the
                // hardware-configuration path is never gated on focus.
                let region = descriptor.af_region.unwrap_or(Region {
                    x: 0,
                    y: 0,
                    width: 0,
                    height: 0,
                    weight: 1,
                });
                ctx.publish(
                    PropertyPool::PerFrame,
                    PropertyId::AfFrameControl,
                    PropertyValue::Regions(vec![region]),
                )?;
                if !descriptor.enable_af {
                    return self.finish_with_defaults(ctx);
                }
                let unit = DependencyUnit::builder(AfStage::Compute)
                    .await_property(PropertyPool::PerFrame, PropertyId::StatsParsed)
                    .await_property_at(PropertyPool::PerFrame, PropertyId::LensPosition, 1)
                    .build();
                Ok(StageResult::Pending(unit))
            }
            AfStage::Compute => {
                let sharpness = ctx
                    .read(PropertyPool::PerFrame, PropertyId::StatsParsed, 0)?
                    .and_then(|v| v.as_f32())
                    .unwrap_or(0.0);
                let previous = self.previous_position(ctx);
                // Stand-in for the vendor focus search; the real sweep is
                // out of scope.
                let step = ((512.0 - sharpness) / 512.0 * 0.05).clamp(-0.05, 0.05);
                let position = (previous + step).clamp(0.0, 1.0);
                tracing::trace!(
                    request = ctx.request(),
                    sharpness,
                    position,
                    "lens position updated"
                );
                ctx.publish(
                    PropertyPool::PerFrame,
                    PropertyId::LensPosition,
                    PropertyValue::F32(position),
                )?;
                ctx.notify_partial_metadata_done();
                ctx.notify_metadata_done();
                Ok(StageResult::Complete)
            }
        }
    }
}
