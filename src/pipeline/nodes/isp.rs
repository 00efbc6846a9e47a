//! ISP node — programs the image front-end and tracks its frame output.
//!
//! Waits for the sensor's applied exposure, programs the stripe split,
//! then suspends on the hardware frame-done fence. Stream configuration
//! is reported as soon as the hardware is programmed so callers blocked
//! on config do not wait for the frame itself.

use crate::error::{Result, SchedError};
use crate::metadata::{PropertyId, PropertyPool, PropertyValue};
use crate::pipeline::node::{NodeBehavior, StageContext, StageResult};
use crate::scheduler::{DependencyUnit, Stage};
use crate::stripe::StripeGeometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IspStage {
    Start,
    Program,
    Finish,
}

impl From<IspStage> for Stage {
    fn from(stage: IspStage) -> Stage {
        Stage(stage as u32)
    }
}

impl TryFrom<Stage> for IspStage {
    type Error = SchedError;

    fn try_from(stage: Stage) -> Result<Self> {
        match stage.0 {
            0 => Ok(IspStage::Start),
            1 => Ok(IspStage::Program),
            2 => Ok(IspStage::Finish),
            _ => Err(SchedError::InvalidStage {
                node: "isp".into(),
                stage,
            }),
        }
    }
}

/// Programs the dual-stripe front-end for each frame.
pub struct IspNode {
    stripe: StripeGeometry,
}

impl IspNode {
    pub fn new(stripe: StripeGeometry) -> Self {
        Self { stripe }
    }

    fn finish_error(&self, ctx: &mut StageContext<'_>, stage: IspStage) -> Result<StageResult> {
        if stage != IspStage::Finish {
            // Hardware was never programmed; release config waiters with
            // the error content.
            ctx.notify_config_done();
        }
        ctx.notify_buffer_done();
        ctx.notify_metadata_done();
        Ok(StageResult::Complete)
    }
}

impl NodeBehavior for IspNode {
    fn name(&self) -> &str {
        "Isp"
    }

    fn reports_config(&self) -> bool {
        true
    }

    fn produces_buffers(&self) -> bool {
        true
    }

    fn execute_stage(&mut self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        let stage = IspStage::try_from(ctx.stage())?;
        if ctx.is_errored() {
            return self.finish_error(ctx, stage);
        }
        match stage {
            IspStage::Start => {
                let unit = DependencyUnit::builder(IspStage::Program)
                    .await_property(PropertyPool::PerFrame, PropertyId::SensorExposure)
                    .build();
                Ok(StageResult::Pending(unit))
            }
            IspStage::Program => {
                let exposure = ctx
                    .read(PropertyPool::PerFrame, PropertyId::SensorExposure, 0)?
                    .and_then(|v| v.as_exposure())
                    .unwrap_or_default();
                tracing::trace!(
                    request = ctx.request(),
                    exposure_us = exposure.exposure_us,
                    "programming stripe split"
                );
                ctx.publish(
                    PropertyPool::Internal,
                    PropertyId::StatsConfig,
                    PropertyValue::Geometry(self.stripe),
                )?;
                let frame_done = ctx.acquire_fence("ife-frame");
                ctx.notify_config_done();

                let unit = DependencyUnit::builder(IspStage::Finish)
                    .await_fence(frame_done)
                    .build();
                Ok(StageResult::Pending(unit))
            }
            IspStage::Finish => {
                ctx.notify_buffer_done();
                ctx.notify_metadata_done();
                Ok(StageResult::Complete)
            }
        }
    }
}
