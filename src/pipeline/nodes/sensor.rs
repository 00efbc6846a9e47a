//! Sensor node — applies per-frame exposure to the imaging sensor.
//!
//! The sensor's I2C apply callbacks can be delivered out of request order
//! by the driver, so the node manufactures a property dependency on its
//! own previous frame's applied exposure: frame N only programs after
//! frame N-1 published. The first frame has no history and runs straight
//! through.

use crate::error::{Result, SchedError};
use crate::metadata::{PropertyId, PropertyPool, PropertyValue};
use crate::pipeline::coordinator::FIRST_REQUEST_ID;
use crate::pipeline::node::{NodeBehavior, StageContext, StageResult};
use crate::scheduler::{DependencyUnit, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorStage {
    Start,
    Apply,
}

impl From<SensorStage> for Stage {
    fn from(stage: SensorStage) -> Stage {
        Stage(stage as u32)
    }
}

impl TryFrom<Stage> for SensorStage {
    type Error = SchedError;

    fn try_from(stage: Stage) -> Result<Self> {
        match stage.0 {
            0 => Ok(SensorStage::Start),
            1 => Ok(SensorStage::Apply),
            _ => Err(SchedError::InvalidStage {
                node: "sensor".into(),
                stage,
            }),
        }
    }
}

/// Programs exposure and gain onto the sensor for each frame.
pub struct SensorNode;

impl SensorNode {
    pub fn new() -> Self {
        Self
    }

    fn apply(&self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        let exposure = ctx
            .descriptor()
            .map(|desc| desc.exposure)
            .unwrap_or_default();
        tracing::trace!(
            request = ctx.request(),
            exposure_us = exposure.exposure_us,
            gain = exposure.gain,
            "applying sensor exposure"
        );
        ctx.publish(
            PropertyPool::PerFrame,
            PropertyId::SensorExposure,
            PropertyValue::Exposure(exposure),
        )?;
        ctx.publish(
            PropertyPool::PerFrame,
            PropertyId::FrameDuration,
            PropertyValue::U64(33_333_333),
        )?;
        ctx.notify_config_done();
        ctx.notify_metadata_done();
        Ok(StageResult::Complete)
    }

    fn finish_error(&self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        // Default output keeps downstream consumers unblocked.
        let _ = ctx.publish(
            PropertyPool::PerFrame,
            PropertyId::SensorExposure,
            PropertyValue::Exposure(Default::default()),
        );
        ctx.notify_config_done();
        ctx.notify_metadata_done();
        Ok(StageResult::Complete)
    }
}

impl Default for SensorNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBehavior for SensorNode {
    fn name(&self) -> &str {
        "Sensor"
    }

    fn reports_config(&self) -> bool {
        true
    }

    fn execute_stage(&mut self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        if ctx.is_errored() {
            return self.finish_error(ctx);
        }
        match SensorStage::try_from(ctx.stage())? {
            SensorStage::Start => {
                if ctx.request() == FIRST_REQUEST_ID {
                    ctx.publish(
                        PropertyPool::Usecase,
                        PropertyId::SensorMode,
                        PropertyValue::U32(0),
                    )?;
                }
                // In-order guard: wait for the previous frame's applied
                // exposure. Satisfied immediately when no history exists.
                let unit = DependencyUnit::builder(SensorStage::Apply)
                    .await_property_at(PropertyPool::PerFrame, PropertyId::SensorExposure, 1)
                    .build();
                Ok(StageResult::Pending(unit))
            }
            SensorStage::Apply => self.apply(ctx),
        }
    }
}
