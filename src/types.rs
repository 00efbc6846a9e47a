//! Shared data types used across the scheduler and pipeline.

use serde::{Deserialize, Serialize};

/// Final outcome of a fence, reported exactly once by its producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceOutcome {
    /// The hardware/software operation completed successfully.
    Success,
    /// The producer reported a failure; the waiting request enters the
    /// error path.
    Error,
}

/// Exposure parameters applied to (or requested from) the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureSettings {
    /// Exposure time in microseconds.
    pub exposure_us: u32,
    /// Analog gain multiplier.
    pub gain: f32,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            exposure_us: 10_000,
            gain: 1.0,
        }
    }
}

/// A rectangular region of interest in active-array coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Relative weight when multiple regions are supplied.
    pub weight: u32,
}

/// Description of a single capture request as submitted by the client.
///
/// The pipeline assigns the frame number; the descriptor only carries the
/// per-frame controls the nodes consume.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Requested exposure for this frame.
    pub exposure: ExposureSettings,
    /// Whether the statistics node should process this frame.
    pub enable_stats: bool,
    /// Whether the autofocus node should process this frame.
    pub enable_af: bool,
    /// Optional focus region override.
    pub af_region: Option<Region>,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            exposure: ExposureSettings::default(),
            enable_stats: true,
            enable_af: true,
            af_region: None,
        }
    }
}
