//! Built-in pipeline nodes.
//!
//! Each node drives the generic multi-stage machine: decide skip versus
//! process, wait for upstream properties, wait for hardware fences, then
//! publish and notify. The stage enums here are node-private; the
//! scheduler only ever sees the opaque [`Stage`](crate::scheduler::Stage)
//! token.

mod autofocus;
mod isp;
mod sensor;
mod stats;

pub use autofocus::AfNode;
pub use isp::IspNode;
pub use sensor::SensorNode;
pub use stats::StatsNode;
