//! # framesched: per-frame capture pipeline scheduler
//!
//! A request/dependency scheduler for camera capture pipelines: many
//! independent processing nodes (sensor, ISP, statistics, autofocus)
//! execute in dependency order for each capture request, where the
//! dependencies are a mix of asynchronous hardware-completion fences and
//! typed metadata properties produced by other nodes.
//!
//! ## Architecture
//!
//! - **Pipeline**: owns per-request slots in a sliding window, aggregates
//!   completion counters, and emits exactly one metadata and one
//!   completion event per request
//! - **DeferredQueue**: maps fences and properties to waiting node stages
//!   and re-invokes a node once everything it declared has resolved
//! - **Worker pool**: fixed threads running stage callbacks to completion;
//!   nodes suspend only at stage boundaries by returning a dependency unit
//! - **MetadataPool**: typed per-request property storage with historical
//!   lookback
//! - **StripeMerger**: recombines dual-IFE partial statistics buffers
//!
//! ## Example
//!
//! ```ignore
//! use framesched::{
//!     CaptureRequest, FenceOutcome, PipelineBuilder, PipelineConfig, ResultEvent,
//! };
//!
//! let (pipeline, bridge) = PipelineBuilder::new(PipelineConfig::default())
//!     .with_default_nodes()
//!     .finalize()?;
//!
//! pipeline.submit(CaptureRequest::default())?;
//!
//! // The consumer doubles as the hardware: signal fences as they arm.
//! while let Some(event) = bridge.recv_timeout(std::time::Duration::from_secs(1)) {
//!     match event {
//!         ResultEvent::FenceArmed { fence, .. } => {
//!             pipeline.on_fence_signaled(&fence, FenceOutcome::Success);
//!         }
//!         ResultEvent::RequestComplete { .. } => break,
//!         _ => {}
//!     }
//! }
//!
//! pipeline.flush(std::time::Duration::from_secs(1))?;
//! pipeline.shutdown();
//! ```

pub mod config;
pub mod error;
pub mod fence;
pub mod ids;
pub mod metadata;
pub mod pipeline;
pub mod scheduler;
pub mod stripe;
pub mod types;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{Result, SchedError};
pub use fence::{Fence, FenceRegistry};
pub use ids::{FenceId, NodeId};
pub use metadata::{MetadataPool, PropertyId, PropertyPool, PropertyValue};
pub use pipeline::{
    AnyNode, BuiltinNode, NodeBehavior, Pipeline, PipelineBridge, PipelineBuilder, ResultEvent,
    StageContext, StageResult, FIRST_REQUEST_ID,
};
pub use scheduler::{DependencyUnit, DeferredQueue, Stage};
pub use stripe::{MergeMode, StripeGeometry, StripeMerger};
pub use types::{CaptureRequest, ExposureSettings, FenceOutcome, Region};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
