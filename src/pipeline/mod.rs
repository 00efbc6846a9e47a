//! Request coordination: the pipeline, its nodes, and per-request state.

pub mod bridge;
pub mod coordinator;
pub mod node;
pub mod nodes;
pub mod request;

pub use bridge::{PipelineBridge, ResultEvent};
pub use coordinator::{Pipeline, PipelineBuilder, FIRST_REQUEST_ID};
pub use node::{AnyNode, BuiltinNode, NodeBehavior, StageContext, StageResult};
pub use request::{CompletionTracker, NodeTotals, PerRequestInfo};
