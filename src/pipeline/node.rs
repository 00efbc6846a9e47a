//! Node abstraction for the pipeline.
//!
//! Two-layer design:
//! - **`NodeBehavior` trait** — for extensibility and test doubles.
//! - **`BuiltinNode` enum** — for the shipped nodes; the compiler can
//!   inline match arms, avoiding dynamic dispatch on the hot path.
//!
//! `AnyNode` wraps either variant so the pipeline handles both uniformly.
//!
//! A node's `execute_stage` either completes the request or returns a
//! [`DependencyUnit`] naming what it waits for next. The scheduler
//! re-invokes the node at the unit's stage token once everything resolves.
//! Stage callbacks for one (node, request) never overlap: a new stage is
//! only dispatched after the previous one returned and its unit resolved.

use crate::error::Result;
use crate::fence::Fence;
use crate::ids::NodeId;
use crate::metadata::{PropertyId, PropertyPool, PropertyValue};
use crate::pipeline::coordinator::Pipeline;
use crate::pipeline::nodes::{AfNode, IspNode, SensorNode, StatsNode};
use crate::scheduler::{DependencyUnit, Stage};
use crate::types::CaptureRequest;

/// What a stage produced.
pub enum StageResult {
    /// The node is finished with this request.
    Complete,
    /// The node suspends until the unit's dependencies resolve.
    Pending(DependencyUnit),
}

/// Context handed to a node for one stage invocation.
pub struct StageContext<'a> {
    pipeline: &'a Pipeline,
    node: NodeId,
    request: u64,
    stage: Stage,
    errored: bool,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        pipeline: &'a Pipeline,
        node: NodeId,
        request: u64,
        stage: Stage,
        errored: bool,
    ) -> Self {
        Self {
            pipeline,
            node,
            request,
            stage,
            errored,
        }
    }

    pub fn request(&self) -> u64 {
        self.request
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Whether this request is on the error path. Nodes must check this
    /// first and, when set, emit default output and complete without
    /// touching hardware.
    pub fn is_errored(&self) -> bool {
        self.errored
    }

    /// The originating request description.
    pub fn descriptor(&self) -> Option<CaptureRequest> {
        self.pipeline.request_descriptor(self.request)
    }

    /// Non-blocking property read for this request, `offset` frames back.
    pub fn read(
        &self,
        pool: PropertyPool,
        id: PropertyId,
        offset: u64,
    ) -> Result<Option<PropertyValue>> {
        self.pipeline.read_property(pool, id, self.request, offset)
    }

    /// Publish a property for this request. Resolves any units waiting on
    /// it before returning.
    pub fn publish(&self, pool: PropertyPool, id: PropertyId, value: PropertyValue) -> Result<()> {
        self.pipeline.write_property(pool, id, self.request, value)
    }

    /// Create an unsignaled fence for this request and announce it to the
    /// fence producer through the result bridge. The fence is tracked on
    /// the request so flush can account for it.
    pub fn acquire_fence(&self, label: &str) -> Fence {
        self.pipeline.create_fence(self.request, label)
    }

    pub fn notify_metadata_done(&self) {
        self.pipeline.notify_node_metadata_done(self.request);
    }

    pub fn notify_partial_metadata_done(&self) {
        self.pipeline.notify_node_partial_metadata_done(self.request);
    }

    pub fn notify_config_done(&self) {
        self.pipeline.notify_node_config_done(self.request);
    }

    pub fn notify_buffer_done(&self) {
        self.pipeline.notify_node_buffer_done(self.request);
    }
}

/// Trait for pluggable/user-defined nodes.
pub trait NodeBehavior: Send {
    /// Human-readable name of this node.
    fn name(&self) -> &str;

    /// Whether this node reports final metadata for each request.
    fn produces_metadata(&self) -> bool {
        true
    }

    /// Whether this node reports partial (early) metadata.
    fn produces_partial_metadata(&self) -> bool {
        false
    }

    /// Whether this node participates in stream configuration.
    fn reports_config(&self) -> bool {
        false
    }

    /// Whether this node produces output buffers.
    fn produces_buffers(&self) -> bool {
        false
    }

    /// Run one stage for one request.
    fn execute_stage(&mut self, ctx: &mut StageContext<'_>) -> Result<StageResult>;
}

/// Enum dispatch for the shipped nodes.
pub enum BuiltinNode {
    Sensor(SensorNode),
    Isp(IspNode),
    Stats(StatsNode),
    Autofocus(AfNode),
}

impl BuiltinNode {
    pub fn name(&self) -> &str {
        match self {
            BuiltinNode::Sensor(n) => n.name(),
            BuiltinNode::Isp(n) => n.name(),
            BuiltinNode::Stats(n) => n.name(),
            BuiltinNode::Autofocus(n) => n.name(),
        }
    }

    pub fn produces_metadata(&self) -> bool {
        match self {
            BuiltinNode::Sensor(n) => n.produces_metadata(),
            BuiltinNode::Isp(n) => n.produces_metadata(),
            BuiltinNode::Stats(n) => n.produces_metadata(),
            BuiltinNode::Autofocus(n) => n.produces_metadata(),
        }
    }

    pub fn produces_partial_metadata(&self) -> bool {
        match self {
            BuiltinNode::Sensor(n) => n.produces_partial_metadata(),
            BuiltinNode::Isp(n) => n.produces_partial_metadata(),
            BuiltinNode::Stats(n) => n.produces_partial_metadata(),
            BuiltinNode::Autofocus(n) => n.produces_partial_metadata(),
        }
    }

    pub fn reports_config(&self) -> bool {
        match self {
            BuiltinNode::Sensor(n) => n.reports_config(),
            BuiltinNode::Isp(n) => n.reports_config(),
            BuiltinNode::Stats(n) => n.reports_config(),
            BuiltinNode::Autofocus(n) => n.reports_config(),
        }
    }

    pub fn produces_buffers(&self) -> bool {
        match self {
            BuiltinNode::Sensor(n) => n.produces_buffers(),
            BuiltinNode::Isp(n) => n.produces_buffers(),
            BuiltinNode::Stats(n) => n.produces_buffers(),
            BuiltinNode::Autofocus(n) => n.produces_buffers(),
        }
    }

    pub fn execute_stage(&mut self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        match self {
            BuiltinNode::Sensor(n) => n.execute_stage(ctx),
            BuiltinNode::Isp(n) => n.execute_stage(ctx),
            BuiltinNode::Stats(n) => n.execute_stage(ctx),
            BuiltinNode::Autofocus(n) => n.execute_stage(ctx),
        }
    }
}

/// Wrapper holding either a built-in node (enum dispatch) or a plugin
/// (trait object).
pub enum AnyNode {
    Builtin(BuiltinNode),
    Plugin(Box<dyn NodeBehavior>),
}

impl AnyNode {
    pub fn name(&self) -> &str {
        match self {
            AnyNode::Builtin(n) => n.name(),
            AnyNode::Plugin(n) => n.name(),
        }
    }

    pub fn produces_metadata(&self) -> bool {
        match self {
            AnyNode::Builtin(n) => n.produces_metadata(),
            AnyNode::Plugin(n) => n.produces_metadata(),
        }
    }

    pub fn produces_partial_metadata(&self) -> bool {
        match self {
            AnyNode::Builtin(n) => n.produces_partial_metadata(),
            AnyNode::Plugin(n) => n.produces_partial_metadata(),
        }
    }

    pub fn reports_config(&self) -> bool {
        match self {
            AnyNode::Builtin(n) => n.reports_config(),
            AnyNode::Plugin(n) => n.reports_config(),
        }
    }

    pub fn produces_buffers(&self) -> bool {
        match self {
            AnyNode::Builtin(n) => n.produces_buffers(),
            AnyNode::Plugin(n) => n.produces_buffers(),
        }
    }

    pub fn execute_stage(&mut self, ctx: &mut StageContext<'_>) -> Result<StageResult> {
        match self {
            AnyNode::Builtin(n) => n.execute_stage(ctx),
            AnyNode::Plugin(n) => n.execute_stage(ctx),
        }
    }
}
