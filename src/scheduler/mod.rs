//! Dependency tracking and deferred execution.
//!
//! Nodes declare what they are waiting for as a [`DependencyUnit`]; the
//! [`DeferredQueue`] owns the mapping from fences and properties to
//! waiting units and decides when a node's next stage becomes runnable.
//! Runnable stages are handed to the [`WorkerPool`] as [`Job`]s.

pub mod dependency;
pub mod deferred_queue;
pub mod worker;

pub use dependency::{DependencyUnit, DependencyUnitBuilder, PropertyDependency, Stage};
pub use deferred_queue::{DeferredQueue, FenceResolution, RegisterOutcome};
pub use worker::{Job, WorkerPool};
