//! Declarative dependency units.
//!
//! A node that cannot finish a request in one pass returns a
//! [`DependencyUnit`] describing the fences and properties that must become
//! available before its next stage may run, plus the [`Stage`] token the
//! scheduler hands back verbatim on re-invocation. The token is opaque to
//! the scheduler; each node converts it to and from its own typed stage
//! enum.

use crate::fence::Fence;
use crate::metadata::{PropertyId, PropertyPool};
use std::fmt;

/// Opaque resumption token passed back to a node when its dependencies
/// resolve. Nodes define typed enums convertible to and from this.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stage(pub u32);

impl Stage {
    /// Every node's first invocation for a request.
    pub const INITIAL: Stage = Stage(0);
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stage({})", self.0)
    }
}

/// A single property dependency: the value of `id` in `pool` as of
/// `request - offset` (or `request + offset` when `negate` is set, for
/// nodes that gate on a future frame's settings).
#[derive(Debug, Clone, Copy)]
pub struct PropertyDependency {
    pub pool: PropertyPool,
    pub id: PropertyId,
    pub offset: u64,
    pub negate: bool,
}

impl PropertyDependency {
    /// The request whose write satisfies this dependency, observed from
    /// `request`. `None` means the target predates the first request and
    /// the dependency is trivially satisfied.
    pub fn effective_request(&self, request: u64) -> Option<u64> {
        if self.pool == PropertyPool::Usecase {
            // Session-scoped: one shared key, no per-request versioning.
            return Some(0);
        }
        if self.negate {
            Some(request + self.offset)
        } else {
            request.checked_sub(self.offset)
        }
    }
}

/// Everything one (node, request, stage) pair is waiting on.
///
/// Dependencies are conjunctive: the owning stage runs only after every
/// fence and every property listed here resolves. A unit with nothing to
/// wait on is invalid; the stage must run immediately instead of
/// registering.
#[derive(Debug, Clone)]
pub struct DependencyUnit {
    fences: Vec<Fence>,
    properties: Vec<PropertyDependency>,
    next_stage: Stage,
    preemptable: bool,
}

impl DependencyUnit {
    pub fn builder(next_stage: impl Into<Stage>) -> DependencyUnitBuilder {
        DependencyUnitBuilder {
            unit: DependencyUnit {
                fences: Vec::new(),
                properties: Vec::new(),
                next_stage: next_stage.into(),
                preemptable: false,
            },
        }
    }

    pub fn fences(&self) -> &[Fence] {
        &self.fences
    }

    pub fn properties(&self) -> &[PropertyDependency] {
        &self.properties
    }

    pub fn next_stage(&self) -> Stage {
        self.next_stage
    }

    pub fn is_preemptable(&self) -> bool {
        self.preemptable
    }

    pub fn has_fences(&self) -> bool {
        !self.fences.is_empty()
    }

    pub fn has_properties(&self) -> bool {
        !self.properties.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty() && self.properties.is_empty()
    }
}

/// Builder for [`DependencyUnit`].
pub struct DependencyUnitBuilder {
    unit: DependencyUnit,
}

impl DependencyUnitBuilder {
    /// Wait for a fence to signal.
    pub fn await_fence(mut self, fence: Fence) -> Self {
        self.unit.fences.push(fence);
        self
    }

    /// Wait for `id` to be written for the current request.
    pub fn await_property(self, pool: PropertyPool, id: PropertyId) -> Self {
        self.await_property_at(pool, id, 0)
    }

    /// Wait for `id` as it was `offset` requests in the past.
    pub fn await_property_at(mut self, pool: PropertyPool, id: PropertyId, offset: u64) -> Self {
        self.unit.properties.push(PropertyDependency {
            pool,
            id,
            offset,
            negate: false,
        });
        self
    }

    /// Wait for `id` to be written for a *future* request, `offset`
    /// requests ahead.
    pub fn await_future_property(
        mut self,
        pool: PropertyPool,
        id: PropertyId,
        offset: u64,
    ) -> Self {
        self.unit.properties.push(PropertyDependency {
            pool,
            id,
            offset,
            negate: true,
        });
        self
    }

    /// Mark the unit abandonable: if a competing unit for the same
    /// (node, request) resolves first, this one is silently cancelled.
    pub fn preemptable(mut self) -> Self {
        self.unit.preemptable = true;
        self
    }

    pub fn build(self) -> DependencyUnit {
        self.unit
    }
}
