//! The deferred request queue.
//!
//! Central resolver decoupling "a dependency became satisfiable" from
//! "re-invoke the waiting stage". The queue owns the mapping from fences
//! and properties to waiting [`DependencyUnit`]s; when every dependency of
//! a unit resolves, the queue emits a [`Job`] for the worker pool.
//!
//! Resolution is conjunctive only. A node that wants "whichever fires
//! first" races two units, marking the abandonable one preemptable; when
//! any unit for a (node, request) pair dispatches, its siblings are
//! cancelled so the loser's callback never runs.
//!
//! The queue never interprets [`Stage`] values; they are returned to the
//! node verbatim, which is what lets a node drive an internal state
//! machine through repeated registration.

use crate::error::{Result, SchedError};
use crate::ids::{FenceId, NodeId};
use crate::metadata::{MetadataPool, PropertyId, PropertyPool};
use crate::scheduler::dependency::{DependencyUnit, Stage};
use crate::scheduler::worker::Job;
use crate::types::FenceOutcome;
use std::collections::HashMap;
use std::sync::Mutex;

type PropKey = (PropertyPool, PropertyId, u64);

struct UnitRecord {
    node: NodeId,
    request: u64,
    next_stage: Stage,
    remaining: usize,
    /// Keys this unit is indexed under, so cancellation can unlink it
    /// even when the producer never fires.
    waiting_fences: Vec<FenceId>,
    waiting_props: Vec<PropKey>,
}

#[derive(Default)]
struct QueueState {
    next_unit: u64,
    units: HashMap<u64, UnitRecord>,
    /// Active unit ids per (node, request); used for duplicate detection
    /// and sibling cancellation. May contain stale ids, pruned lazily.
    by_owner: HashMap<(NodeId, u64), Vec<u64>>,
    /// Preemptable flags kept alongside so duplicate checks do not need
    /// the record itself.
    preemptable: HashMap<u64, bool>,
    by_request: HashMap<u64, Vec<u64>>,
    fence_waiters: HashMap<FenceId, Vec<u64>>,
    property_waiters: HashMap<PropKey, Vec<u64>>,
}

impl QueueState {
    /// Remove a unit from every index it appears in.
    fn unlink(&mut self, unit_id: u64) -> Option<UnitRecord> {
        let record = self.units.remove(&unit_id)?;
        self.preemptable.remove(&unit_id);
        for fence in &record.waiting_fences {
            if let Some(ids) = self.fence_waiters.get_mut(fence) {
                ids.retain(|id| *id != unit_id);
                if ids.is_empty() {
                    self.fence_waiters.remove(fence);
                }
            }
        }
        for key in &record.waiting_props {
            if let Some(ids) = self.property_waiters.get_mut(key) {
                ids.retain(|id| *id != unit_id);
                if ids.is_empty() {
                    self.property_waiters.remove(key);
                }
            }
        }
        if let Some(ids) = self.by_request.get_mut(&record.request) {
            ids.retain(|id| *id != unit_id);
            if ids.is_empty() {
                self.by_request.remove(&record.request);
            }
        }
        Some(record)
    }

    /// Remove a unit and cancel every sibling registered for the same
    /// (node, request). Returns the job for the removed unit.
    fn dispatch(&mut self, unit_id: u64, error_path: bool) -> Option<Job> {
        let record = self.unlink(unit_id)?;
        if let Some(siblings) = self.by_owner.remove(&(record.node, record.request)) {
            for sibling in siblings {
                if sibling != unit_id && self.unlink(sibling).is_some() {
                    tracing::debug!(
                        node = %record.node,
                        request = record.request,
                        "cancelled racing dependency unit"
                    );
                }
            }
        }
        Some(Job {
            node: record.node,
            request: record.request,
            stage: record.next_stage,
            error_path,
        })
    }
}

/// What happened when a unit was registered.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// Unit parked; it dispatches when its dependencies resolve.
    Deferred,
    /// Every dependency was already satisfied; run the stage now.
    Ready(Job),
    /// A fence dependency had already failed. Run the error path and mark
    /// the request errored.
    Errored(Job),
}

/// Result of a fence signal: jobs to run, and the requests that must be
/// marked errored first (non-empty only for error outcomes).
#[derive(Debug, Default)]
pub struct FenceResolution {
    pub jobs: Vec<Job>,
    pub errored_requests: Vec<u64>,
}

/// Per-pipeline dependency resolver.
pub struct DeferredQueue {
    window: usize,
    state: Mutex<QueueState>,
}

impl DeferredQueue {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Register a unit for (node, request).
    ///
    /// Fails with `DuplicateRegistration` when a non-preemptable unit is
    /// already active for the pair, unless the new unit itself is
    /// preemptable. Dependencies that are already satisfied (a signaled
    /// fence, a written property, a lookback past the first request)
    /// count immediately; a fully-satisfied unit is returned as `Ready`
    /// without ever being parked.
    pub fn register(
        &self,
        node: NodeId,
        request: u64,
        unit: DependencyUnit,
        pool: &MetadataPool,
    ) -> Result<RegisterOutcome> {
        if unit.is_empty() {
            return Err(SchedError::EmptyDependencyUnit { node, request });
        }
        for dep in unit.properties() {
            if dep.offset as usize > self.window {
                return Err(SchedError::OffsetOutOfWindow {
                    offset: dep.offset,
                    window: self.window,
                });
            }
        }

        let mut state = self.state.lock().expect("deferred queue poisoned");

        // Duplicate detection. Racing units are allowed only when all but
        // one of the contenders is preemptable.
        let owner = (node, request);
        {
            let QueueState {
                units,
                preemptable,
                by_owner,
                ..
            } = &mut *state;
            if let Some(ids) = by_owner.get_mut(&owner) {
                ids.retain(|id| units.contains_key(id));
                let all_existing_preemptable = ids
                    .iter()
                    .all(|id| preemptable.get(id).copied().unwrap_or(false));
                if !ids.is_empty() && !unit.is_preemptable() && !all_existing_preemptable {
                    return Err(SchedError::DuplicateRegistration { node, request });
                }
            }
        }

        // Evaluate satisfaction under the queue lock: a producer that
        // fires concurrently will block on this lock and observe the
        // waiter entries we are about to insert.
        let mut fence_errored = false;
        let mut pending_fences = Vec::new();
        for fence in unit.fences() {
            match fence.outcome() {
                Some(FenceOutcome::Success) => {}
                Some(FenceOutcome::Error) => fence_errored = true,
                None => pending_fences.push(fence.id()),
            }
        }
        let mut pending_props = Vec::new();
        for dep in unit.properties() {
            match dep.effective_request(request) {
                None => {} // predates history; trivially satisfied
                Some(target) => {
                    if !pool.contains(dep.pool, dep.id, target) {
                        pending_props.push((dep.pool, dep.id, target));
                    }
                }
            }
        }

        if fence_errored {
            // Dispatching (even on the error path) cancels racing
            // siblings.
            if let Some(siblings) = state.by_owner.remove(&owner) {
                for sibling in siblings {
                    state.unlink(sibling);
                }
            }
            return Ok(RegisterOutcome::Errored(Job {
                node,
                request,
                stage: unit.next_stage(),
                error_path: true,
            }));
        }

        if pending_fences.is_empty() && pending_props.is_empty() {
            if let Some(siblings) = state.by_owner.remove(&owner) {
                for sibling in siblings {
                    state.unlink(sibling);
                }
            }
            return Ok(RegisterOutcome::Ready(Job {
                node,
                request,
                stage: unit.next_stage(),
                error_path: false,
            }));
        }

        let unit_id = state.next_unit;
        state.next_unit += 1;
        for fence in &pending_fences {
            state.fence_waiters.entry(*fence).or_default().push(unit_id);
        }
        for key in &pending_props {
            state.property_waiters.entry(*key).or_default().push(unit_id);
        }
        state.units.insert(
            unit_id,
            UnitRecord {
                node,
                request,
                next_stage: unit.next_stage(),
                remaining: pending_fences.len() + pending_props.len(),
                waiting_fences: pending_fences,
                waiting_props: pending_props,
            },
        );
        state.preemptable.insert(unit_id, unit.is_preemptable());
        state.by_owner.entry(owner).or_default().push(unit_id);
        state.by_request.entry(request).or_default().push(unit_id);
        Ok(RegisterOutcome::Deferred)
    }

    /// Resolve every unit waiting on `fence`. Success decrements each
    /// waiter's unresolved count; error resolves the waiters through the
    /// error path and reports their requests for error marking.
    pub fn on_fence_signaled(&self, fence: FenceId, outcome: FenceOutcome) -> FenceResolution {
        let mut state = self.state.lock().expect("deferred queue poisoned");
        let mut resolution = FenceResolution::default();
        let Some(waiters) = state.fence_waiters.remove(&fence) else {
            return resolution;
        };
        for unit_id in waiters {
            if !state.units.contains_key(&unit_id) {
                continue; // cancelled or already dispatched
            }
            match outcome {
                FenceOutcome::Error => {
                    if let Some(job) = state.dispatch(unit_id, true) {
                        resolution.errored_requests.push(job.request);
                        resolution.jobs.push(job);
                    }
                }
                FenceOutcome::Success => {
                    let ready = {
                        let record = state.units.get_mut(&unit_id).expect("checked above");
                        record.remaining -= 1;
                        record.remaining == 0
                    };
                    if ready {
                        if let Some(job) = state.dispatch(unit_id, false) {
                            resolution.jobs.push(job);
                        }
                    }
                }
            }
        }
        resolution
    }

    /// Resolve every unit whose property dependency matches this write.
    pub fn on_property_written(
        &self,
        pool: PropertyPool,
        id: PropertyId,
        request: u64,
    ) -> Vec<Job> {
        let key: PropKey = if pool == PropertyPool::Usecase {
            (pool, id, 0)
        } else {
            (pool, id, request)
        };
        let mut state = self.state.lock().expect("deferred queue poisoned");
        let mut jobs = Vec::new();
        let Some(waiters) = state.property_waiters.remove(&key) else {
            return jobs;
        };
        for unit_id in waiters {
            if !state.units.contains_key(&unit_id) {
                continue;
            }
            let ready = {
                let record = state.units.get_mut(&unit_id).expect("checked above");
                record.remaining -= 1;
                record.remaining == 0
            };
            if ready {
                if let Some(job) = state.dispatch(unit_id, false) {
                    jobs.push(job);
                }
            }
        }
        jobs
    }

    /// Force-resolve every still-registered unit for `request` through the
    /// error path, regardless of satisfaction. Used by flush and fatal
    /// error handling.
    pub fn mark_request_error(&self, request: u64) -> Vec<Job> {
        let mut state = self.state.lock().expect("deferred queue poisoned");
        let mut jobs = Vec::new();
        let Some(ids) = state.by_request.remove(&request) else {
            return jobs;
        };
        for unit_id in ids {
            if let Some(job) = state.dispatch(unit_id, true) {
                jobs.push(job);
            }
        }
        jobs
    }

    /// Number of units currently parked.
    pub fn pending_units(&self) -> usize {
        self.state.lock().expect("deferred queue poisoned").units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::FenceRegistry;
    use crate::metadata::PropertyValue;

    fn setup() -> (DeferredQueue, MetadataPool, FenceRegistry) {
        (DeferredQueue::new(4), MetadataPool::new(4), FenceRegistry::new())
    }

    #[test]
    fn test_empty_unit_rejected() {
        let (queue, pool, _) = setup();
        let unit = DependencyUnit::builder(Stage(1)).build();
        let err = queue.register(NodeId(0), 1, unit, &pool).unwrap_err();
        assert!(matches!(err, SchedError::EmptyDependencyUnit { .. }));
    }

    #[test]
    fn test_conjunctive_resolution() {
        let (queue, pool, fences) = setup();
        let f1 = fences.create(1, "a");
        let f2 = fences.create(1, "b");
        let unit = DependencyUnit::builder(Stage(1))
            .await_fence(f1.clone())
            .await_fence(f2.clone())
            .await_property(PropertyPool::PerFrame, PropertyId::SensorExposure)
            .build();
        assert!(matches!(
            queue.register(NodeId(0), 1, unit, &pool).unwrap(),
            RegisterOutcome::Deferred
        ));

        // Two of three resolved: nothing dispatches.
        f1.signal(FenceOutcome::Success);
        assert!(queue
            .on_fence_signaled(f1.id(), FenceOutcome::Success)
            .jobs
            .is_empty());
        pool.write(
            PropertyPool::PerFrame,
            PropertyId::SensorExposure,
            1,
            PropertyValue::U32(10),
        )
        .unwrap();
        assert!(queue
            .on_property_written(PropertyPool::PerFrame, PropertyId::SensorExposure, 1)
            .is_empty());

        // The last dependency triggers exactly one job.
        f2.signal(FenceOutcome::Success);
        let resolution = queue.on_fence_signaled(f2.id(), FenceOutcome::Success);
        assert_eq!(resolution.jobs.len(), 1);
        assert_eq!(resolution.jobs[0].stage, Stage(1));
        assert!(!resolution.jobs[0].error_path);
        assert_eq!(queue.pending_units(), 0);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (queue, pool, fences) = setup();
        let f = fences.create(1, "a");
        let unit = |fence: &crate::fence::Fence| {
            DependencyUnit::builder(Stage(1))
                .await_fence(fence.clone())
                .build()
        };
        queue.register(NodeId(0), 1, unit(&f), &pool).unwrap();
        let err = queue.register(NodeId(0), 1, unit(&f), &pool).unwrap_err();
        assert!(matches!(err, SchedError::DuplicateRegistration { .. }));
        // A different request for the same node is fine.
        queue.register(NodeId(0), 2, unit(&f), &pool).unwrap();
    }

    #[test]
    fn test_preemptable_race_winner_cancels_loser() {
        let (queue, pool, fences) = setup();
        let fast = fences.create(1, "fast");
        let slow = fences.create(1, "slow");
        let primary = DependencyUnit::builder(Stage(1))
            .await_fence(slow.clone())
            .build();
        let fallback = DependencyUnit::builder(Stage(2))
            .await_fence(fast.clone())
            .preemptable()
            .build();
        queue.register(NodeId(0), 1, primary, &pool).unwrap();
        queue.register(NodeId(0), 1, fallback, &pool).unwrap();
        assert_eq!(queue.pending_units(), 2);

        fast.signal(FenceOutcome::Success);
        let resolution = queue.on_fence_signaled(fast.id(), FenceOutcome::Success);
        assert_eq!(resolution.jobs.len(), 1);
        assert_eq!(resolution.jobs[0].stage, Stage(2));
        // The loser was cancelled along with the win.
        assert_eq!(queue.pending_units(), 0);
        slow.signal(FenceOutcome::Success);
        assert!(queue
            .on_fence_signaled(slow.id(), FenceOutcome::Success)
            .jobs
            .is_empty());
    }

    #[test]
    fn test_already_satisfied_dependencies_run_immediately() {
        let (queue, pool, fences) = setup();
        let f = fences.create(3, "early");
        f.signal(FenceOutcome::Success);
        pool.write(
            PropertyPool::Internal,
            PropertyId::StatsConfig,
            3,
            PropertyValue::U32(1),
        )
        .unwrap();
        let unit = DependencyUnit::builder(Stage(4))
            .await_fence(f)
            .await_property(PropertyPool::Internal, PropertyId::StatsConfig)
            .build();
        match queue.register(NodeId(1), 3, unit, &pool).unwrap() {
            RegisterOutcome::Ready(job) => {
                assert_eq!(job.stage, Stage(4));
                assert!(!job.error_path);
            }
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[test]
    fn test_lookback_before_history_is_satisfied() {
        let (queue, pool, _) = setup();
        // Request 1 looking back 2 requests: no such history, runs now.
        let unit = DependencyUnit::builder(Stage(1))
            .await_property_at(PropertyPool::PerFrame, PropertyId::LensPosition, 2)
            .build();
        assert!(matches!(
            queue.register(NodeId(0), 1, unit, &pool).unwrap(),
            RegisterOutcome::Ready(_)
        ));
    }

    #[test]
    fn test_fence_error_resolves_error_path() {
        let (queue, pool, fences) = setup();
        let f = fences.create(2, "bad");
        let unit = DependencyUnit::builder(Stage(1)).await_fence(f.clone()).build();
        queue.register(NodeId(0), 2, unit, &pool).unwrap();

        f.signal(FenceOutcome::Error);
        let resolution = queue.on_fence_signaled(f.id(), FenceOutcome::Error);
        assert_eq!(resolution.jobs.len(), 1);
        assert!(resolution.jobs[0].error_path);
        assert_eq!(resolution.errored_requests, vec![2]);
    }

    #[test]
    fn test_fence_already_errored_at_registration() {
        let (queue, pool, fences) = setup();
        let f = fences.create(2, "bad");
        f.signal(FenceOutcome::Error);
        let unit = DependencyUnit::builder(Stage(1)).await_fence(f).build();
        match queue.register(NodeId(0), 2, unit, &pool).unwrap() {
            RegisterOutcome::Errored(job) => assert!(job.error_path),
            other => panic!("expected Errored, got {:?}", other),
        }
    }

    #[test]
    fn test_error_dominance_over_unsignaled_fences() {
        let (queue, pool, fences) = setup();
        let f = fences.create(5, "never");
        let unit = DependencyUnit::builder(Stage(1)).await_fence(f.clone()).build();
        queue.register(NodeId(0), 5, unit, &pool).unwrap();

        let jobs = queue.mark_request_error(5);
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].error_path);
        assert_eq!(queue.pending_units(), 0);

        // A late signal of the abandoned fence is a no-op.
        f.signal(FenceOutcome::Success);
        assert!(queue
            .on_fence_signaled(f.id(), FenceOutcome::Success)
            .jobs
            .is_empty());
    }

    #[test]
    fn test_future_property_dependency() {
        let (queue, pool, _) = setup();
        let unit = DependencyUnit::builder(Stage(1))
            .await_future_property(PropertyPool::PerFrame, PropertyId::AecFrameControl, 1)
            .build();
        queue.register(NodeId(0), 3, unit, &pool).unwrap();

        // Writing for request 3 itself does not resolve it.
        pool.write(
            PropertyPool::PerFrame,
            PropertyId::AecFrameControl,
            3,
            PropertyValue::U32(0),
        )
        .unwrap();
        assert!(queue
            .on_property_written(PropertyPool::PerFrame, PropertyId::AecFrameControl, 3)
            .is_empty());

        // Writing for request 4 does.
        pool.write(
            PropertyPool::PerFrame,
            PropertyId::AecFrameControl,
            4,
            PropertyValue::U32(0),
        )
        .unwrap();
        let jobs =
            queue.on_property_written(PropertyPool::PerFrame, PropertyId::AecFrameControl, 4);
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn test_offset_beyond_window_rejected() {
        let (queue, pool, _) = setup();
        let unit = DependencyUnit::builder(Stage(1))
            .await_property_at(PropertyPool::PerFrame, PropertyId::LensPosition, 9)
            .build();
        let err = queue.register(NodeId(0), 20, unit, &pool).unwrap_err();
        assert!(matches!(err, SchedError::OffsetOutOfWindow { .. }));
    }
}
