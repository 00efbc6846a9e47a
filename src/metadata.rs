//! Versioned, per-request property storage.
//!
//! Every property is identified by a [`PropertyId`] and lives in one of
//! four pools. The per-request pools keep one value per in-flight request
//! in a ring of `2 * queue_depth` slots, so a consumer may read the value
//! a producer wrote up to `queue_depth` requests in the past. The usecase
//! pool is session-scoped: a single value per id, independent of requests.
//!
//! Values are a tagged union ([`PropertyValue`]) rather than opaque
//! pointers, so reads and writes are checked at runtime instead of by
//! convention.
//!
//! Reads are non-blocking and return `None` when the value has not been
//! written yet (or was recycled); a node that needs to wait expresses the
//! wait as a property dependency on its [`DependencyUnit`] instead of
//! polling.
//!
//! [`DependencyUnit`]: crate::scheduler::DependencyUnit

use crate::error::{Result, SchedError};
use crate::stripe::StripeGeometry;
use crate::types::{ExposureSettings, Region};
use std::collections::HashMap;
use std::sync::Mutex;

/// Storage pool a property belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyPool {
    /// Per-request results visible to the framework.
    PerFrame,
    /// Per-request values exchanged between nodes only.
    Internal,
    /// Session-scoped values written once per stream configuration.
    Usecase,
    /// Per-request diagnostics.
    Debug,
}

/// Identifies one property within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyId {
    /// Active sensor mode index.
    SensorMode,
    /// Exposure actually applied by the sensor for a frame.
    SensorExposure,
    /// Frame duration in nanoseconds.
    FrameDuration,
    /// Exposure decision for the next frame, produced by stats processing.
    AecFrameControl,
    /// Focus regions requested for a frame.
    AfFrameControl,
    /// Stripe geometry the ISP programmed for a frame.
    StatsConfig,
    /// Left hardware stripe payload.
    StatsLeftStripe,
    /// Right hardware stripe payload.
    StatsRightStripe,
    /// Parsed statistics summary for a frame.
    StatsParsed,
    /// Lens position commanded by autofocus.
    LensPosition,
}

/// Strongly-typed property payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    U32(u32),
    U64(u64),
    F32(f32),
    Bool(bool),
    Exposure(ExposureSettings),
    Regions(Vec<Region>),
    Geometry(StripeGeometry),
    Blob(Vec<u8>),
}

impl PropertyValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            PropertyValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            PropertyValue::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_exposure(&self) -> Option<ExposureSettings> {
        match self {
            PropertyValue::Exposure(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_regions(&self) -> Option<&[Region]> {
        match self {
            PropertyValue::Regions(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_geometry(&self) -> Option<StripeGeometry> {
        match self {
            PropertyValue::Geometry(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            PropertyValue::Blob(v) => Some(v),
            _ => None,
        }
    }
}

/// Ring of `2W` entries indexed by `request % 2W`. Each entry remembers
/// which request wrote it so stale slots read as absent.
struct Ring {
    entries: Vec<Option<(u64, PropertyValue)>>,
}

impl Ring {
    fn new(slots: usize) -> Self {
        Self {
            entries: vec![None; slots],
        }
    }
}

#[derive(Default)]
struct PoolInner {
    per_frame: HashMap<PropertyId, Ring>,
    internal: HashMap<PropertyId, Ring>,
    debug: HashMap<PropertyId, Ring>,
    usecase: HashMap<PropertyId, PropertyValue>,
}

impl PoolInner {
    fn ring_map(&mut self, pool: PropertyPool) -> &mut HashMap<PropertyId, Ring> {
        match pool {
            PropertyPool::PerFrame => &mut self.per_frame,
            PropertyPool::Internal => &mut self.internal,
            PropertyPool::Debug => &mut self.debug,
            PropertyPool::Usecase => unreachable!("usecase pool is not ring storage"),
        }
    }

    fn ring_map_ref(&self, pool: PropertyPool) -> &HashMap<PropertyId, Ring> {
        match pool {
            PropertyPool::PerFrame => &self.per_frame,
            PropertyPool::Internal => &self.internal,
            PropertyPool::Debug => &self.debug,
            PropertyPool::Usecase => unreachable!("usecase pool is not ring storage"),
        }
    }
}

/// Typed per-request key-value storage with historical lookback.
pub struct MetadataPool {
    /// Nominal request window `W`; lookback offsets beyond this are
    /// rejected.
    window: usize,
    /// Ring length `2W`, tolerating nodes that finish late relative to
    /// the window's nominal advance.
    slots: usize,
    inner: Mutex<PoolInner>,
}

impl MetadataPool {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            slots: window * 2,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Write a value for `request`. Producers write at most once per
    /// request per property; a second write fails with `AlreadyWritten`.
    /// Usecase-pool writes are session-scoped and may be replaced.
    pub fn write(
        &self,
        pool: PropertyPool,
        id: PropertyId,
        request: u64,
        value: PropertyValue,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("metadata pool poisoned");
        if pool == PropertyPool::Usecase {
            inner.usecase.insert(id, value);
            return Ok(());
        }
        let slots = self.slots;
        let ring = inner
            .ring_map(pool)
            .entry(id)
            .or_insert_with(|| Ring::new(slots));
        let idx = (request % slots as u64) as usize;
        if let Some((occupant, _)) = ring.entries[idx].as_ref() {
            if *occupant == request {
                return Err(SchedError::AlreadyWritten { id, request });
            }
        }
        ring.entries[idx] = Some((request, value));
        Ok(())
    }

    /// Read the value written for `request - offset`. Returns `Ok(None)`
    /// when nothing has been written (or the slot was recycled); offsets
    /// beyond the window are an error.
    pub fn read(
        &self,
        pool: PropertyPool,
        id: PropertyId,
        request: u64,
        offset: u64,
    ) -> Result<Option<PropertyValue>> {
        if offset as usize > self.window {
            return Err(SchedError::OffsetOutOfWindow {
                offset,
                window: self.window,
            });
        }
        let inner = self.inner.lock().expect("metadata pool poisoned");
        if pool == PropertyPool::Usecase {
            return Ok(inner.usecase.get(&id).cloned());
        }
        let Some(target) = request.checked_sub(offset) else {
            return Ok(None);
        };
        let idx = (target % self.slots as u64) as usize;
        Ok(inner.ring_map_ref(pool).get(&id).and_then(|ring| {
            ring.entries[idx]
                .as_ref()
                .filter(|(occupant, _)| *occupant == target)
                .map(|(_, value)| value.clone())
        }))
    }

    /// Whether a value exists for exactly `request` (no offset applied).
    /// Used by the scheduler to test dependency satisfaction at
    /// registration time.
    pub fn contains(&self, pool: PropertyPool, id: PropertyId, request: u64) -> bool {
        let inner = self.inner.lock().expect("metadata pool poisoned");
        if pool == PropertyPool::Usecase {
            return inner.usecase.contains_key(&id);
        }
        let idx = (request % self.slots as u64) as usize;
        inner
            .ring_map_ref(pool)
            .get(&id)
            .and_then(|ring| ring.entries[idx].as_ref())
            .is_some_and(|(occupant, _)| *occupant == request)
    }

    /// Drop every per-request entry belonging to `request`. Called once
    /// when the request's slot is reclaimed for a new request.
    pub fn purge(&self, request: u64) {
        let mut inner = self.inner.lock().expect("metadata pool poisoned");
        let idx = (request % self.slots as u64) as usize;
        let inner = &mut *inner;
        for map in [&mut inner.per_frame, &mut inner.internal, &mut inner.debug] {
            for ring in map.values_mut() {
                if ring.entries[idx]
                    .as_ref()
                    .is_some_and(|(occupant, _)| *occupant == request)
                {
                    ring.entries[idx] = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MetadataPool {
        MetadataPool::new(4)
    }

    #[test]
    fn test_write_then_read() {
        let pool = pool();
        pool.write(
            PropertyPool::PerFrame,
            PropertyId::LensPosition,
            3,
            PropertyValue::F32(0.25),
        )
        .unwrap();
        let value = pool
            .read(PropertyPool::PerFrame, PropertyId::LensPosition, 3, 0)
            .unwrap();
        assert_eq!(value.and_then(|v| v.as_f32()), Some(0.25));
    }

    #[test]
    fn test_double_write_rejected() {
        let pool = pool();
        pool.write(
            PropertyPool::PerFrame,
            PropertyId::SensorMode,
            1,
            PropertyValue::U32(0),
        )
        .unwrap();
        let err = pool
            .write(
                PropertyPool::PerFrame,
                PropertyId::SensorMode,
                1,
                PropertyValue::U32(1),
            )
            .unwrap_err();
        assert!(matches!(err, SchedError::AlreadyWritten { request: 1, .. }));
    }

    #[test]
    fn test_historical_lookback() {
        let pool = pool();
        pool.write(
            PropertyPool::PerFrame,
            PropertyId::LensPosition,
            5,
            PropertyValue::F32(0.5),
        )
        .unwrap();
        // Request 7 reads the value as it was two requests ago.
        let value = pool
            .read(PropertyPool::PerFrame, PropertyId::LensPosition, 7, 2)
            .unwrap();
        assert_eq!(value.and_then(|v| v.as_f32()), Some(0.5));
    }

    #[test]
    fn test_offset_beyond_window_rejected() {
        let pool = pool();
        let err = pool
            .read(PropertyPool::PerFrame, PropertyId::LensPosition, 20, 5)
            .unwrap_err();
        assert!(matches!(err, SchedError::OffsetOutOfWindow { offset: 5, .. }));
    }

    #[test]
    fn test_unwritten_reads_none() {
        let pool = pool();
        let value = pool
            .read(PropertyPool::Internal, PropertyId::StatsConfig, 9, 0)
            .unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_underflow_reads_none() {
        let pool = pool();
        let value = pool
            .read(PropertyPool::PerFrame, PropertyId::LensPosition, 1, 2)
            .unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_usecase_pool_is_session_scoped() {
        let pool = pool();
        pool.write(
            PropertyPool::Usecase,
            PropertyId::SensorMode,
            1,
            PropertyValue::U32(2),
        )
        .unwrap();
        // Readable from any request, and replaceable.
        let value = pool
            .read(PropertyPool::Usecase, PropertyId::SensorMode, 40, 0)
            .unwrap();
        assert_eq!(value.and_then(|v| v.as_u32()), Some(2));
        pool.write(
            PropertyPool::Usecase,
            PropertyId::SensorMode,
            2,
            PropertyValue::U32(3),
        )
        .unwrap();
    }

    #[test]
    fn test_purge_clears_request_entries() {
        let pool = pool();
        pool.write(
            PropertyPool::PerFrame,
            PropertyId::StatsParsed,
            2,
            PropertyValue::F32(9.0),
        )
        .unwrap();
        pool.purge(2);
        assert!(!pool.contains(PropertyPool::PerFrame, PropertyId::StatsParsed, 2));
        // Slot is writable again for the reused request id.
        pool.write(
            PropertyPool::PerFrame,
            PropertyId::StatsParsed,
            2,
            PropertyValue::F32(1.0),
        )
        .unwrap();
    }

    #[test]
    fn test_slot_reuse_invalidates_old_request() {
        let pool = pool(); // window 4, ring of 8
        pool.write(
            PropertyPool::PerFrame,
            PropertyId::StatsParsed,
            1,
            PropertyValue::F32(1.0),
        )
        .unwrap();
        // Request 9 shares the ring slot with request 1.
        pool.write(
            PropertyPool::PerFrame,
            PropertyId::StatsParsed,
            9,
            PropertyValue::F32(9.0),
        )
        .unwrap();
        let old = pool
            .read(PropertyPool::PerFrame, PropertyId::StatsParsed, 1, 0)
            .unwrap();
        assert!(old.is_none());
        let new = pool
            .read(PropertyPool::PerFrame, PropertyId::StatsParsed, 9, 0)
            .unwrap();
        assert_eq!(new.and_then(|v| v.as_f32()), Some(9.0));
    }
}
