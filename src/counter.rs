//! Sliding-window GET counter.
//!
//! A ring of per-interval counts plus a running total, all behind one mutex.
//! Request handlers call [`SlidingWindowCounter::increment`], the rotation
//! scheduler calls [`SlidingWindowCounter::rotate`] once per precision tick,
//! and the stats endpoint reads [`SlidingWindowCounter::snapshot`].

use crate::error::StatError;
use crate::util::ring_buffer::{self, RingBuffer};
use crate::util::state_store::{PersistedState, STATE_VERSION};
use parking_lot::Mutex;
use tracing::info;

#[derive(Debug)]
struct Inner {
    ring: RingBuffer,
    running_total: u64,
}

#[derive(Debug)]
pub struct SlidingWindowCounter {
    inner: Mutex<Inner>,
}

/// Point-in-time view of the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Everything folded in by `rotate()` since creation or reset.
    pub total: u64,
    /// Count in the current, not yet retired, interval.
    pub pending: u64,
    /// Sum over the last `capacity` intervals, current one included.
    pub window: u64,
}

impl SlidingWindowCounter {
    pub fn new(capacity: usize) -> Result<Self, StatError> {
        Ok(Self {
            inner: Mutex::new(Inner { ring: RingBuffer::new(capacity)?, running_total: 0 }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().ring.capacity()
    }

    pub fn increment(&self) {
        self.increment_by(1);
    }

    pub fn increment_by(&self, n: u64) {
        let mut inner = self.inner.lock();
        let slot = inner.ring.current_mut();
        *slot = slot.saturating_add(n);
    }

    /// Retire the current interval into the running total and open a fresh one.
    pub fn rotate(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.running_total = inner.running_total.saturating_add(inner.ring.current());
        inner.ring.advance();
        *inner.ring.current_mut() = 0;
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            total: inner.running_total,
            pending: inner.ring.current(),
            window: inner.ring.sum(),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.ring.clear();
        inner.running_total = 0;
    }

    pub fn to_state(&self) -> PersistedState {
        let inner = self.inner.lock();
        PersistedState {
            version: STATE_VERSION,
            capacity: inner.ring.capacity(),
            cursor: inner.ring.cursor(),
            running_total: inner.running_total,
            slots: inner.ring.slots().to_vec(),
            saved_at: Some(chrono::Local::now().to_rfc3339()),
        }
    }

    /// Build a counter from a decoded checkpoint.
    ///
    /// When the checkpoint was taken with a different capacity the slots are
    /// resized: oldest-first order is preserved, the newest `min(old, new)`
    /// intervals survive, and the restored current slot stays current.
    /// `running_total` is carried over unchanged.
    pub fn from_state(state: PersistedState, capacity: usize) -> Result<Self, StatError> {
        let ring = if state.capacity == capacity {
            RingBuffer::from_parts(state.slots, state.cursor)
                .map_err(|e| StatError::PersistenceCorrupt(e.to_string()))?
        } else {
            let old = RingBuffer::from_parts(state.slots, state.cursor)
                .map_err(|e| StatError::PersistenceCorrupt(e.to_string()))?;
            info!(
                from = state.capacity,
                to = capacity,
                "window capacity changed since last run; resizing restored slots"
            );
            resize(&old, capacity)?
        };
        Ok(Self { inner: Mutex::new(Inner { ring, running_total: state.running_total }) })
    }
}

fn resize(old: &RingBuffer, capacity: usize) -> Result<RingBuffer, StatError> {
    ring_buffer::check_capacity(capacity)?;
    let ordered: Vec<u64> = old.iter_oldest_first().collect();
    let keep = ordered.len().min(capacity);
    let mut slots = vec![0; capacity - keep];
    slots.extend_from_slice(&ordered[ordered.len() - keep..]);
    RingBuffer::from_parts(slots, capacity.saturating_sub(1))
}
