//! Tick Buffer
//!
//! Bounded, time-ordered storage of the most recent ticks for one symbol.
//!
//! # Invariants
//!
//! - Length never exceeds the configured capacity; the oldest tick is
//!   evicted first.
//! - Epochs are strictly increasing from head to tail.
//! - Readers always observe a complete state (snapshots are taken under
//!   a read lock, mutations under a write lock).

use std::collections::{BTreeMap, VecDeque};

use parking_lot::RwLock;

use crate::domain::market::Tick;

/// Default number of ticks retained per symbol.
pub const DEFAULT_TICK_CAPACITY: usize = 300;

/// Bounded rolling tick store.
///
/// # Example
///
/// ```rust
/// use market_feed::domain::market::Tick;
/// use market_feed::domain::tick_buffer::TickBuffer;
/// use rust_decimal::Decimal;
///
/// let buffer = TickBuffer::new(2);
/// for epoch in 1..=3 {
///     buffer.append(Tick::spot(epoch, Decimal::ONE));
/// }
///
/// let epochs: Vec<_> = buffer.snapshot().iter().map(|t| t.epoch).collect();
/// assert_eq!(epochs, vec![2, 3]);
/// ```
#[derive(Debug)]
pub struct TickBuffer {
    capacity: usize,
    ticks: RwLock<VecDeque<Tick>>,
}

impl Default for TickBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_CAPACITY)
    }
}

impl TickBuffer {
    /// Create a buffer holding at most `capacity` ticks (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ticks: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a live tick at the tail.
    ///
    /// Returns `false` without modifying the buffer when the tick is not
    /// newer than the last stored tick.
    pub fn append(&self, tick: Tick) -> bool {
        let mut ticks = self.ticks.write();

        if ticks.back().is_some_and(|last| tick.epoch <= last.epoch) {
            return false;
        }

        ticks.push_back(tick);
        while ticks.len() > self.capacity {
            ticks.pop_front();
        }
        true
    }

    /// Merge a historical batch into the buffer.
    ///
    /// The result is ordered by epoch with one tick per epoch. Ticks already
    /// stored win over batch ticks with the same epoch, and only the newest
    /// `capacity` ticks are kept. Returns the resulting length.
    pub fn seed<I>(&self, batch: I) -> usize
    where
        I: IntoIterator<Item = Tick>,
    {
        let mut ticks = self.ticks.write();

        let mut merged: BTreeMap<i64, Tick> = batch.into_iter().map(|t| (t.epoch, t)).collect();
        merged.extend(ticks.drain(..).map(|t| (t.epoch, t)));

        let skip = merged.len().saturating_sub(self.capacity);
        ticks.extend(merged.into_values().skip(skip));
        ticks.len()
    }

    /// Copy of the buffer contents, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Tick> {
        self.ticks.read().iter().copied().collect()
    }

    /// Most recent tick, if any.
    #[must_use]
    pub fn latest(&self) -> Option<Tick> {
        self.ticks.read().back().copied()
    }

    /// Epoch of the most recent tick, if any.
    #[must_use]
    pub fn last_epoch(&self) -> Option<i64> {
        self.ticks.read().back().map(|t| t.epoch)
    }

    /// Number of stored ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ticks.read().len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.read().is_empty()
    }

    /// Maximum number of stored ticks.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove every tick.
    pub fn clear(&self) {
        self.ticks.write().clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
