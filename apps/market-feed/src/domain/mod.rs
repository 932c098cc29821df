//! Domain Layer - Core market data types and subscription bookkeeping.
//!
//! This layer contains the pure types and state machines of the feed.
//! Nothing here performs I/O or depends on the async runtime.

/// Market data types (ticks, instruments, chart projection).
pub mod market;

/// Bounded rolling tick storage.
pub mod tick_buffer;

/// Reference-counted per-symbol subscription state machine.
pub mod subscription;
