//! Bounded fixed-block memory pool.
//!
//! Every queued packet and per-element record of a session is carved out of
//! one budgeted arena so a misbehaving peer cannot run the host out of
//! memory. Blocks come in a fixed ladder of size classes; an allocation
//! rounds up to the smallest class that fits and a free returns the block to
//! its class list. Blocks are never merged or split.

mod pool;

pub use pool::{BlockPool, BlockRef, ClassStats, MemError, MemStats, NUM_CLASSES};
