//! # EMBERFX Core Kernel
//!
//! Allocation-free building blocks for the particle scheduler:
//! - Pre-sized slot pools that recycle storage instead of hitting the
//!   allocator every spawn
//! - A persistent worker pool with a synchronous barrier join
//!
//! ## Architecture Rules
//!
//! 1. **No heap allocations in the hot path** - slots are pre-allocated and
//!    recycled through a free list
//! 2. **The frame thread owns all structure** - workers only ever receive
//!    work they own outright
//! 3. **Every fan-out is joined** - `wait_all` returns only after every task
//!    pushed before it has completed

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod memory;
pub mod sync;

pub use memory::{Slot, SlotPool};
pub use sync::WorkerPool;
