//! # Memory Management
//!
//! Pre-sized slot pools for zero-allocation instance churn.
//!
//! ## Design Philosophy
//!
//! Storage is allocated once at startup. During the frame loop:
//! - Spawning pops a recycled slot from the free list
//! - Retiring pushes the slot back, the allocator is never touched
//! - A full pool means "skip this emission", never an error

mod pool;

pub use pool::{Slot, SlotPool};
