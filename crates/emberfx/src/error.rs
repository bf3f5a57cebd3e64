//! # Scheduler Error Types
//!
//! Errors here are environmental: bad configuration, malformed node
//! topology, out-of-range indices from the caller. Lifecycle and
//! structural invariants are NOT errors - they are logic bugs, enforced
//! with debug assertions and logged as unreachable in release builds.
//! Pool exhaustion is not an error either; a failed spawn is dropped.

use thiserror::Error;

/// Errors that can occur building or addressing the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EffectError {
    /// Configuration rejected at validation time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The flattened node list does not describe a tree.
    #[error("malformed node tree: {0}")]
    MalformedNodeTree(String),

    /// A rendering priority slot outside the registry.
    #[error("rendering priority slot {slot} out of range (capacity {capacity})")]
    PrioritySlotOutOfRange {
        /// The requested slot.
        slot: usize,
        /// The registry capacity.
        capacity: usize,
    },

    /// A child slot index outside a container's fixed arity.
    #[error("child index {index} out of range (arity {arity})")]
    ChildIndexOutOfRange {
        /// The requested child slot.
        index: usize,
        /// The container's fixed child count.
        arity: usize,
    },

    /// A container id that does not name a live container.
    #[error("container {0} does not exist")]
    ContainerNotFound(u32),

    /// A group id that does not name a live group.
    #[error("group {0} does not exist")]
    GroupNotFound(u32),
}

/// Result type for scheduler operations.
pub type EffectResult<T> = Result<T, EffectError>;
