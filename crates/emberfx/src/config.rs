//! # Scheduler Configuration
//!
//! Loaded once at startup, validated before the first frame. Nothing in
//! here changes while the tree is live.

use serde::{Deserialize, Serialize};

use crate::error::{EffectError, EffectResult};

/// Configuration for an [`EffectTree`](crate::tree::EffectTree).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of persistent worker threads.
    pub worker_threads: usize,
    /// Active-instance count at which a container switches from the
    /// sequential update path to the worker fan-out. Below this the
    /// fan-out costs more than it buys.
    pub parallel_threshold: usize,
    /// Capacity of the pooled (non-root) instance region.
    pub instance_capacity: usize,
    /// Number of rendering-priority slots in the registry.
    pub priority_slots: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            parallel_threshold: 64,
            instance_capacity: 8192,
            priority_slots: 64,
        }
    }
}

impl SchedulerConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::InvalidConfig`] when a field is unusable:
    /// zero worker threads, zero instance capacity, or zero priority
    /// slots.
    pub fn validate(&self) -> EffectResult<()> {
        if self.worker_threads == 0 {
            return Err(EffectError::InvalidConfig(
                "worker_threads must be at least 1".into(),
            ));
        }
        if self.instance_capacity == 0 {
            return Err(EffectError::InvalidConfig(
                "instance_capacity must be at least 1".into(),
            ));
        }
        if self.priority_slots == 0 {
            return Err(EffectError::InvalidConfig(
                "priority_slots must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
