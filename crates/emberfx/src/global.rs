//! # Per-Effect Global State
//!
//! Shared counters and the rendering-priority registry for one effect
//! instance. Mutated only from single-threaded phases of the frame - the
//! worker fan-out never sees this type.

use crate::container::ContainerId;
use crate::error::{EffectError, EffectResult};

/// Live-instance accounting plus the priority-slot registry.
#[derive(Debug)]
pub struct InstanceGlobal {
    /// Number of live (created, not yet reclaimed) instances.
    living: usize,
    /// Priority slot -> container responsible for drawing it.
    /// Last write wins on collision.
    rendered_containers: Box<[Option<ContainerId>]>,
}

impl InstanceGlobal {
    /// Creates global state with `priority_slots` registry entries.
    #[must_use]
    pub fn new(priority_slots: usize) -> Self {
        Self {
            living: 0,
            rendered_containers: vec![None; priority_slots].into_boxed_slice(),
        }
    }

    /// Records one instance creation. Paired with exactly one
    /// [`dec_instance_count`](Self::dec_instance_count) at reclamation.
    #[inline]
    pub fn inc_instance_count(&mut self) {
        self.living += 1;
    }

    /// Records one instance retirement.
    #[inline]
    pub fn dec_instance_count(&mut self) {
        debug_assert!(self.living > 0, "instance count underflow");
        if self.living == 0 {
            tracing::error!("instance count underflow");
            return;
        }
        self.living -= 1;
    }

    /// Number of live instances across the whole tree.
    #[inline]
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.living
    }

    /// Registers `container` as the drawer for `slot`, last write wins.
    ///
    /// Registration is an explicit step of tree instantiation, not a
    /// construction side effect, so the dependency stays visible.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::PrioritySlotOutOfRange`] when `slot` is
    /// outside the registry.
    pub fn register_priority(&mut self, slot: usize, container: ContainerId) -> EffectResult<()> {
        let capacity = self.rendered_containers.len();
        let Some(entry) = self.rendered_containers.get_mut(slot) else {
            return Err(EffectError::PrioritySlotOutOfRange { slot, capacity });
        };
        *entry = Some(container);
        Ok(())
    }

    /// The container registered at `slot`, if any.
    #[inline]
    #[must_use]
    pub fn rendered_container(&self, slot: usize) -> Option<ContainerId> {
        self.rendered_containers.get(slot).copied().flatten()
    }

    /// Number of registry slots.
    #[inline]
    #[must_use]
    pub fn priority_slots(&self) -> usize {
        self.rendered_containers.len()
    }
}
