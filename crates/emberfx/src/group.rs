//! # Instance Groups
//!
//! A group is one emission batch: the instances spawned together by a
//! single emission event, in spawn order. The group owns the two ordered
//! sequences of the lifecycle - the active list and the removing list -
//! and all transitions between them.
//!
//! ## The Two-List Contract
//!
//! Every created instance is in exactly one of the two lists, never both,
//! never neither. Reclamation (the removing-list sweep) finalizes
//! `Removing` instances one frame after they left `Active`; it only ever
//! frees `Removed` instances. An `Active` instance inside the removing
//! list is a logic bug and is treated as unreachable.

use glam::Mat4;

use crate::global::InstanceGlobal;
use crate::instance::{Instance, InstanceHandle, InstanceState, InstanceStore, WorkItem};
use crate::node::SimParams;

/// Handle to a group in the tree's group arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GroupId(u32);

impl GroupId {
    /// Raw arena index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Growable arena of groups with slot reuse.
///
/// Groups churn per emission, so their storage is recycled like instance
/// slots; unlike the instance pool the arena grows on demand - an
/// emission is never dropped for lack of a group slot.
#[derive(Debug, Default)]
pub(crate) struct GroupArena {
    /// Group storage; `None` marks a free slot.
    entries: Vec<Option<InstanceGroup>>,
    /// Free slots, reused before growing.
    free: Vec<u32>,
}

impl GroupArena {
    /// Inserts a group, reusing a free slot when one exists.
    ///
    /// # Panics
    ///
    /// Panics if the arena outgrows `u32` indices.
    pub(crate) fn insert(&mut self, group: InstanceGroup) -> GroupId {
        if let Some(index) = self.free.pop() {
            self.entries[index as usize] = Some(group);
            return GroupId(index);
        }
        let index = u32::try_from(self.entries.len()).expect("group arena overflow");
        self.entries.push(Some(group));
        GroupId(index)
    }

    /// Removes a group, freeing its slot.
    pub(crate) fn remove(&mut self, id: GroupId) -> Option<InstanceGroup> {
        let group = self.entries.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        Some(group)
    }

    /// Reads a group.
    #[inline]
    pub(crate) fn get(&self, id: GroupId) -> Option<&InstanceGroup> {
        self.entries.get(id.0 as usize)?.as_ref()
    }

    /// Mutably reads a group.
    #[inline]
    pub(crate) fn get_mut(&mut self, id: GroupId) -> Option<&mut InstanceGroup> {
        self.entries.get_mut(id.0 as usize)?.as_mut()
    }
}

/// An ordered batch of instances spawned by one emission event.
#[derive(Debug)]
pub struct InstanceGroup {
    /// The container this group belongs to.
    container: crate::container::ContainerId,
    /// Index of the effect node the container mirrors.
    node: usize,
    /// Live instances, in spawn order.
    active: Vec<InstanceHandle>,
    /// Instances on the removal path, awaiting finalization.
    removing: Vec<InstanceHandle>,
    /// Frames this group has been updated.
    frames: u64,
    /// External holder (the spawning instance, or the manager for root
    /// groups) still references this group; pruning skips it.
    referenced: bool,
}

impl InstanceGroup {
    /// Creates an empty group with the external reference held.
    pub(crate) fn new(container: crate::container::ContainerId, node: usize) -> Self {
        Self {
            container,
            node,
            active: Vec::new(),
            removing: Vec::new(),
            frames: 0,
            referenced: true,
        }
    }

    /// The container owning this group.
    #[inline]
    #[must_use]
    pub fn container(&self) -> crate::container::ContainerId {
        self.container
    }

    /// Index of the effect node this group emits for.
    #[inline]
    #[must_use]
    pub fn node(&self) -> usize {
        self.node
    }

    /// Number of live instances.
    #[inline]
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.active.len()
    }

    /// Number of instances awaiting finalization.
    #[inline]
    #[must_use]
    pub fn removing_instance_count(&self) -> usize {
        self.removing.len()
    }

    /// First live instance, if any.
    #[inline]
    #[must_use]
    pub fn get_first(&self) -> Option<InstanceHandle> {
        self.active.first().copied()
    }

    /// Live instances in spawn order.
    #[inline]
    #[must_use]
    pub fn instances(&self) -> &[InstanceHandle] {
        &self.active
    }

    /// Frames this group has been updated.
    #[inline]
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Whether an external holder still references this group.
    #[inline]
    #[must_use]
    pub fn is_referenced(&self) -> bool {
        self.referenced
    }

    /// Drops the external reference, making the group prunable once both
    /// lists drain.
    pub(crate) fn release_reference(&mut self) {
        self.referenced = false;
    }

    /// Whether pruning may delete this group.
    #[inline]
    pub(crate) fn is_prunable(&self) -> bool {
        !self.referenced && self.active.is_empty() && self.removing.is_empty()
    }

    /// Links a freshly spawned instance into the active list.
    pub(crate) fn push_instance(&mut self, handle: InstanceHandle) {
        self.active.push(handle);
    }

    /// Reclamation: sweeps the removing list.
    ///
    /// `Removing` instances become `Removed` and stay for one more sweep;
    /// `Removed` instances are unlinked, destroyed, and their storage
    /// returned (pooled) or freed (root). Groups the destroyed instance
    /// had spawned are collected into `released` so the caller can drop
    /// their external references - the group arena is not reachable from
    /// here.
    ///
    /// Returns the number of instances freed.
    pub(crate) fn remove_invalid_instances(
        &mut self,
        store: &mut InstanceStore,
        global: &mut InstanceGlobal,
        released: &mut Vec<GroupId>,
    ) -> usize {
        let mut reclaimed = 0;
        let mut index = 0;

        while index < self.removing.len() {
            let handle = self.removing[index];
            let Some(state) = store.get(handle).map(Instance::state) else {
                debug_assert!(false, "removing list holds a stale handle");
                tracing::error!("removing list holds a stale handle; dropping it");
                self.removing.remove(index);
                continue;
            };

            match state {
                InstanceState::Active => {
                    // Contract violation: must never happen.
                    debug_assert!(false, "active instance inside the removing list");
                    tracing::error!("active instance inside the removing list");
                    index += 1;
                }
                InstanceState::Removing => {
                    if let Some(instance) = store.get_mut(handle) {
                        instance.state = InstanceState::Removed;
                    }
                    index += 1;
                }
                InstanceState::Removed => {
                    self.removing.remove(index);
                    if let Some(instance) = store.release(handle) {
                        released.extend(instance.spawned_groups.iter().copied());
                    }
                    global.dec_instance_count();
                    reclaimed += 1;
                }
            }
        }

        reclaimed
    }

    /// Sequential per-frame update: reclaim, advance, tick.
    ///
    /// Returns `(instances advanced, instances reclaimed)`.
    pub(crate) fn update(
        &mut self,
        store: &mut InstanceStore,
        global: &mut InstanceGlobal,
        params: &SimParams,
        delta_frame: f32,
        shown: bool,
        released: &mut Vec<GroupId>,
    ) -> (usize, usize) {
        let reclaimed = self.remove_invalid_instances(store, global, released);

        let mut advanced = 0;
        let mut index = 0;
        while index < self.active.len() {
            let handle = self.active[index];
            let Some(instance) = store.get_mut(handle) else {
                debug_assert!(false, "active list holds a stale handle");
                tracing::error!("active list holds a stale handle; dropping it");
                self.active.remove(index);
                continue;
            };
            debug_assert!(
                instance.state == InstanceState::Active,
                "non-active instance in the active list"
            );

            instance.sim.advance(params, delta_frame, shown);
            advanced += 1;
            if instance.sim.expired() {
                instance.state = InstanceState::Removing;
            }

            if instance.state == InstanceState::Active {
                index += 1;
            } else {
                self.active.remove(index);
                self.removing.push(handle);
            }
        }

        self.frames += 1;
        (advanced, reclaimed)
    }

    /// Split-phase update, phase 1: reclaim and snapshot work items.
    ///
    /// Appends one owned [`WorkItem`] per live instance to `work`, in
    /// spawn order. Returns the number of instances reclaimed.
    pub(crate) fn begin_update_async(
        &mut self,
        store: &mut InstanceStore,
        global: &mut InstanceGlobal,
        params: &SimParams,
        released: &mut Vec<GroupId>,
        work: &mut Vec<WorkItem>,
    ) -> usize {
        let reclaimed = self.remove_invalid_instances(store, global, released);

        for &handle in &self.active {
            if let Some(instance) = store.get(handle) {
                debug_assert!(
                    instance.state == InstanceState::Active,
                    "non-active instance in the active list"
                );
                work.push(WorkItem {
                    handle,
                    sim: instance.sim,
                    params: *params,
                });
            }
        }

        reclaimed
    }

    /// Split-phase update, phase 3: transition bookkeeping.
    ///
    /// Runs strictly after the barrier, on the frame thread: examines the
    /// applied results, moves expired instances onto the removal path,
    /// and relinks the lists. Relinking is single-threaded by design.
    pub(crate) fn end_update_async(&mut self, store: &mut InstanceStore) {
        let mut index = 0;
        while index < self.active.len() {
            let handle = self.active[index];
            let Some(instance) = store.get_mut(handle) else {
                debug_assert!(false, "active list holds a stale handle");
                tracing::error!("active list holds a stale handle; dropping it");
                self.active.remove(index);
                continue;
            };

            if instance.state == InstanceState::Active && instance.sim.expired() {
                instance.state = InstanceState::Removing;
            }

            if instance.state == InstanceState::Active {
                index += 1;
            } else {
                self.active.remove(index);
                self.removing.push(handle);
            }
        }

        self.frames += 1;
    }

    /// Forces every live instance onto the removal path.
    pub(crate) fn kill_all_instances(&mut self, store: &mut InstanceStore) {
        for &handle in &self.active {
            if let Some(instance) = store.get_mut(handle) {
                instance.kill();
            }
        }
        let active = std::mem::take(&mut self.active);
        self.removing.extend(active);
    }

    /// Forced teardown: kill everything, then reclaim twice.
    ///
    /// The first sweep advances `Removing → Removed`, the second frees.
    /// Both lists are empty afterwards regardless of entry state.
    pub(crate) fn remove_forcibly(
        &mut self,
        store: &mut InstanceStore,
        global: &mut InstanceGlobal,
        released: &mut Vec<GroupId>,
    ) -> usize {
        self.kill_all_instances(store);
        let mut reclaimed = self.remove_invalid_instances(store, global, released);
        reclaimed += self.remove_invalid_instances(store, global, released);
        debug_assert!(self.active.is_empty() && self.removing.is_empty());
        reclaimed
    }

    /// Composes `mat` onto every live instance's cached world transform.
    pub(crate) fn set_base_matrix(&self, store: &mut InstanceStore, mat: &Mat4) {
        for &handle in &self.active {
            if let Some(instance) = store.get_mut(handle) {
                if instance.state == InstanceState::Active {
                    instance.sim.world = *mat * instance.sim.world;
                }
            }
        }
    }
}
