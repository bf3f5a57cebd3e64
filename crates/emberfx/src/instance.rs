//! # Instance Lifecycle
//!
//! A single particle's per-frame state machine plus its numeric state,
//! and the store that backs both storage classes: pooled slots for
//! ordinary instances, individually-allocated slots for roots.

use glam::{Mat4, Vec3};

use emberfx_core::{Slot, SlotPool};

use crate::container::ContainerId;
use crate::group::GroupId;
use crate::node::SimParams;

/// Lifecycle state of an instance. Strictly forward, no cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// Participates in update and draw.
    Active,
    /// One-frame quarantine: excluded from update and draw, finalized by
    /// the next reclamation pass.
    Removing,
    /// Finalized; storage is reclaimable immediately.
    Removed,
}

/// Numeric per-frame state. This is the only data the worker fan-out
/// touches, and it travels by value: tasks own their copies outright.
#[derive(Clone, Copy, Debug)]
pub struct SimState {
    /// Transform the instance was spawned with.
    pub spawn_transform: Mat4,
    /// Accumulated displacement since spawn.
    pub position: Vec3,
    /// Current velocity, in units per frame.
    pub velocity: Vec3,
    /// Frames lived so far.
    pub living_frames: f32,
    /// Frames this instance gets to live. `f32::INFINITY` for instances
    /// that die only when killed.
    pub lifetime_frames: f32,
    /// Cached world transform read by the draw walk and composed onto by
    /// `set_base_matrix`. Refreshed during update only while shown.
    pub world: Mat4,
}

impl SimState {
    /// Advances the numeric state by `delta` frames.
    ///
    /// The world transform is a render artifact: it is refreshed only
    /// when `shown` is set, while the underlying motion state always
    /// advances.
    pub fn advance(&mut self, params: &SimParams, delta: f32, shown: bool) {
        self.living_frames += delta;
        self.velocity += params.gravity * delta;
        let damping = (1.0 - params.drag * delta).max(0.0);
        self.velocity *= damping;
        self.position += self.velocity * delta;

        if shown {
            self.world = Mat4::from_translation(self.position) * self.spawn_transform;
        }
    }

    /// Whether this instance has outlived its lifetime.
    #[inline]
    #[must_use]
    pub fn expired(&self) -> bool {
        self.living_frames >= self.lifetime_frames
    }

    /// Remaining-life ratio in `[0, 1]`, 0 at spawn.
    #[inline]
    #[must_use]
    pub fn life_ratio(&self) -> f32 {
        if self.lifetime_frames.is_finite() && self.lifetime_frames > 0.0 {
            (self.living_frames / self.lifetime_frames).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Spawn-time parameters for one instance.
#[derive(Clone, Copy, Debug)]
pub struct InstanceInit {
    /// Initial transform (also the initial world transform).
    pub transform: Mat4,
    /// Initial velocity, in units per frame.
    pub velocity: Vec3,
    /// Lifetime in frames.
    pub lifetime_frames: f32,
}

impl InstanceInit {
    /// An instance that lives until killed - the root of an effect.
    #[must_use]
    pub fn persistent(transform: Mat4) -> Self {
        Self {
            transform,
            velocity: Vec3::ZERO,
            lifetime_frames: f32::INFINITY,
        }
    }
}

/// One simulated particle.
#[derive(Debug)]
pub struct Instance {
    /// Index of the effect node this instance belongs to.
    pub(crate) node: usize,
    /// The container that owns the group this instance lives in.
    pub(crate) container: ContainerId,
    /// Lifecycle state.
    pub(crate) state: InstanceState,
    /// Numeric per-frame state.
    pub(crate) sim: SimState,
    /// Groups this instance spawned in child containers. Reclaiming the
    /// instance releases the external reference on each of them.
    pub(crate) spawned_groups: Vec<GroupId>,
}

impl Instance {
    /// Builds a fresh `Active` instance.
    pub(crate) fn new(node: usize, container: ContainerId, init: InstanceInit) -> Self {
        Self {
            node,
            container,
            state: InstanceState::Active,
            sim: SimState {
                spawn_transform: init.transform,
                position: Vec3::ZERO,
                velocity: init.velocity,
                living_frames: 0.0,
                lifetime_frames: init.lifetime_frames,
                world: init.transform,
            },
            spawned_groups: Vec::new(),
        }
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Numeric state, read-only.
    #[inline]
    #[must_use]
    pub fn sim(&self) -> &SimState {
        &self.sim
    }

    /// The container owning this instance.
    #[inline]
    #[must_use]
    pub fn container(&self) -> ContainerId {
        self.container
    }

    /// Index of the effect node this instance simulates.
    #[inline]
    #[must_use]
    pub fn node(&self) -> usize {
        self.node
    }

    /// Forces this instance onto the removal path.
    pub(crate) fn kill(&mut self) {
        if self.state == InstanceState::Active {
            self.state = InstanceState::Removing;
        }
    }
}

/// One unit of parallel work: a snapshot the task owns outright.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WorkItem {
    /// Which instance the result applies to.
    pub handle: InstanceHandle,
    /// Numeric state at snapshot time.
    pub sim: SimState,
    /// Node parameters for the advance.
    pub params: SimParams,
}

/// Handle to an instance in an [`InstanceStore`].
///
/// The top bit selects the storage class: pooled slots recycle through
/// the free list, root slots are allocated and freed individually.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct InstanceHandle(u32);

/// Marks a handle as pointing into the root region.
const ROOT_BIT: u32 = 1 << 31;

impl InstanceHandle {
    /// Handle for a pooled slot.
    #[inline]
    fn pooled(slot: Slot) -> Self {
        Self(slot.index())
    }

    /// Handle for a root slot.
    #[inline]
    fn root(index: u32) -> Self {
        Self(index | ROOT_BIT)
    }

    /// Whether this handle names a root instance.
    #[inline]
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 & ROOT_BIT != 0
    }

    /// Raw slot index within its region.
    #[inline]
    const fn index(self) -> u32 {
        self.0 & !ROOT_BIT
    }
}

/// Backing storage for every live instance of one effect tree.
///
/// Ordinary instances live in a fixed-capacity recycled region; a full
/// region means "could not spawn, skip this emission". Root instances
/// (one per playing effect) live in a growable region and are freed
/// individually - they are never subject to pool pressure.
#[derive(Debug)]
pub struct InstanceStore {
    /// Recycled region for non-root instances.
    pooled: SlotPool<Instance>,
    /// Individually managed region for root instances.
    roots: Vec<Option<Instance>>,
    /// Free root indices, reused before growing.
    root_free: Vec<u32>,
}

impl InstanceStore {
    /// Creates a store with the given pooled capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            pooled: SlotPool::new(capacity),
            roots: Vec::new(),
            root_free: Vec::new(),
        }
    }

    /// Acquires a pooled slot, or `None` when the pool is exhausted.
    pub(crate) fn spawn_pooled(&mut self, instance: Instance) -> Option<InstanceHandle> {
        self.pooled.acquire(instance).map(InstanceHandle::pooled)
    }

    /// Allocates a root slot; grows the root region on demand.
    ///
    /// # Panics
    ///
    /// Panics if the root region exceeds `u32` indices, which would take
    /// two billion simultaneously playing effects.
    pub(crate) fn spawn_root(&mut self, instance: Instance) -> InstanceHandle {
        if let Some(index) = self.root_free.pop() {
            self.roots[index as usize] = Some(instance);
            return InstanceHandle::root(index);
        }
        let index = u32::try_from(self.roots.len()).expect("root region overflow");
        self.roots.push(Some(instance));
        InstanceHandle::root(index)
    }

    /// Releases an instance, recycling or freeing its storage.
    pub(crate) fn release(&mut self, handle: InstanceHandle) -> Option<Instance> {
        if handle.is_root() {
            let entry = self.roots.get_mut(handle.index() as usize)?;
            let instance = entry.take()?;
            self.root_free.push(handle.index());
            Some(instance)
        } else {
            self.pooled.release(Slot::from_index(handle.index()))
        }
    }

    /// Reads an instance.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: InstanceHandle) -> Option<&Instance> {
        if handle.is_root() {
            self.roots.get(handle.index() as usize)?.as_ref()
        } else {
            self.pooled.get(Slot::from_index(handle.index()))
        }
    }

    /// Mutably reads an instance.
    #[inline]
    pub(crate) fn get_mut(&mut self, handle: InstanceHandle) -> Option<&mut Instance> {
        if handle.is_root() {
            self.roots.get_mut(handle.index() as usize)?.as_mut()
        } else {
            self.pooled.get_mut(Slot::from_index(handle.index()))
        }
    }

    /// Number of occupied pooled slots.
    #[inline]
    #[must_use]
    pub fn pooled_occupied(&self) -> usize {
        self.pooled.occupied()
    }

    /// Number of free pooled slots.
    #[inline]
    #[must_use]
    pub fn pooled_available(&self) -> usize {
        self.pooled.available()
    }
}
