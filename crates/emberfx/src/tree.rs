//! # The Effect Tree
//!
//! Owner of everything: the container tree, the group arena, the instance
//! store, the per-effect global state, and the worker pool. Every public
//! scheduler operation enters through this type; the borrow rules fall
//! out of the ownership - arenas are fields, so single-threaded phases
//! get `&mut` access and the worker fan-out gets owned snapshots.
//!
//! ## Frame protocol
//!
//! The owning manager drives one frame as
//! `update → set_base_matrix (if the effect moved) → draw`. Update and
//! draw each walk the tree depth-first in child-index order; parallelism
//! never escapes a single container's visit.

use std::sync::Arc;

use glam::Mat4;

use emberfx_core::WorkerPool;

use crate::config::SchedulerConfig;
use crate::container::{ContainerId, InstanceContainer};
use crate::error::{EffectError, EffectResult};
use crate::global::InstanceGlobal;
use crate::group::{GroupArena, GroupId, InstanceGroup};
use crate::instance::{
    Instance, InstanceHandle, InstanceInit, InstanceState, InstanceStore, SimState, WorkItem,
};
use crate::node::{EffectNode, NodeKind, RenderingOrder};
use crate::partition::worker_range;
use crate::renderer::{DrawPacket, EffectRenderer};
use crate::stats::UpdateStats;

/// The instantiated effect: one container per node, plus all shared
/// state. See the [module docs](self) for the frame protocol.
#[derive(Debug)]
pub struct EffectTree {
    /// Immutable node descriptors, index-addressed.
    nodes: Box<[EffectNode]>,
    /// Container arena in construction (depth-first) order; the root is
    /// index 0. `None` marks a torn-down container.
    containers: Vec<Option<InstanceContainer>>,
    /// Group arena.
    groups: GroupArena,
    /// Instance storage, pooled and root regions.
    instances: InstanceStore,
    /// Live counter and priority registry.
    global: InstanceGlobal,
    /// Persistent workers for parallel update and draw.
    workers: WorkerPool,
    /// Validated configuration.
    config: SchedulerConfig,
}

impl EffectTree {
    /// The root container of any live tree.
    const ROOT: ContainerId = ContainerId::from_index(0);

    /// Instantiates the container tree for a flattened node list.
    ///
    /// Node 0 must be the root; children must follow their parent in the
    /// list and have exactly one parent each. One container is created
    /// per node, depth-first, and nodes carrying a rendering priority are
    /// registered into the slot registry in construction order - on a
    /// slot collision the later-constructed container wins.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::InvalidConfig`] or
    /// [`EffectError::MalformedNodeTree`] for unusable input, and
    /// [`EffectError::PrioritySlotOutOfRange`] when a node's priority
    /// does not fit the registry.
    pub fn instantiate(nodes: Vec<EffectNode>, config: SchedulerConfig) -> EffectResult<Self> {
        config.validate()?;
        validate_nodes(&nodes)?;

        let mut containers = Vec::with_capacity(nodes.len());
        build_container(&nodes, &mut containers, 0);

        let mut global = InstanceGlobal::new(config.priority_slots);
        for index in 0..containers.len() {
            let Some(container) = &containers[index] else {
                continue;
            };
            if let Some(slot) = nodes[container.node()].rendering_priority {
                let id = ContainerId::from_index(
                    u32::try_from(index).expect("container arena overflow"),
                );
                global.register_priority(slot, id)?;
            }
        }

        let workers = WorkerPool::new(config.worker_threads);
        tracing::info!(
            nodes = nodes.len(),
            worker_threads = config.worker_threads,
            instance_capacity = config.instance_capacity,
            "effect tree instantiated"
        );

        Ok(Self {
            nodes: nodes.into_boxed_slice(),
            containers,
            groups: GroupArena::default(),
            instances: InstanceStore::new(config.instance_capacity),
            global,
            workers,
            config,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The root container.
    #[inline]
    #[must_use]
    pub fn root_container(&self) -> ContainerId {
        Self::ROOT
    }

    /// Per-effect global state: live counter and priority registry.
    #[inline]
    #[must_use]
    pub fn global(&self) -> &InstanceGlobal {
        &self.global
    }

    /// The worker pool, exposed for instrumentation.
    #[inline]
    #[must_use]
    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Instance storage, exposed for occupancy inspection.
    #[inline]
    #[must_use]
    pub fn instances(&self) -> &InstanceStore {
        &self.instances
    }

    /// The node descriptor at `index`.
    #[inline]
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&EffectNode> {
        self.nodes.get(index)
    }

    /// Looks up a live container.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] for torn-down or
    /// foreign ids.
    pub fn container(&self, id: ContainerId) -> EffectResult<&InstanceContainer> {
        self.containers
            .get(id.index() as usize)
            .and_then(Option::as_ref)
            .ok_or(EffectError::ContainerNotFound(id.index()))
    }

    /// Looks up a live group.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::GroupNotFound`] for pruned or foreign ids.
    pub fn group(&self, id: GroupId) -> EffectResult<&InstanceGroup> {
        self.groups
            .get(id)
            .ok_or(EffectError::GroupNotFound(id.index()))
    }

    /// Reads an instance.
    #[inline]
    #[must_use]
    pub fn instance(&self, handle: InstanceHandle) -> Option<&Instance> {
        self.instances.get(handle)
    }

    /// The root instance: first instance of the root container's first
    /// group.
    #[must_use]
    pub fn root_instance(&self) -> Option<InstanceHandle> {
        let container = self.container(Self::ROOT).ok()?;
        let group = self.groups.get(container.first_group()?)?;
        group.get_first()
    }

    /// The child of `parent` in `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] or
    /// [`EffectError::ChildIndexOutOfRange`].
    pub fn get_child(&self, parent: ContainerId, slot: usize) -> EffectResult<Option<ContainerId>> {
        let container = self.container(parent)?;
        if slot >= container.child_count() {
            return Err(EffectError::ChildIndexOutOfRange {
                index: slot,
                arity: container.child_count(),
            });
        }
        Ok(container.child(slot))
    }

    /// Reassigns the child slot of `parent`. Overwriting an occupied slot
    /// orphans the previous child; it stays alive but leaves the walk.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] when either id is
    /// stale, or [`EffectError::ChildIndexOutOfRange`].
    pub fn set_child(
        &mut self,
        parent: ContainerId,
        slot: usize,
        child: Option<ContainerId>,
    ) -> EffectResult<()> {
        if let Some(child) = child {
            self.container(child)?;
        }
        let arity = self.container(parent)?.child_count();
        if slot >= arity {
            return Err(EffectError::ChildIndexOutOfRange { index: slot, arity });
        }
        if self.container(parent)?.child(slot).is_some() {
            tracing::debug!(
                parent = parent.index(),
                slot,
                "overwriting an occupied child slot"
            );
        }
        self.container_mut(parent).set_child_slot(slot, child);
        Ok(())
    }

    // =========================================================================
    // Group and instance creation
    // =========================================================================

    /// Creates an empty group in `container`.
    ///
    /// The group starts externally referenced. When `spawner` is given,
    /// that instance holds the reference and reclaiming it releases the
    /// group; otherwise the caller holds it and must call
    /// [`release_group`](Self::release_group) once done spawning into it.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] for a stale container.
    pub fn create_group(
        &mut self,
        container: ContainerId,
        spawner: Option<InstanceHandle>,
    ) -> EffectResult<GroupId> {
        let node = self.container(container)?.node();
        let id = self.groups.insert(InstanceGroup::new(container, node));
        self.container_mut(container).push_group(id);

        if let Some(spawner) = spawner {
            if let Some(instance) = self.instances.get_mut(spawner) {
                instance.spawned_groups.push(id);
            } else {
                debug_assert!(false, "group spawner is a stale handle");
                tracing::error!("group spawner is a stale handle; group left unreferenced");
            }
        }
        Ok(id)
    }

    /// Drops the external reference on a group, making it prunable once
    /// its lists drain.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::GroupNotFound`] for a pruned id.
    pub fn release_group(&mut self, id: GroupId) -> EffectResult<()> {
        self.groups
            .get_mut(id)
            .ok_or(EffectError::GroupNotFound(id.index()))?
            .release_reference();
        Ok(())
    }

    /// First group of a container.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] for a stale container.
    pub fn first_group(&self, container: ContainerId) -> EffectResult<Option<GroupId>> {
        Ok(self.container(container)?.first_group())
    }

    /// Spawns one instance into a group.
    ///
    /// Root-node instances always allocate; any other instance draws on
    /// the fixed pooled region, and `Ok(None)` means the pool was
    /// exhausted - the spawn is dropped, nothing partial happens.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::GroupNotFound`] for a pruned group.
    pub fn create_instance(
        &mut self,
        group: GroupId,
        init: InstanceInit,
    ) -> EffectResult<Option<InstanceHandle>> {
        let (container, node) = {
            let group = self
                .groups
                .get(group)
                .ok_or(EffectError::GroupNotFound(group.index()))?;
            (group.container(), group.node())
        };

        let instance = Instance::new(node, container, init);
        let handle = if self.nodes[node].kind == NodeKind::Root {
            self.instances.spawn_root(instance)
        } else {
            match self.instances.spawn_pooled(instance) {
                Some(handle) => handle,
                None => {
                    tracing::trace!(node, "instance pool exhausted; spawn dropped");
                    return Ok(None);
                }
            }
        };

        if let Some(group) = self.groups.get_mut(group) {
            group.push_instance(handle);
        }
        self.global.inc_instance_count();
        Ok(Some(handle))
    }

    // =========================================================================
    // Per-frame update
    // =========================================================================

    /// Updates the whole tree from the root.
    ///
    /// `delta_frame` is measured in frames (1.0 = one nominal frame);
    /// `shown` gates the world-transform refresh, not the simulation.
    pub fn update(&mut self, recursive: bool, delta_frame: f32, shown: bool) -> UpdateStats {
        let mut stats = UpdateStats::default();
        if self.container(Self::ROOT).is_err() {
            tracing::error!("update called on a torn-down tree");
            return stats;
        }
        self.update_container_inner(Self::ROOT, recursive, delta_frame, shown, &mut stats);
        stats
    }

    /// Updates one container, optionally recursing into its subtree.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] for a stale container.
    pub fn update_container(
        &mut self,
        id: ContainerId,
        recursive: bool,
        delta_frame: f32,
        shown: bool,
    ) -> EffectResult<UpdateStats> {
        self.container(id)?;
        let mut stats = UpdateStats::default();
        self.update_container_inner(id, recursive, delta_frame, shown, &mut stats);
        Ok(stats)
    }

    /// One container's update pass: count, pick a path, prune, recurse.
    fn update_container_inner(
        &mut self,
        id: ContainerId,
        recursive: bool,
        delta_frame: f32,
        shown: bool,
        stats: &mut UpdateStats,
    ) {
        let group_count = self.container_ref(id).groups().len();
        let params = self.nodes[self.container_ref(id).node()].params;

        let mut instance_count = 0;
        for slot in 0..group_count {
            let gid = self.container_ref(id).groups()[slot];
            instance_count += self
                .groups
                .get(gid)
                .map_or(0, InstanceGroup::instance_count);
        }

        if instance_count < self.config.parallel_threshold {
            // Sequential path: the fan-out costs more than it buys here.
            let mut released = Vec::new();
            for slot in 0..group_count {
                let gid = self.container_ref(id).groups()[slot];
                if let Some(group) = self.groups.get_mut(gid) {
                    let (advanced, reclaimed) = group.update(
                        &mut self.instances,
                        &mut self.global,
                        &params,
                        delta_frame,
                        shown,
                        &mut released,
                    );
                    stats.instances_advanced += advanced;
                    stats.instances_reclaimed += reclaimed;
                }
            }
            self.release_spawned(&released);
        } else {
            self.update_container_parallel(
                id,
                group_count,
                instance_count,
                &params,
                delta_frame,
                shown,
                stats,
            );
        }

        stats.groups_pruned += self.remove_invalid_groups_inner(id);

        if recursive {
            let arity = self.container_ref(id).child_count();
            for slot in 0..arity {
                if let Some(child) = self.container_ref(id).child(slot) {
                    self.update_container_inner(child, recursive, delta_frame, shown, stats);
                }
            }
        }
    }

    /// The worker fan-out for one container's groups.
    ///
    /// Snapshot → split into contiguous ranges → one task per worker →
    /// barrier → apply → relink. Workers only ever touch snapshots they
    /// own; list structure stays on the frame thread.
    #[allow(clippy::too_many_arguments)]
    fn update_container_parallel(
        &mut self,
        id: ContainerId,
        group_count: usize,
        instance_count: usize,
        params: &crate::node::SimParams,
        delta_frame: f32,
        shown: bool,
        stats: &mut UpdateStats,
    ) {
        stats.parallel_containers += 1;
        let worker_count = self.config.worker_threads;

        // Begin: reclaim and snapshot, flattened across groups in order.
        let mut released = Vec::new();
        let mut work: Vec<WorkItem> = Vec::with_capacity(instance_count);
        for slot in 0..group_count {
            let gid = self.container_ref(id).groups()[slot];
            if let Some(group) = self.groups.get_mut(gid) {
                stats.instances_reclaimed += group.begin_update_async(
                    &mut self.instances,
                    &mut self.global,
                    params,
                    &mut released,
                    &mut work,
                );
            }
        }
        self.release_spawned(&released);

        // Split the flattened work into one owned chunk per worker. The
        // chunks are carved back-to-front so each split is O(1) on the
        // remaining prefix.
        let total = work.len();
        let mut chunks: Vec<Vec<WorkItem>> = Vec::with_capacity(worker_count);
        for index in (0..worker_count).rev() {
            let range = worker_range(total, worker_count, index);
            chunks.push(work.split_off(range.start));
        }
        chunks.reverse();

        let (tx, rx) = crossbeam_channel::bounded::<Vec<(InstanceHandle, SimState)>>(worker_count);
        for chunk in chunks {
            let tx = tx.clone();
            self.workers.push_task(move || {
                let mut results = Vec::with_capacity(chunk.len());
                for mut item in chunk {
                    item.sim.advance(&item.params, delta_frame, shown);
                    results.push((item.handle, item.sim));
                }
                let _ = tx.send(results);
            });
            stats.tasks_submitted += 1;
        }
        drop(tx);

        // The join barrier: nothing below runs while a task is in flight.
        self.workers.wait_all();

        // Apply results, then relink - single-threaded by design.
        for batch in rx.try_iter() {
            for (handle, sim) in batch {
                if let Some(instance) = self.instances.get_mut(handle) {
                    instance.sim = sim;
                    stats.instances_advanced += 1;
                }
            }
        }
        for slot in 0..group_count {
            let gid = self.container_ref(id).groups()[slot];
            if let Some(group) = self.groups.get_mut(gid) {
                group.end_update_async(&mut self.instances);
            }
        }
    }

    /// Prunes groups whose lists drained and whose external reference is
    /// gone. Idempotent: a second call with no intervening update removes
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] for a stale container.
    pub fn remove_invalid_groups(&mut self, id: ContainerId) -> EffectResult<usize> {
        self.container(id)?;
        Ok(self.remove_invalid_groups_inner(id))
    }

    fn remove_invalid_groups_inner(&mut self, id: ContainerId) -> usize {
        let mut dead: Vec<GroupId> = Vec::new();
        for &gid in self.container_ref(id).groups() {
            match self.groups.get(gid) {
                Some(group) if group.is_prunable() => dead.push(gid),
                Some(_) => {}
                None => {
                    debug_assert!(false, "container lists a missing group");
                    tracing::error!("container lists a missing group; unlinking it");
                    dead.push(gid);
                }
            }
        }
        if dead.is_empty() {
            return 0;
        }

        for &gid in &dead {
            self.groups.remove(gid);
        }
        self.container_mut(id).retain_groups(|gid| !dead.contains(&gid));
        dead.len()
    }

    // =========================================================================
    // Draw
    // =========================================================================

    /// Draws the whole tree from the root.
    ///
    /// The renderer arrives behind an `Arc` because striped asynchronous
    /// draws hand clones to worker tasks; sequential backends pay one
    /// refcount, nothing more.
    pub fn draw(&self, recursive: bool, renderer: &Arc<dyn EffectRenderer>) {
        if self.container(Self::ROOT).is_err() {
            tracing::error!("draw called on a torn-down tree");
            return;
        }
        self.draw_container_inner(Self::ROOT, recursive, renderer);
    }

    /// Draws one container, optionally recursing into its subtree.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] for a stale container.
    pub fn draw_container(
        &self,
        id: ContainerId,
        recursive: bool,
        renderer: &Arc<dyn EffectRenderer>,
    ) -> EffectResult<()> {
        self.container(id)?;
        self.draw_container_inner(id, recursive, renderer);
        Ok(())
    }

    fn draw_container_inner(
        &self,
        id: ContainerId,
        recursive: bool,
        renderer: &Arc<dyn EffectRenderer>,
    ) {
        let container = self.container_ref(id);
        let node_index = container.node();
        let node = &self.nodes[node_index];

        if node.kind.is_leaf_visual() {
            let mut instance_count = 0;
            for &gid in container.groups() {
                if let Some(group) = self.groups.get(gid) {
                    instance_count += group
                        .instances()
                        .iter()
                        .filter(|&&handle| self.is_active(handle))
                        .count();
                }
            }

            if instance_count > 0 {
                let is_async = renderer.is_async_supported();
                renderer.begin_rendering(node, instance_count);
                for &gid in container.groups() {
                    let Some(group) = self.groups.get(gid) else {
                        continue;
                    };
                    let packets = self.collect_packets(group, node, node_index);
                    renderer.begin_group(node, packets.len());
                    if is_async {
                        self.draw_group_async(&packets, renderer);
                    } else {
                        for packet in &packets {
                            renderer.draw(node, packet);
                        }
                    }
                    renderer.end_group(node);
                }
                renderer.end_rendering(node);
            }
        }

        if recursive {
            for slot in 0..container.child_count() {
                if let Some(child) = container.child(slot) {
                    self.draw_container_inner(child, recursive, renderer);
                }
            }
        }
    }

    /// Snapshots a group's live instances in the node's declared order.
    fn collect_packets(
        &self,
        group: &InstanceGroup,
        node: &EffectNode,
        node_index: usize,
    ) -> Vec<DrawPacket> {
        let node_index = u32::try_from(node_index).unwrap_or(u32::MAX);
        let mut packets = Vec::with_capacity(group.instance_count());
        let mut push = |handle: InstanceHandle| {
            if let Some(instance) = self.instances.get(handle) {
                if instance.state() == InstanceState::Active {
                    packets.push(DrawPacket::new(
                        instance.sim().world,
                        instance.sim().life_ratio(),
                        node_index,
                    ));
                }
            }
        };

        match node.rendering_order {
            RenderingOrder::CreationOrder => {
                for &handle in group.instances() {
                    push(handle);
                }
            }
            RenderingOrder::ReverseOrder => {
                for &handle in group.instances().iter().rev() {
                    push(handle);
                }
            }
        }
        packets
    }

    /// Striped asynchronous draw: stripe `s` owns indices `s, s+k, ...`,
    /// so every worker's visitation order matches the declared order
    /// modulo the stride, and the backend can reassemble by index.
    fn draw_group_async(&self, packets: &[DrawPacket], renderer: &Arc<dyn EffectRenderer>) {
        let stripe_count = self.config.worker_threads;
        for stripe in 0..stripe_count {
            let items: Vec<(usize, DrawPacket)> = packets
                .iter()
                .copied()
                .enumerate()
                .skip(stripe)
                .step_by(stripe_count)
                .collect();
            if items.is_empty() {
                continue;
            }
            let renderer = Arc::clone(renderer);
            self.workers.push_task(move || {
                for (index, packet) in items {
                    renderer.draw_indexed(index, &packet);
                }
            });
        }
        self.workers.wait_all();
    }

    // =========================================================================
    // Forced teardown
    // =========================================================================

    /// Forces every live instance in the subtree onto the removal path.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] for a stale container.
    pub fn kill_all_instances(&mut self, id: ContainerId, recursive: bool) -> EffectResult<()> {
        self.container(id)?;
        self.kill_all_instances_inner(id, recursive);
        Ok(())
    }

    fn kill_all_instances_inner(&mut self, id: ContainerId, recursive: bool) {
        let group_count = self.container_ref(id).groups().len();
        for slot in 0..group_count {
            let gid = self.container_ref(id).groups()[slot];
            if let Some(group) = self.groups.get_mut(gid) {
                group.kill_all_instances(&mut self.instances);
            }
        }
        if recursive {
            let arity = self.container_ref(id).child_count();
            for slot in 0..arity {
                if let Some(child) = self.container_ref(id).child(slot) {
                    self.kill_all_instances_inner(child, recursive);
                }
            }
        }
    }

    /// Tears a subtree's population down in place: kill, reclaim fully,
    /// prune. Container structure survives; use this to stop one branch
    /// without touching its siblings.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] for a stale container.
    pub fn remove_forcibly(&mut self, id: ContainerId, recursive: bool) -> EffectResult<()> {
        self.container(id)?;
        self.remove_forcibly_inner(id, recursive);
        Ok(())
    }

    fn remove_forcibly_inner(&mut self, id: ContainerId, recursive: bool) {
        let group_count = self.container_ref(id).groups().len();
        let mut released = Vec::new();
        for slot in 0..group_count {
            let gid = self.container_ref(id).groups()[slot];
            if let Some(group) = self.groups.get_mut(gid) {
                group.remove_forcibly(&mut self.instances, &mut self.global, &mut released);
            }
        }
        self.release_spawned(&released);
        self.remove_invalid_groups_inner(id);

        if recursive {
            let arity = self.container_ref(id).child_count();
            for slot in 0..arity {
                if let Some(child) = self.container_ref(id).child(slot) {
                    self.remove_forcibly_inner(child, recursive);
                }
            }
        }
    }

    /// Destroys the whole tree: every instance reclaimed, every group
    /// pruned, every container freed. The tree is inert afterwards; only
    /// dropping it remains.
    pub fn teardown(&mut self) {
        if self.container(Self::ROOT).is_ok() {
            self.destroy_container(Self::ROOT);
        }
        tracing::debug!("effect tree torn down");
    }

    /// Destroys one container: groups first (a group's reclamation path
    /// may still reference its container), then children, then the slot.
    fn destroy_container(&mut self, id: ContainerId) {
        self.remove_forcibly_inner(id, false);

        let leftover = self.container_ref(id).groups().len();
        debug_assert!(leftover == 0, "container destroyed with live group references");
        if leftover != 0 {
            tracing::error!(
                container = id.index(),
                leftover,
                "container destroyed with live group references"
            );
        }

        let arity = self.container_ref(id).child_count();
        for slot in 0..arity {
            if let Some(child) = self.container_ref(id).child(slot) {
                self.destroy_container(child);
            }
        }
        self.containers[id.index() as usize] = None;
    }

    /// Composes a base matrix onto the subtree's live instances. Root
    /// containers carry no geometry and are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::ContainerNotFound`] for a stale container.
    pub fn set_base_matrix(
        &mut self,
        id: ContainerId,
        recursive: bool,
        mat: &Mat4,
    ) -> EffectResult<()> {
        self.container(id)?;
        self.set_base_matrix_inner(id, recursive, mat);
        Ok(())
    }

    fn set_base_matrix_inner(&mut self, id: ContainerId, recursive: bool, mat: &Mat4) {
        let kind = self.nodes[self.container_ref(id).node()].kind;
        if kind != NodeKind::Root {
            let group_count = self.container_ref(id).groups().len();
            for slot in 0..group_count {
                let gid = self.container_ref(id).groups()[slot];
                if let Some(group) = self.groups.get(gid) {
                    group.set_base_matrix(&mut self.instances, mat);
                }
            }
        }
        if recursive {
            let arity = self.container_ref(id).child_count();
            for slot in 0..arity {
                if let Some(child) = self.container_ref(id).child(slot) {
                    self.set_base_matrix_inner(child, recursive, mat);
                }
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Infallible container lookup for internal walks. A stale id here is
    /// a logic bug, not an input problem.
    fn container_ref(&self, id: ContainerId) -> &InstanceContainer {
        self.containers[id.index() as usize]
            .as_ref()
            .expect("internal walk reached a destroyed container")
    }

    /// Mutable counterpart of [`container_ref`](Self::container_ref).
    fn container_mut(&mut self, id: ContainerId) -> &mut InstanceContainer {
        self.containers[id.index() as usize]
            .as_mut()
            .expect("internal walk reached a destroyed container")
    }

    /// Clears the external reference on groups whose spawning instance
    /// was just reclaimed.
    fn release_spawned(&mut self, released: &[GroupId]) {
        for &gid in released {
            if let Some(group) = self.groups.get_mut(gid) {
                group.release_reference();
            }
        }
    }

    /// Whether a handle names a live, `Active` instance.
    fn is_active(&self, handle: InstanceHandle) -> bool {
        self.instances
            .get(handle)
            .is_some_and(|instance| instance.state() == InstanceState::Active)
    }
}

/// Recursively builds the container for `node_index` and its subtree.
/// Containers land in the arena in construction (depth-first) order.
fn build_container(
    nodes: &[EffectNode],
    containers: &mut Vec<Option<InstanceContainer>>,
    node_index: usize,
) -> ContainerId {
    let arity = nodes[node_index].children.len();
    let id = ContainerId::from_index(
        u32::try_from(containers.len()).expect("container arena overflow"),
    );
    containers.push(Some(InstanceContainer::new(node_index, arity)));

    for (slot, &child_node) in nodes[node_index].children.iter().enumerate() {
        let child = build_container(nodes, containers, child_node);
        containers[id.index() as usize]
            .as_mut()
            .expect("container just built")
            .set_child_slot(slot, Some(child));
    }
    id
}

/// Checks that the flattened node list describes a rooted tree.
fn validate_nodes(nodes: &[EffectNode]) -> EffectResult<()> {
    if nodes.is_empty() {
        return Err(EffectError::MalformedNodeTree("node list is empty".into()));
    }
    if nodes[0].kind != NodeKind::Root {
        return Err(EffectError::MalformedNodeTree(
            "node 0 must be the root".into(),
        ));
    }

    let mut seen = vec![false; nodes.len()];
    seen[0] = true;
    for (index, node) in nodes.iter().enumerate() {
        for &child in &node.children {
            if child >= nodes.len() {
                return Err(EffectError::MalformedNodeTree(format!(
                    "child {child} out of range"
                )));
            }
            if child <= index {
                return Err(EffectError::MalformedNodeTree(format!(
                    "child {child} does not follow its parent {index}"
                )));
            }
            if seen[child] {
                return Err(EffectError::MalformedNodeTree(format!(
                    "node {child} has two parents"
                )));
            }
            seen[child] = true;
        }
    }
    if let Some(orphan) = seen.iter().position(|&s| !s) {
        return Err(EffectError::MalformedNodeTree(format!(
            "node {orphan} is unreachable from the root"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::SimParams;

    fn two_level_nodes() -> Vec<EffectNode> {
        vec![
            EffectNode::root(vec![1]),
            EffectNode {
                kind: NodeKind::Sprite,
                rendering_order: RenderingOrder::CreationOrder,
                rendering_priority: Some(3),
                params: SimParams::default(),
                children: Vec::new(),
            },
        ]
    }

    #[test]
    fn test_instantiate_builds_mirrored_tree() {
        let tree = EffectTree::instantiate(two_level_nodes(), SchedulerConfig::default()).unwrap();

        let root = tree.root_container();
        let root_container = tree.container(root).unwrap();
        assert_eq!(root_container.child_count(), 1);

        let child = tree.get_child(root, 0).unwrap().unwrap();
        assert_eq!(tree.container(child).unwrap().child_count(), 0);
        assert_eq!(tree.global().rendered_container(3), Some(child));
    }

    #[test]
    fn test_instantiate_rejects_bad_trees() {
        let config = SchedulerConfig::default();

        assert!(matches!(
            EffectTree::instantiate(Vec::new(), config.clone()),
            Err(EffectError::MalformedNodeTree(_))
        ));

        // Child indices must follow their parent.
        let backwards = vec![
            EffectNode::root(vec![1]),
            EffectNode {
                children: vec![0],
                ..EffectNode::sprite()
            },
        ];
        assert!(EffectTree::instantiate(backwards, config.clone()).is_err());

        // Unreachable node.
        let orphaned = vec![EffectNode::root(Vec::new()), EffectNode::sprite()];
        assert!(EffectTree::instantiate(orphaned, config).is_err());
    }

    #[test]
    fn test_instantiate_rejects_out_of_range_priority() {
        let mut nodes = two_level_nodes();
        nodes[1].rendering_priority = Some(1000);
        let err = EffectTree::instantiate(nodes, SchedulerConfig::default()).unwrap_err();
        assert!(matches!(err, EffectError::PrioritySlotOutOfRange { .. }));
    }

    #[test]
    fn test_set_child_range_checked() {
        let mut tree =
            EffectTree::instantiate(two_level_nodes(), SchedulerConfig::default()).unwrap();
        let root = tree.root_container();
        let child = tree.get_child(root, 0).unwrap();

        assert!(matches!(
            tree.set_child(root, 4, child),
            Err(EffectError::ChildIndexOutOfRange { index: 4, arity: 1 })
        ));
        assert!(tree.set_child(root, 0, None).is_ok());
        assert_eq!(tree.get_child(root, 0).unwrap(), None);
    }

    #[test]
    fn test_pool_exhaustion_drops_spawn() {
        let config = SchedulerConfig {
            instance_capacity: 2,
            ..Default::default()
        };
        let mut tree = EffectTree::instantiate(two_level_nodes(), config).unwrap();
        let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();
        let group = tree.create_group(child, None).unwrap();

        let init = InstanceInit {
            transform: Mat4::IDENTITY,
            velocity: glam::Vec3::ZERO,
            lifetime_frames: 10.0,
        };
        assert!(tree.create_instance(group, init).unwrap().is_some());
        assert!(tree.create_instance(group, init).unwrap().is_some());
        // Pool exhausted: dropped, not an error.
        assert!(tree.create_instance(group, init).unwrap().is_none());
        assert_eq!(tree.global().instance_count(), 2);
    }

    #[test]
    fn test_root_instances_bypass_the_pool() {
        let config = SchedulerConfig {
            instance_capacity: 1,
            ..Default::default()
        };
        let mut tree = EffectTree::instantiate(two_level_nodes(), config).unwrap();
        let root_group = tree.create_group(tree.root_container(), None).unwrap();

        for _ in 0..3 {
            let handle = tree
                .create_instance(root_group, InstanceInit::persistent(Mat4::IDENTITY))
                .unwrap()
                .unwrap();
            assert!(handle.is_root());
        }
        assert_eq!(tree.instances().pooled_occupied(), 0);
        assert_eq!(tree.root_instance(), tree.group(root_group).unwrap().get_first());
    }
}
