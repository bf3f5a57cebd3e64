//! # Frame Lifecycle Verification
//!
//! End-to-end checks of the scheduler contract: the three-state
//! lifecycle with deferred reclamation, the sync/parallel threshold, the
//! partitioned fan-out, pruning, forced teardown, and draw ordering.

use std::sync::Arc;

use glam::{Mat4, Vec3};
use parking_lot::Mutex;

use emberfx::{
    DrawPacket, EffectNode, EffectRenderer, EffectTree, GroupId, InstanceInit, NodeKind,
    RenderingOrder, SchedulerConfig, SimParams,
};

/// Root plus one sprite child, the smallest drawable tree.
fn sprite_tree_nodes(order: RenderingOrder) -> Vec<EffectNode> {
    vec![
        EffectNode::root(vec![1]),
        EffectNode {
            kind: NodeKind::Sprite,
            rendering_order: order,
            rendering_priority: None,
            params: SimParams::default(),
            children: Vec::new(),
        },
    ]
}

fn finite(lifetime_frames: f32) -> InstanceInit {
    InstanceInit {
        transform: Mat4::IDENTITY,
        velocity: Vec3::ZERO,
        lifetime_frames,
    }
}

fn spawn_batch(tree: &mut EffectTree, group: GroupId, count: usize, lifetime: f32) {
    for _ in 0..count {
        let handle = tree.create_instance(group, finite(lifetime)).unwrap();
        assert!(handle.is_some(), "pool exhausted in test setup");
    }
}

/// Render backend that records every callback, for ordering checks.
#[derive(Default)]
struct RecordingRenderer {
    async_supported: bool,
    events: Mutex<Vec<String>>,
    indexed: Mutex<Vec<(usize, f32)>>,
}

impl EffectRenderer for RecordingRenderer {
    fn is_async_supported(&self) -> bool {
        self.async_supported
    }

    fn begin_rendering(&self, _node: &EffectNode, instance_count: usize) {
        self.events.lock().push(format!("begin:{instance_count}"));
    }

    fn begin_group(&self, _node: &EffectNode, instance_count: usize) {
        self.events.lock().push(format!("group:{instance_count}"));
    }

    fn draw(&self, _node: &EffectNode, packet: &DrawPacket) {
        self.events
            .lock()
            .push(format!("draw:{}", packet.world.w_axis.x));
    }

    fn draw_indexed(&self, index: usize, packet: &DrawPacket) {
        self.indexed.lock().push((index, packet.world.w_axis.x));
    }

    fn end_group(&self, _node: &EffectNode) {
        self.events.lock().push("end_group".into());
    }

    fn end_rendering(&self, _node: &EffectNode) {
        self.events.lock().push("end".into());
    }
}

#[test]
fn small_container_updates_synchronously() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();

    // Three groups of {10, 20, 5}: 35 total, below the threshold of 64.
    for count in [10usize, 20, 5] {
        let group = tree.create_group(child, None).unwrap();
        spawn_batch(&mut tree, group, count, 100.0);
    }

    let stats = tree.update(true, 1.0, true);

    assert_eq!(stats.instances_advanced, 35);
    assert_eq!(stats.tasks_submitted, 0);
    assert_eq!(stats.parallel_containers, 0);
    assert_eq!(tree.workers().submitted_tasks(), 0);

    // Every instance advanced exactly once.
    for &gid in tree.container(child).unwrap().groups() {
        for &handle in tree.group(gid).unwrap().instances() {
            let sim = tree.instance(handle).unwrap().sim();
            assert!((sim.living_frames - 1.0).abs() < f32::EPSILON);
        }
    }
}

#[test]
fn large_container_fans_out_once_per_instance() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();

    // Irregular group sizes totalling 200, above the threshold.
    for count in [64usize, 86, 50] {
        let group = tree.create_group(child, None).unwrap();
        spawn_batch(&mut tree, group, count, 100.0);
    }

    let stats = tree.update(true, 1.0, true);

    assert_eq!(stats.instances_advanced, 200);
    assert_eq!(stats.tasks_submitted, 4);
    assert_eq!(stats.parallel_containers, 1);
    assert_eq!(tree.workers().submitted_tasks(), 4);

    // Exactly one numeric update per instance, not zero and not two.
    for &gid in tree.container(child).unwrap().groups() {
        for &handle in tree.group(gid).unwrap().instances() {
            let sim = tree.instance(handle).unwrap().sim();
            assert!((sim.living_frames - 1.0).abs() < f32::EPSILON);
        }
    }
}

#[test]
fn parallel_and_sync_paths_agree() {
    let params = SimParams {
        gravity: Vec3::new(0.0, -0.25, 0.0),
        drag: 0.05,
    };
    let make_nodes = || {
        vec![
            EffectNode::root(vec![1]),
            EffectNode {
                kind: NodeKind::Sprite,
                rendering_order: RenderingOrder::CreationOrder,
                rendering_priority: None,
                params,
                children: Vec::new(),
            },
        ]
    };

    // Same population, one tree forced sequential by a huge threshold.
    let sync_config = SchedulerConfig {
        parallel_threshold: usize::MAX,
        ..Default::default()
    };
    let mut sync_tree = EffectTree::instantiate(make_nodes(), sync_config).unwrap();
    let mut par_tree = EffectTree::instantiate(make_nodes(), SchedulerConfig::default()).unwrap();

    for tree in [&mut sync_tree, &mut par_tree] {
        let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();
        let group = tree.create_group(child, None).unwrap();
        for i in 0..150 {
            let init = InstanceInit {
                transform: Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0)),
                velocity: Vec3::new(0.5, 1.0, 0.0),
                lifetime_frames: 100.0,
            };
            assert!(tree.create_instance(group, init).unwrap().is_some());
        }
    }

    let sync_stats = sync_tree.update(true, 1.0, true);
    let par_stats = par_tree.update(true, 1.0, true);
    assert_eq!(sync_stats.tasks_submitted, 0);
    assert_eq!(par_stats.tasks_submitted, 4);

    let collect = |tree: &EffectTree| -> Vec<(f32, f32, f32)> {
        let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();
        let gid = tree.container(child).unwrap().groups()[0];
        tree.group(gid)
            .unwrap()
            .instances()
            .iter()
            .map(|&h| {
                let sim = tree.instance(h).unwrap().sim();
                (sim.position.x, sim.position.y, sim.velocity.y)
            })
            .collect()
    };

    assert_eq!(collect(&sync_tree), collect(&par_tree));
}

#[test]
fn removal_takes_the_documented_three_frames() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();
    let group = tree.create_group(child, None).unwrap();

    let handle = tree.create_instance(group, finite(1.0)).unwrap().unwrap();
    let capacity = tree.instances().pooled_available() + tree.instances().pooled_occupied();

    // Frame N: expires during update, lands in the removing list.
    tree.update(true, 1.0, true);
    assert_eq!(tree.group(group).unwrap().instance_count(), 0);
    assert_eq!(tree.group(group).unwrap().removing_instance_count(), 1);

    // Frame N+1: reclamation observes Removing, finalizes to Removed.
    tree.update(true, 1.0, true);
    assert_eq!(tree.group(group).unwrap().removing_instance_count(), 1);

    // Frame N+2: reclamation frees it; storage is back in the pool.
    tree.update(true, 1.0, true);
    assert_eq!(tree.group(group).unwrap().removing_instance_count(), 0);
    assert!(tree.instance(handle).is_none());
    assert_eq!(tree.instances().pooled_available(), capacity);
    assert_eq!(tree.global().instance_count(), 0);
}

#[test]
fn reclamation_never_removes_active_or_removing_counts() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();
    let group = tree.create_group(child, None).unwrap();

    // Mixed population: 4 long-lived, 3 that expire on the first frame.
    spawn_batch(&mut tree, group, 4, 50.0);
    spawn_batch(&mut tree, group, 3, 1.0);
    tree.update(true, 1.0, true); // 3 now Removing
    tree.update(true, 1.0, true); // 3 now Removed

    let before_active = tree.group(group).unwrap().instance_count();
    let before_removing = tree.group(group).unwrap().removing_instance_count();
    assert_eq!((before_active, before_removing), (4, 3));

    let stats = tree.update(true, 1.0, true); // reclamation frees the 3
    assert_eq!(stats.instances_reclaimed, 3);

    let after_active = tree.group(group).unwrap().instance_count();
    let after_removing = tree.group(group).unwrap().removing_instance_count();
    assert_eq!(
        before_active + before_removing - 3,
        after_active + after_removing
    );
    assert_eq!(after_active, 4);
}

#[test]
fn prune_is_idempotent() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();

    let keep = tree.create_group(child, None).unwrap();
    spawn_batch(&mut tree, keep, 2, 100.0);
    let empty_released = tree.create_group(child, None).unwrap();
    tree.release_group(empty_released).unwrap();
    let empty_held = tree.create_group(child, None).unwrap();

    let pruned = tree.remove_invalid_groups(child).unwrap();
    assert_eq!(pruned, 1);
    let after_first: Vec<GroupId> = tree.container(child).unwrap().groups().to_vec();
    assert_eq!(after_first, vec![keep, empty_held]);

    // Second call with no intervening update changes nothing.
    let pruned = tree.remove_invalid_groups(child).unwrap();
    assert_eq!(pruned, 0);
    assert_eq!(tree.container(child).unwrap().groups(), &after_first[..]);
}

#[test]
fn forced_teardown_returns_every_pooled_instance() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let root = tree.root_container();
    let child = tree.get_child(root, 0).unwrap().unwrap();

    // Root instance holds the reference on the child-container group it
    // spawned; the manager holds (and releases) the root group's.
    let root_group = tree.create_group(root, None).unwrap();
    let root_instance = tree
        .create_instance(root_group, InstanceInit::persistent(Mat4::IDENTITY))
        .unwrap()
        .unwrap();
    tree.release_group(root_group).unwrap();

    let child_group = tree.create_group(child, Some(root_instance)).unwrap();
    spawn_batch(&mut tree, child_group, 12, 100.0);

    let live_pooled = tree.instances().pooled_occupied();
    assert_eq!(live_pooled, 12);
    assert_eq!(tree.global().instance_count(), 13);

    tree.remove_forcibly(root, true).unwrap();

    // Every group list is empty (recursively) and the pool got exactly
    // the pooled population back.
    assert!(tree.container(root).unwrap().groups().is_empty());
    assert!(tree.container(child).unwrap().groups().is_empty());
    assert_eq!(tree.instances().pooled_occupied(), 0);
    assert_eq!(tree.global().instance_count(), 0);
}

#[test]
fn teardown_destroys_the_whole_tree() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let root = tree.root_container();
    let child = tree.get_child(root, 0).unwrap().unwrap();

    let root_group = tree.create_group(root, None).unwrap();
    let root_instance = tree
        .create_instance(root_group, InstanceInit::persistent(Mat4::IDENTITY))
        .unwrap()
        .unwrap();
    tree.release_group(root_group).unwrap();
    let child_group = tree.create_group(child, Some(root_instance)).unwrap();
    spawn_batch(&mut tree, child_group, 5, 100.0);

    tree.teardown();

    assert!(tree.container(root).is_err());
    assert!(tree.container(child).is_err());
    assert_eq!(tree.global().instance_count(), 0);

    // Updating an inert tree is a logged no-op.
    let stats = tree.update(true, 1.0, true);
    assert_eq!(stats.instances_advanced, 0);
}

#[test]
fn killing_the_spawner_releases_its_groups() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let root = tree.root_container();
    let child = tree.get_child(root, 0).unwrap().unwrap();

    let root_group = tree.create_group(root, None).unwrap();
    let root_instance = tree
        .create_instance(root_group, InstanceInit::persistent(Mat4::IDENTITY))
        .unwrap()
        .unwrap();
    tree.release_group(root_group).unwrap();
    let child_group = tree.create_group(child, Some(root_instance)).unwrap();

    assert!(tree.group(child_group).unwrap().is_referenced());

    // Kill the root branch only; the child group drains and, once its
    // spawner is reclaimed, loses its reference and gets pruned.
    tree.kill_all_instances(root, false).unwrap();
    tree.update(true, 1.0, true); // Removing -> Removed
    tree.update(true, 1.0, true); // reclaimed; reference released
    let stats = tree.update(true, 1.0, true);

    assert!(stats.groups_pruned > 0 || tree.container(child).unwrap().groups().is_empty());
    assert!(tree.container(child).unwrap().groups().is_empty());
}

#[test]
fn later_construction_wins_the_priority_slot() {
    let nodes = vec![
        EffectNode::root(vec![1, 2]),
        EffectNode {
            kind: NodeKind::Sprite,
            rendering_order: RenderingOrder::CreationOrder,
            rendering_priority: Some(5),
            params: SimParams::default(),
            children: Vec::new(),
        },
        EffectNode {
            kind: NodeKind::Ribbon,
            rendering_order: RenderingOrder::CreationOrder,
            rendering_priority: Some(5),
            params: SimParams::default(),
            children: Vec::new(),
        },
    ];
    let tree = EffectTree::instantiate(nodes, SchedulerConfig::default()).unwrap();

    let root = tree.root_container();
    let second = tree.get_child(root, 1).unwrap().unwrap();
    assert_eq!(tree.global().rendered_container(5), Some(second));
}

#[test]
fn sequential_draw_respects_declared_order() {
    for (order, expected) in [
        (RenderingOrder::CreationOrder, vec![0.0f32, 1.0, 2.0]),
        (RenderingOrder::ReverseOrder, vec![2.0f32, 1.0, 0.0]),
    ] {
        let mut tree =
            EffectTree::instantiate(sprite_tree_nodes(order), SchedulerConfig::default()).unwrap();
        let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();
        let group = tree.create_group(child, None).unwrap();

        for i in 0..3 {
            let init = InstanceInit {
                transform: Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0)),
                velocity: Vec3::ZERO,
                lifetime_frames: 100.0,
            };
            assert!(tree.create_instance(group, init).unwrap().is_some());
        }

        let renderer = Arc::new(RecordingRenderer::default());
        let dyn_renderer: Arc<dyn EffectRenderer> = renderer.clone();
        tree.draw(true, &dyn_renderer);

        let events = renderer.events.lock().clone();
        let drawn: Vec<String> = expected.iter().map(|x| format!("draw:{x}")).collect();
        let mut wanted = vec!["begin:3".to_string(), "group:3".to_string()];
        wanted.extend(drawn);
        wanted.push("end_group".into());
        wanted.push("end".into());
        assert_eq!(events, wanted);
    }
}

#[test]
fn draw_skips_non_active_instances_and_empty_nodes() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();
    let group = tree.create_group(child, None).unwrap();

    spawn_batch(&mut tree, group, 2, 1.0); // expire immediately
    tree.update(true, 1.0, true);

    let renderer = Arc::new(RecordingRenderer::default());
    let dyn_renderer: Arc<dyn EffectRenderer> = renderer.clone();
    tree.draw(true, &dyn_renderer);

    // Nothing Active: the node never begins rendering.
    assert!(renderer.events.lock().is_empty());
}

#[test]
fn striped_async_draw_covers_every_index_in_order() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();
    let group = tree.create_group(child, None).unwrap();

    let count = 37;
    for i in 0..count {
        let init = InstanceInit {
            transform: Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0)),
            velocity: Vec3::ZERO,
            lifetime_frames: 100.0,
        };
        assert!(tree.create_instance(group, init).unwrap().is_some());
    }

    let renderer = Arc::new(RecordingRenderer {
        async_supported: true,
        ..Default::default()
    });
    let dyn_renderer: Arc<dyn EffectRenderer> = renderer.clone();
    tree.draw(true, &dyn_renderer);

    let mut indexed = renderer.indexed.lock().clone();

    // Index i always carries the i-th instance in declared order,
    // regardless of which stripe delivered it.
    for &(index, x) in &indexed {
        assert!((x - index as f32).abs() < f32::EPSILON);
    }

    // Every index exactly once.
    indexed.sort_by_key(|&(index, _)| index);
    let indices: Vec<usize> = indexed.iter().map(|&(index, _)| index).collect();
    assert_eq!(indices, (0..count).collect::<Vec<_>>());

    // The fan-out was joined before draw returned.
    assert_eq!(
        tree.workers().submitted_tasks(),
        tree.workers().completed_tasks()
    );
}

#[test]
fn set_base_matrix_composes_onto_live_transforms() {
    let mut tree =
        EffectTree::instantiate(sprite_tree_nodes(RenderingOrder::CreationOrder), SchedulerConfig::default())
            .unwrap();
    let root = tree.root_container();
    let child = tree.get_child(root, 0).unwrap().unwrap();
    let group = tree.create_group(child, None).unwrap();

    let init = InstanceInit {
        transform: Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0)),
        velocity: Vec3::ZERO,
        lifetime_frames: 100.0,
    };
    let handle = tree.create_instance(group, init).unwrap().unwrap();

    let base = Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0));
    tree.set_base_matrix(root, true, &base).unwrap();

    let world = tree.instance(handle).unwrap().sim().world;
    assert!((world.w_axis.x - 1.0).abs() < 1e-6);
    assert!((world.w_axis.y - 2.0).abs() < 1e-6);
}
