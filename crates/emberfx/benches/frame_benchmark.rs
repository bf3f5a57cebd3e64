//! # Frame Update Benchmark
//!
//! ARCHITECT'S REQUIREMENTS:
//! - The sync path must stay flat up to the threshold
//! - The fan-out must beat the sync path well before 10k instances
//!
//! Run with: `cargo bench --package emberfx`

// Benchmarks don't need docs and may have intentionally unused code
#![allow(missing_docs)]
#![allow(dead_code)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::{Mat4, Vec3};

use emberfx::{
    EffectNode, EffectTree, InstanceInit, NodeKind, RenderingOrder, SchedulerConfig, SimParams,
};

/// Root plus one sprite emitter.
fn nodes() -> Vec<EffectNode> {
    vec![
        EffectNode::root(vec![1]),
        EffectNode {
            kind: NodeKind::Sprite,
            rendering_order: RenderingOrder::CreationOrder,
            rendering_priority: None,
            params: SimParams {
                gravity: Vec3::new(0.0, -0.05, 0.0),
                drag: 0.02,
            },
            children: Vec::new(),
        },
    ]
}

/// Builds a tree with `count` long-lived instances in one container.
fn populated_tree(count: usize, config: SchedulerConfig) -> EffectTree {
    let mut tree = EffectTree::instantiate(nodes(), config).unwrap();
    let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();
    let group = tree.create_group(child, None).unwrap();

    for i in 0..count {
        let init = InstanceInit {
            transform: Mat4::from_translation(Vec3::new(i as f32 * 0.01, 0.0, 0.0)),
            velocity: Vec3::new(0.1, 0.5, 0.0),
            lifetime_frames: f32::INFINITY,
        };
        let spawned = tree.create_instance(group, init).unwrap();
        assert!(spawned.is_some(), "raise instance_capacity for the bench");
    }
    tree
}

/// Benchmark: one frame of update across population sizes, both paths.
fn bench_frame_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_update");

    for count in [32usize, 256, 2_048, 16_384] {
        let config = SchedulerConfig {
            instance_capacity: 32_768,
            ..Default::default()
        };
        let mut tree = populated_tree(count, config);
        group.bench_with_input(
            BenchmarkId::new("threshold_gated", count),
            &count,
            |b, _| {
                b.iter(|| black_box(tree.update(true, 1.0, true)));
            },
        );

        let sync_config = SchedulerConfig {
            instance_capacity: 32_768,
            parallel_threshold: usize::MAX,
            ..Default::default()
        };
        let mut sync_tree = populated_tree(count, sync_config);
        group.bench_with_input(BenchmarkId::new("forced_sync", count), &count, |b, _| {
            b.iter(|| black_box(sync_tree.update(true, 1.0, true)));
        });
    }

    group.finish();
}

/// Benchmark: spawn/expire churn through the pooled region.
fn bench_spawn_churn(c: &mut Criterion) {
    c.bench_function("spawn_churn_1k", |b| {
        let config = SchedulerConfig {
            instance_capacity: 4_096,
            ..Default::default()
        };
        let mut tree = EffectTree::instantiate(nodes(), config).unwrap();
        let child = tree.get_child(tree.root_container(), 0).unwrap().unwrap();

        b.iter(|| {
            let group = tree.create_group(child, None).unwrap();
            for _ in 0..1_000 {
                let init = InstanceInit {
                    transform: Mat4::IDENTITY,
                    velocity: Vec3::ZERO,
                    lifetime_frames: 1.0,
                };
                black_box(tree.create_instance(group, init).unwrap());
            }
            tree.release_group(group).unwrap();
            // Expire, finalize, reclaim, prune.
            tree.update(true, 1.0, true);
            tree.update(true, 1.0, true);
            tree.update(true, 1.0, true);
        });
    });
}

criterion_group!(benches, bench_frame_update, bench_spawn_churn);
criterion_main!(benches);
