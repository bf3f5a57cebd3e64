//! # The Rendering Interface
//!
//! The scheduler never talks to a GPU. It hands the backend immutable
//! per-instance snapshots in a well-defined order and tells it where
//! node boundaries are. Everything behind this trait - vertex
//! generation, batching, submission - is the backend's business.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::node::EffectNode;

/// Per-instance draw snapshot, laid out for direct upload.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DrawPacket {
    /// World transform of the instance.
    pub world: Mat4,
    /// Elapsed-life ratio in `[0, 1]`, 0 at spawn.
    pub life_ratio: f32,
    /// Node index the instance belongs to.
    pub node: u32,
    /// Padding to a 16-byte multiple.
    pub _pad: [u32; 2],
}

impl DrawPacket {
    /// Builds a packet.
    #[inline]
    #[must_use]
    pub fn new(world: Mat4, life_ratio: f32, node: u32) -> Self {
        Self {
            world,
            life_ratio,
            node,
            _pad: [0; 2],
        }
    }
}

/// The narrow interface a render backend implements.
///
/// All methods take `&self`: backends that buffer internally are expected
/// to synchronize that buffering themselves. The scheduler guarantees the
/// call order `begin_rendering → (begin_group → draws → end_group)* →
/// end_rendering` per visual node, with draws in the node's declared
/// rendering order.
///
/// # Asynchronous submission
///
/// A backend reporting [`is_async_supported`](Self::is_async_supported)
/// receives [`draw_indexed`](Self::draw_indexed) calls from worker
/// threads instead of [`draw`](Self::draw) calls from the frame thread.
/// Each call carries the instance's position in the declared order;
/// calls for distinct indices may arrive concurrently, but within one
/// stripe indices arrive ascending. The fan-out is joined before
/// `end_group` is called.
pub trait EffectRenderer: Send + Sync {
    /// Whether this backend accepts indexed draws from worker threads.
    fn is_async_supported(&self) -> bool {
        false
    }

    /// A visual node is about to draw `instance_count` instances.
    fn begin_rendering(&self, node: &EffectNode, instance_count: usize);

    /// A group of `instance_count` instances is about to draw.
    fn begin_group(&self, node: &EffectNode, instance_count: usize);

    /// Sequential draw of one instance, in declared order.
    fn draw(&self, node: &EffectNode, packet: &DrawPacket);

    /// Indexed draw of one instance, possibly from a worker thread.
    ///
    /// Only called on backends that report async support.
    fn draw_indexed(&self, index: usize, packet: &DrawPacket) {
        let _ = (index, packet);
    }

    /// The current group finished drawing.
    fn end_group(&self, node: &EffectNode);

    /// The current node finished drawing.
    fn end_rendering(&self, node: &EffectNode);
}
