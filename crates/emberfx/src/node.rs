//! # Effect Node Descriptors
//!
//! Immutable, shared per-node data the scheduler reads but never writes.
//! Loading and deserializing these from effect files is the asset
//! pipeline's problem; the scheduler receives the finished tree as a
//! flattened list.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// What a node contributes to the effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// The synthetic root: one instance representing the whole effect.
    /// Never drawn.
    Root,
    /// Invisible aggregation node: updated, never drawn.
    Group,
    /// Camera-facing quad emitter.
    Sprite,
    /// Connected trail emitter.
    Ribbon,
    /// Mesh emitter.
    Mesh,
}

impl NodeKind {
    /// Whether this node kind produces visible geometry.
    #[inline]
    #[must_use]
    pub const fn is_leaf_visual(self) -> bool {
        matches!(self, Self::Sprite | Self::Ribbon | Self::Mesh)
    }
}

/// Order in which a node's instances are handed to the renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderingOrder {
    /// First-created instance draws first.
    CreationOrder,
    /// Last-created instance draws first.
    ReverseOrder,
}

/// Per-instance simulation parameters, fixed per node.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimParams {
    /// Constant acceleration applied every frame.
    pub gravity: Vec3,
    /// Velocity damping coefficient per frame.
    pub drag: f32,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            gravity: Vec3::ZERO,
            drag: 0.0,
        }
    }
}

/// One node of the effect-definition tree.
///
/// Nodes are immutable once the tree is instantiated. The container tree
/// mirrors this topology one-to-one: every node gets exactly one
/// container, and a container's fixed child arity is the node's child
/// count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EffectNode {
    /// What this node contributes.
    pub kind: NodeKind,
    /// Draw order for this node's instances.
    pub rendering_order: RenderingOrder,
    /// Rendering-priority slot for external draw-order composition, or
    /// `None` when the node does not participate.
    pub rendering_priority: Option<usize>,
    /// Simulation parameters shared by every instance of this node.
    pub params: SimParams,
    /// Child node indices into the flattened node list. Children always
    /// have larger indices than their parent.
    pub children: Vec<usize>,
}

impl EffectNode {
    /// Creates a root node with the given children.
    #[must_use]
    pub fn root(children: Vec<usize>) -> Self {
        Self {
            kind: NodeKind::Root,
            rendering_order: RenderingOrder::CreationOrder,
            rendering_priority: None,
            params: SimParams::default(),
            children,
        }
    }

    /// Creates a leaf sprite node with default parameters.
    #[must_use]
    pub fn sprite() -> Self {
        Self {
            kind: NodeKind::Sprite,
            rendering_order: RenderingOrder::CreationOrder,
            rendering_priority: None,
            params: SimParams::default(),
            children: Vec::new(),
        }
    }
}
