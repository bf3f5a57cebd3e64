//! # EMBERFX Instance Scheduler
//!
//! THE ARCHITECT'S ORCHESTRATION:
//! ```text
//! Frame N, per container (depth-first, child-index order):
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ 1. COUNT                                                            │
//! │    └─ Sum active instances across the container's groups            │
//! │                                                                     │
//! │ 2a. SYNC PATH (count < threshold)                                   │
//! │    └─ Per group: reclaim → advance → frame counter                  │
//! │                                                                     │
//! │ 2b. PARALLEL PATH (count >= threshold)                              │
//! │    ├─ Per group: reclaim, snapshot work items                       │
//! │    ├─ Split work into K contiguous ranges, push K tasks             │
//! │    ├─ wait_all()                        ← the only barrier          │
//! │    └─ Per group: apply results, relink lists, frame counter         │
//! │                                                                     │
//! │ 3. PRUNE                                                            │
//! │    └─ Drop groups with no instances and no external reference       │
//! │                                                                     │
//! │ 4. RECURSE into child containers                                    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Drawing is a separate walk over the same tree, reading only `Active`
//! instances, striped across workers when the render backend supports
//! indexed asynchronous submission.
//!
//! ## Lifecycle
//!
//! Instances move strictly forward through `Active → Removing → Removed`.
//! `Removing` is a one-frame quarantine: the transition is observed by the
//! next reclamation pass, never the current one. `Removed` storage returns
//! to the slot pool (non-root) or is freed (root).

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod container;
pub mod error;
pub mod global;
pub mod group;
pub mod instance;
pub mod node;
pub mod partition;
pub mod renderer;
pub mod stats;
pub mod tree;

pub use config::SchedulerConfig;
pub use container::{ContainerId, InstanceContainer};
pub use error::{EffectError, EffectResult};
pub use global::InstanceGlobal;
pub use group::{GroupId, InstanceGroup};
pub use instance::{Instance, InstanceHandle, InstanceInit, InstanceState, InstanceStore, SimState};
pub use node::{EffectNode, NodeKind, RenderingOrder, SimParams};
pub use renderer::{DrawPacket, EffectRenderer};
pub use stats::UpdateStats;
pub use tree::EffectTree;
