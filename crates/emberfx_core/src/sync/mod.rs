//! # Frame-Thread Synchronization
//!
//! ARCHITECT'S ORDER: one fan-out, one barrier, no overlap.
//!
//! ## The Problem
//!
//! ```text
//! Frame thread:  walks the container tree, mutates lists
//! Workers:       advance per-instance numeric state
//!
//! Shared mutation from workers: RACE CONDITION → CRASH
//! A lock per instance:          CONTENTION → missed frames
//! ```
//!
//! ## The Solution: Owned Work + Barrier Join
//!
//! ```text
//! Frame thread:  snapshot work items  →  push N tasks  →  wait_all()
//! Workers:       run tasks they own outright, signal when in-flight == 0
//! Frame thread:  apply results single-threaded, relink lists
//! ```
//!
//! Workers never see list structure. The frame thread never blocks on
//! anything but its own barrier.

mod worker_pool;

pub use worker_pool::WorkerPool;
