//! # stockade-cgroup
//!
//! Low-level cgroup v1 primitives for the stockade supervisor.
//!
//! This crate provides:
//! - **Knob I/O**: scoped reads and writes of cgroup control files with
//!   errno classification and atomic replacement.
//! - **Cgroup handles**: plain value types denoting one directory in one
//!   controller's hierarchy.
//! - **Subsystem registry**: the freezer, cpuacct, and memory controllers,
//!   each knowing its mount root and controller-specific helpers.

pub mod cgroup;
pub mod fsio;
pub mod subsystem;
