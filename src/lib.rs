//! A typed façade over the Linux cgroup v1 hierarchies: discovering mounted
//! subsystems, creating and tearing down per-container cgroup directories,
//! enforcing resource limits, reading usage statistics, and bridging kernel
//! notifications (OOM, usage thresholds) to application callbacks.

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod controller;
pub mod error;
pub mod events;
pub mod factory;
pub mod handler;
pub mod hierarchy;
pub mod kernel_fs;
pub mod parsing;
pub mod spec;

pub use error::{Error, ErrorKind, Result};
