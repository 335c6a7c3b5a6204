//! Tether test harness
//!
//! This crate provides:
//! - An in-process cluster: main-core runtime plus loopback workers
//! - A chaos transport injecting latency and transient send failures
//! - End-to-end scenarios over both

pub mod chaos;
pub mod cluster;

#[cfg(test)]
mod scenarios;

pub use chaos::*;
pub use cluster::*;
