//! bootmon - a cooperative multi-hart boot service
//!
//! This crate implements the boot service that runs on the monitor hart of a
//! heterogeneous multi-core RISC-V SoC. The monitor parses a packaged boot
//! image in shared memory, drives per-hart physical memory protection setup
//! on each application hart, places executable chunks subject to PMP
//! permission checks, zero-initialises BSS regions, and releases each
//! application hart into its supervisor runtime or entry point.
//!
//! Four per-hart state machines run in lockstep under a single-threaded
//! cooperative scheduler; all waiting is expressed by re-entering a state on
//! the next tick. Hardware collaborators (IPI transport, DMA copy engine,
//! PMP oracle, domain registry, timers and triggers) are reached through the
//! traits in [`platform`] and [`ipi`].

#![no_std]
// Hart-indexed tables use explicit index arithmetic for clarity
#![allow(clippy::needless_range_loop)]

#[cfg(test)]
#[macro_use]
extern crate std;

// Core types
pub mod types;

// Debug output
pub mod console;

// Boot image model and validator
pub mod image;

// IPI message types and transport interface
pub mod ipi;

// Hardware collaborator interfaces
pub mod platform;

// Cooperative state machine bookkeeping
pub mod sched;

// The boot service itself
pub mod boot;

/// Service version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Service name
pub const NAME: &str = "bootmon";

/// Initialise the service library
pub fn init() {
    console::init();
}
