//! Hardware collaborator interfaces.
//!
//! Everything the boot service touches outside its own state lives behind
//! the [`Platform`] trait: the monotonic clock, boot triggers, the PMP
//! write oracle, the DMA copy engine, the supervisor domain registry and
//! the system status registers. The service never reads application-hart
//! state directly; it only asks the platform.

use crate::image::BootImage;
use crate::types::{HartId, HartMask, PrivMode};

/// System-wide boot lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Event {
    /// DDR training finished; main memory is usable
    DdrTrained = 0,
    /// Early monitor startup is complete
    StartupComplete = 1,
    /// Every application hart finished booting (successfully or not)
    BootComplete = 2,
    /// A restart request was dispatched to the machines
    PostBoot = 3,
}

/// Externally visible run state of an application hart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HartRunState {
    /// Parked, waiting for work
    Idle,
    /// Executing the boot sequence
    Booting,
    /// Released into its payload
    Running,
}

/// Parameters of a supervisor domain registration
///
/// A domain groups the co-boot set of an entry point under its primary
/// boot hart; the supervisor runtime uses it to bring the group up as one
/// unit.
#[derive(Debug, Clone, Copy)]
pub struct DomainConfig<'a> {
    /// Payload name from the image
    pub name: &'a str,
    /// All harts booting into this domain
    pub hart_mask: HartMask,
    /// The hart that owns the domain's payload
    pub boot_hart: HartId,
    /// Privilege mode the domain starts in
    pub priv_mode: PrivMode,
    /// Domain entry point
    pub entry: usize,
    /// Supervisor-init argument: ancillary data or a fallback devicetree
    pub arg1: Option<usize>,
    /// Domain may cold-reboot itself
    pub allow_cold_reboot: bool,
    /// Domain may warm-reboot itself
    pub allow_warm_reboot: bool,
}

/// Interface to the platform collaborators of the boot service
pub trait Platform {
    /// Monotonic tick counter (milliseconds on the reference platform)
    fn now(&self) -> u64;

    /// True once `interval` ticks have passed since `start`
    fn is_elapsed(&self, start: u64, interval: u64) -> bool {
        self.now().saturating_sub(start) >= interval
    }

    /// Poll a lifecycle event
    fn is_notified(&self, event: Event) -> bool;

    /// Raise a lifecycle event; raising twice is a no-op
    fn notify(&mut self, event: Event);

    /// True when `hart` is permitted to write `[addr, addr + len)`
    fn pmp_check_write(&self, hart: HartId, addr: usize, len: usize) -> bool;

    /// Copy `src` to physical address `dst` via the DMA engine
    fn dma_write(&mut self, dst: usize, src: &[u8]);

    /// Clear `[dst, dst + len)`
    fn zero_mem(&mut self, dst: usize, len: usize);

    /// True when `addr` falls inside DDR (usable only after training)
    fn is_addr_in_ddr(&self, addr: usize) -> bool;

    /// Drive the boot-fail control register
    fn set_boot_fail(&mut self, failed: bool);

    /// Set the per-hart boot-status indicator bit (status only, no
    /// functional side effect)
    fn set_boot_status(&mut self, hart: HartId);

    /// Publish the externally visible run state of a hart
    fn hart_state_set(&mut self, hart: HartId, state: HartRunState);

    /// Record `peer` as a member of `boot_hart`'s domain
    fn register_hart(&mut self, peer: HartId, boot_hart: HartId);

    /// Remove `peer` from domain bookkeeping
    fn deregister_hart(&mut self, peer: HartId);

    /// Register a supervisor domain for a primary boot hart
    fn register_boot_hart(&mut self, domain: &DomainConfig<'_>);

    /// Program and lock the PMP registers of the calling hart from the
    /// platform configuration
    fn program_pmp(&mut self, hart: HartId);

    /// Configure the peripheral bus control register
    fn configure_bus(&mut self);

    /// Reserve a performance counter for boot timing
    fn perf_ctr_allocate(&mut self, name: &'static str) -> Option<usize>;

    /// Record a lap on a previously allocated counter
    fn perf_ctr_lap(&mut self, counter: usize);

    /// Verify the image signature; only consulted when code signing is
    /// configured
    fn check_code_signing(&mut self, image: &BootImage<'_>) -> bool {
        let _ = image;
        true
    }

    /// Enter a payload on the monitor hart itself (custom boot flow only)
    fn enter_payload(&mut self, entry: usize) {
        let _ = entry;
    }
}
