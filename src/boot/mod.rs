//! The boot service.
//!
//! `BootService` owns the four per-hart state machines, the registered
//! boot image handle and the process-wide completion flags; constructing a
//! service models a monitor reset (everything zero-initialised). The
//! public surface registers and validates images, restarts harts, answers
//! PMP setup requests from application harts and aggregates boot
//! completion. The hardware is reached through the [`Platform`] and
//! [`IpiTransport`] traits so the whole service runs unmodified under the
//! test doubles.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::boot_log;
use crate::image::{BootImage, FLAG_SKIP_AUTOBOOT, IMAGE_MAGIC};
use crate::ipi::{IpiMessage, IpiOp, IpiTransport};
use crate::platform::{Event, HartRunState, Platform};
use crate::sched::SchedStats;
use crate::types::{HartId, HartMask, HartSelect, PrivMode, NUM_APP_HARTS, NUM_HARTS};

mod states;

#[cfg(test)]
pub mod mock;


pub use states::{
    BootState, ONE_SEC, SETUP_PMP_COMPLETE_TIMEOUT, SUB_CHUNK_SIZE, WAIT_TIMEOUT,
};

use states::BootMachine;

/// Boot failure kinds
///
/// Machine-level failures never travel up a call stack; they move the
/// machine to [`BootState::Error`] and surface through the boot-fail
/// register. These kinds are returned by the control surface only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// No boot image has been registered
    NoImage,
    /// Magic, signature or CRC validation failed, or the selected harts
    /// have nothing to boot
    BadImage,
    /// An acknowledgement did not arrive inside the per-state budget
    Timeout,
    /// A chunk failed the ownership or PMP write check
    PermissionDenied,
    /// The IPI transport refused a delivery
    DeliveryFailed,
}

/// Result type for control surface operations
pub type BootResult<T> = Result<T, BootError>;

/// Build-time style configuration of the boot flow
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Devicetree blob used as the supervisor-init argument when an image
    /// carries no ancillary data
    pub fallback_dtb: Option<usize>,
    /// Run the synchronous custom boot flow from image validation
    pub custom_flow: bool,
    /// Accept remote-proc boot requests carrying an embedded target
    pub remote_proc: bool,
    /// Consult the signature verifier during image validation
    pub crypto_signing: bool,
    /// Trace individual chunk downloads on the console
    pub chunk_debug: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            fallback_dtb: None,
            custom_flow: false,
            remote_proc: false,
            crypto_signing: false,
            chunk_debug: false,
        }
    }
}

/// Everything a machine step may touch besides the machine itself
pub(crate) struct StepCtx<'a, 'img> {
    pub config: &'a BootConfig,
    pub image: Option<&'a BootImage<'img>>,
    pub boot_complete: &'a [AtomicBool; NUM_HARTS],
    pub plat: &'a mut dyn Platform,
    pub ipi: &'a mut dyn IpiTransport,
}

const MACHINE_NAMES: [&str; NUM_APP_HARTS] = [
    "boot_service(hart1)",
    "boot_service(hart2)",
    "boot_service(hart3)",
    "boot_service(hart4)",
];

/// The multi-hart boot service running on the monitor hart
pub struct BootService<'img> {
    config: BootConfig,
    image: Option<BootImage<'img>>,
    machines: [BootMachine; NUM_APP_HARTS],
    boot_complete: [AtomicBool; NUM_HARTS],
    pmp_setup_done: [AtomicBool; NUM_HARTS],
    stats: SchedStats,
}

impl<'img> BootService<'img> {
    /// Create a freshly reset service: all machines idle, no image, no
    /// completion or PMP setup flags
    pub fn new(config: BootConfig) -> Self {
        BootService {
            config,
            image: None,
            machines: [
                BootMachine::new(HartId::App1, MACHINE_NAMES[0]),
                BootMachine::new(HartId::App2, MACHINE_NAMES[1]),
                BootMachine::new(HartId::App3, MACHINE_NAMES[2]),
                BootMachine::new(HartId::App4, MACHINE_NAMES[3]),
            ],
            boot_complete: [const { AtomicBool::new(false) }; NUM_HARTS],
            pmp_setup_done: [const { AtomicBool::new(false) }; NUM_HARTS],
            stats: SchedStats::default(),
        }
    }

    /// Register (or replace) the current boot image
    pub fn register_image(&mut self, image: BootImage<'img>) {
        self.image = Some(image);
    }

    /// The currently registered image, if any
    pub fn image(&self) -> Option<&BootImage<'img>> {
        self.image.as_ref()
    }

    /// Scheduler counters
    pub fn stats(&self) -> SchedStats {
        self.stats
    }

    /// Current state of an application hart's machine
    pub fn machine_state(&self, hart: HartId) -> Option<BootState> {
        self.machines
            .iter()
            .find(|machine| machine.target == hart)
            .map(|machine| machine.core.state)
    }

    /// Completion flag of an application hart
    pub fn boot_complete(&self, hart: HartId) -> bool {
        self.boot_complete[hart.index()].load(Ordering::Acquire)
    }

    /// One cooperative scheduler round: step every machine once, in fixed
    /// table order
    pub fn tick(&mut self, plat: &mut dyn Platform, ipi: &mut dyn IpiTransport) {
        let BootService { config, image, machines, boot_complete, stats, .. } = self;
        stats.ticks += 1;

        for machine in machines.iter_mut() {
            let mut ctx = StepCtx {
                config: &*config,
                image: image.as_ref(),
                boot_complete: &*boot_complete,
                plat: &mut *plat,
                ipi: &mut *ipi,
            };
            machine.step(&mut ctx, &mut *stats);
        }
    }

    /// Validate the registered image: magic, optional code signing, header
    /// CRC
    ///
    /// When the custom boot flow is configured, a passing validation runs
    /// it synchronously and returns its result.
    pub fn validate_image(
        &self,
        plat: &mut dyn Platform,
        ipi: &mut dyn IpiTransport,
    ) -> bool {
        let image = match self.image.as_ref() {
            Some(image) => image,
            None => {
                boot_log!(Error, "boot image missing, ignoring");
                return false;
            }
        };

        if image.magic() != IMAGE_MAGIC {
            boot_log!(Error, "boot image magic invalid, ignoring");
            return false;
        }
        if self.config.crypto_signing && !plat.check_code_signing(image) {
            boot_log!(Error, "boot image failed code signing");
            return false;
        }
        if !image.validate_crc() {
            boot_log!(Error, "boot image failed crc");
            return false;
        }

        boot_log!(Normal, "boot image set name: \"{}\"", image.set_name());

        if self.config.custom_flow {
            self.boot_custom(plat, ipi)
        } else {
            true
        }
    }

    /// Restart one application hart (with its co-boot peers) or all of
    /// them
    pub fn restart_core(
        &mut self,
        source: HartSelect,
        plat: &mut dyn Platform,
        ipi: &mut dyn IpiTransport,
    ) -> BootResult<()> {
        match source {
            HartSelect::Hart(hart) => {
                self.restart_cores_using_mask(HartMask::single(hart), plat, ipi)
            }
            HartSelect::All => {
                if self.image.is_none() {
                    return Err(BootError::NoImage);
                }
                if !self.validate_image(plat, ipi) {
                    boot_log!(Error, "validation failed for all harts");
                    return Err(BootError::BadImage);
                }
                if self.boot_using_hart_mask(HartMask::all_app(), plat) {
                    Ok(())
                } else {
                    Err(BootError::BadImage)
                }
            }
        }
    }

    /// Restart the harts named in `mask`
    ///
    /// Each set bit is expanded to its co-boot set (every peer sharing the
    /// entry point) before its machines are driven; peers already
    /// restarted as part of an earlier bit are masked off and not
    /// processed twice.
    pub fn restart_cores_using_mask(
        &mut self,
        mask: HartMask,
        plat: &mut dyn Platform,
        ipi: &mut dyn IpiTransport,
    ) -> BootResult<()> {
        if self.image.is_none() {
            boot_log!(Error, "no boot image registered");
            return Err(BootError::NoImage);
        }
        if !self.validate_image(plat, ipi) {
            boot_log!(Error, "validation failed for hart mask 0x{:x}", mask);
            return Err(BootError::BadImage);
        }

        // snapshot the per-hart boot parameters before driving machines
        let (entries, chunk_counts) = {
            let image = match self.image.as_ref() {
                Some(image) => image,
                None => return Err(BootError::NoImage),
            };
            let mut entries = [None; NUM_APP_HARTS];
            let mut chunk_counts = [0u32; NUM_APP_HARTS];
            for hart in HartId::APP {
                let entry = image.hart(hart);
                entries[hart.app_index()] = entry.entry_point;
                chunk_counts[hart.app_index()] = entry.num_chunks;
            }
            (entries, chunk_counts)
        };

        let mut mask = mask;
        let mut result = Err(BootError::BadImage);

        for source in HartId::APP {
            if !mask.contains(source) {
                continue;
            }

            let mut local_mask = HartMask::new();
            for peer in HartId::APP {
                if peer == source {
                    continue;
                }
                if entries[peer.app_index()] == entries[source.app_index()] {
                    // another hart in the same boot set
                    local_mask.set(peer);
                }
            }
            local_mask.set(source);

            if chunk_counts[source.app_index()] != 0
                && self.boot_using_hart_mask(local_mask, plat)
            {
                result = Ok(());
            }

            // co-boot peers are restarted together, never twice
            mask.clear_mask(local_mask);
        }

        result
    }

    /// Drive every machine named in `mask` towards a restart
    fn boot_using_hart_mask(&mut self, mask: HartMask, plat: &mut dyn Platform) -> bool {
        let mut result = false;

        for machine in self.machines.iter_mut() {
            if !mask.contains(machine.target) {
                continue;
            }

            match machine.core.state {
                BootState::OpenSbiInit => {
                    machine.core.state = BootState::OpenSbiInit;
                    result = true;
                }
                BootState::SetupPmpComplete | BootState::Idle | BootState::Initialization => {
                    machine.core.state = BootState::Initialization;
                    result = true;
                }
                other => {
                    boot_log!(
                        Error,
                        "invalid machine state {} for {}",
                        other.name(),
                        machine.target
                    );
                    // recover anyway
                    machine.core.state = BootState::Initialization;
                    result = true;
                }
            }
        }

        plat.notify(Event::PostBoot);
        result
    }

    /// True when the image stops the target's boot after PMP setup
    pub fn skip_boot_is_set(&self, target: HartId) -> bool {
        match self.image.as_ref() {
            Some(image) => image.hart(target).flags & FLAG_SKIP_AUTOBOOT != 0,
            None => false,
        }
    }

    /// Handle a PMP setup request on an application hart
    ///
    /// Runs on the application hart itself in response to the monitor's
    /// `PmpSetup` message. The PMP registers are programmed and locked at
    /// most once between resets; repeated calls succeed without touching
    /// the hardware again. The registers are hart-local CSRs, which is why
    /// the monitor cannot program them remotely.
    pub fn pmp_setup_handler(
        &self,
        hart: HartId,
        plat: &mut dyn Platform,
    ) -> BootResult<()> {
        plat.hart_state_set(hart, HartRunState::Booting);

        if !self.pmp_setup_done[hart.index()].swap(true, Ordering::AcqRel) {
            plat.program_pmp(hart);
            plat.configure_bus();
        }

        Ok(())
    }

    /// Entry point for boot-related IPIs from application harts
    ///
    /// A remote-proc request (when configured) carries the true target in
    /// its buffer; that machine is moved straight to supervisor-init and
    /// the restart is issued for it instead of the interrupting hart.
    pub fn ipi_handler(
        &mut self,
        source: HartId,
        rproc_target: Option<HartId>,
        plat: &mut dyn Platform,
        ipi: &mut dyn IpiTransport,
    ) -> BootResult<()> {
        let mut source = source;

        if self.config.remote_proc {
            if let Some(target) = rproc_target {
                // payload already placed by the remote-proc loader
                if let Some(machine) =
                    self.machines.iter_mut().find(|machine| machine.target == target)
                {
                    machine.core.state = BootState::OpenSbiInit;
                }
                source = target;
            }
        }

        self.restart_core(HartSelect::Hart(source), plat, ipi)
    }

    /// Synchronous boot flow: zero-init and download for a single target
    /// hart on the monitor itself, then release every hart to the common
    /// entry point in M-mode and enter the payload
    pub fn boot_custom(&self, plat: &mut dyn Platform, ipi: &mut dyn IpiTransport) -> bool {
        let image = match self.image.as_ref() {
            Some(image) => image,
            None => return false,
        };

        // the last hart with chunks wins the target selection
        let mut target = None;
        let mut first_chunk = 0usize;
        for hart in HartId::APP {
            let entry = image.hart(hart);
            if entry.num_chunks != 0 {
                target = Some(hart);
                first_chunk = entry.first_chunk as usize;
            }
        }
        let target = match target {
            Some(target) => target,
            None => {
                boot_log!(Error, "failed to find target hart");
                return false;
            }
        };

        boot_log!(Normal, "zeroing chunks for {}", target);
        let mut index = 0usize;
        while let Some(zi) = image.zi_chunk(index) {
            if zi.size == 0 {
                break;
            }
            if zi.owner_hart() == Some(target) {
                if self.config.chunk_debug {
                    boot_log!(Normal, "{}:zi chunk->0x{:x}, {} bytes", index, zi.exec_addr, zi.size);
                }
                plat.zero_mem(zi.exec_addr, zi.size);
            }
            index += 1;
        }

        boot_log!(Normal, "downloading chunks for {}", target);
        let mut cursor = first_chunk;
        let mut sub_chunk_offset = 0usize;
        while let Some(chunk) = image.chunk(cursor) {
            if chunk.size == 0 {
                break;
            }
            if chunk.owner == target.index() as u32
                && plat.pmp_check_write(target, chunk.exec_addr, chunk.size)
            {
                if self.config.chunk_debug && sub_chunk_offset == 0 {
                    boot_log!(
                        Normal,
                        "{}:chunk@0x{:x}->0x{:x}, {} bytes",
                        cursor,
                        chunk.load_addr,
                        chunk.exec_addr,
                        chunk.size
                    );
                }
                let len = SUB_CHUNK_SIZE.min(chunk.size.saturating_sub(sub_chunk_offset));
                if len != 0 {
                    if let Some(src) = image.chunk_bytes(&chunk, sub_chunk_offset, len) {
                        plat.dma_write(chunk.exec_addr + sub_chunk_offset, src);
                    }
                }
                sub_chunk_offset += SUB_CHUNK_SIZE;
                if sub_chunk_offset > chunk.size {
                    sub_chunk_offset = 0;
                    cursor += 1;
                }
            } else {
                cursor += 1;
            }
        }

        let entry = match image.hart(target).entry_point {
            Some(entry) => entry,
            None => {
                boot_log!(Error, "no entry point for {}", target);
                return false;
            }
        };

        // every hart, monitor included, jumps to the common entry in M-mode
        boot_log!(Normal, "all harts jumping to entry address 0x{:x} in m-mode", entry);
        for hart in HartId::APP {
            ipi.send(
                hart,
                IpiMessage::release(IpiOp::OpenSbiInit, PrivMode::Machine, Some(entry), None),
            );
        }
        plat.enter_payload(entry);

        true
    }
}

/// Ask `target` to program its PMPs; returns the in-flight slot index
///
/// The slot is freed again when the transport refuses the delivery.
pub fn pmp_setup_request(ipi: &mut dyn IpiTransport, target: HartId) -> Option<u32> {
    let index = ipi.alloc()?;

    if ipi.deliver(index, target, IpiMessage::control(IpiOp::PmpSetup)) {
        Some(index)
    } else {
        boot_log!(Normal, "{}: failed to send message, so freeing", target);
        ipi.free(index);
        None
    }
}

/// Ask `target` to run its supervisor runtime init; returns the in-flight
/// slot index
pub fn sbi_setup_request(ipi: &mut dyn IpiTransport, target: HartId) -> Option<u32> {
    let index = ipi.alloc()?;

    if ipi.deliver(index, target, IpiMessage::control(IpiOp::OpenSbiInit)) {
        Some(index)
    } else {
        boot_log!(Normal, "{}: failed to send message, so freeing", target);
        ipi.free(index);
        None
    }
}
