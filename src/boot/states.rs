//! Per-hart boot state machine.
//!
//! One machine per application hart, all driven in lockstep by the
//! monitor's cooperative scheduler. A machine walks its hart through PMP
//! setup, zero-init, chunk download, supervisor-runtime release and ack
//! collection; every wait is expressed by staying in a state until the
//! next tick. Failures never propagate as return values: the machine moves
//! to `Error`, raises the boot-fail register and converges through
//! `Complete` so the aggregate still settles.

use core::sync::atomic::Ordering;

use crate::boot_log;
use crate::boot::{pmp_setup_request, StepCtx};
use crate::image::{
    ChunkDesc, FLAG_SKIP_AUTOBOOT, FLAG_SKIP_OPENSBI, FLAG_ALLOW_COLD_REBOOT,
    FLAG_ALLOW_WARM_REBOOT,
};
use crate::ipi::{IpiMessage, IpiOp, IpiTransport};
use crate::platform::{DomainConfig, Event, HartRunState, Platform};
use crate::sched::{SchedStats, StateMachine};
use crate::types::{HartId, HartMask, NUM_APP_HARTS};

/// One monotonic second, in platform ticks
pub const ONE_SEC: u64 = 1_000;

/// Budget for collecting PMP setup acknowledgements
pub const SETUP_PMP_COMPLETE_TIMEOUT: u64 = ONE_SEC;

/// Budget for collecting supervisor-init acknowledgements
pub const WAIT_TIMEOUT: u64 = 5 * ONE_SEC;

/// Bytes copied per tick while downloading a chunk, so the scheduler stays
/// responsive
pub const SUB_CHUNK_SIZE: usize = 256;

/// Boot machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    /// Waiting for DDR training and startup completion
    Initialization,
    /// Requesting PMP programming on the target hart
    SetupPmp,
    /// Collecting the PMP setup acknowledgement
    SetupPmpComplete,
    /// Clearing the target's zero-init regions
    ZeroInitChunks,
    /// Copying payload chunks to their execution addresses
    DownloadChunks,
    /// Releasing the co-boot set into the supervisor runtime
    OpenSbiInit,
    /// Collecting release acknowledgements
    Wait,
    /// Publishing completion and polling the aggregate
    Complete,
    /// Parked; consuming boot requests
    Idle,
    /// Boot failed; converges to `Complete`
    Error,
}

impl BootState {
    /// Short state name for the console
    pub fn name(self) -> &'static str {
        match self {
            BootState::Initialization => "Init",
            BootState::SetupPmp => "SetupPMP",
            BootState::SetupPmpComplete => "SetupPMPComplete",
            BootState::ZeroInitChunks => "ZeroInit",
            BootState::DownloadChunks => "Download",
            BootState::OpenSbiInit => "OpenSBIInit",
            BootState::Wait => "Wait",
            BootState::Complete => "Complete",
            BootState::Idle => "Idle",
            BootState::Error => "Error",
        }
    }
}

/// Per-machine mutable work set
#[derive(Debug)]
pub(crate) struct LocalData {
    /// Cursor into the global chunk table
    pub chunk_cursor: usize,
    /// Cursor into the zero-init table
    pub zi_cursor: usize,
    /// Chunks copied for the target so far
    pub chunk_count: usize,
    /// Byte offset into the chunk currently being copied
    pub sub_chunk_offset: usize,
    /// Primary message slot (PMP setup)
    pub msg_index: Option<u32>,
    /// Auxiliary message slots, one per application hart
    pub msg_index_aux: [Option<u32>; NUM_APP_HARTS],
    /// Co-boot set accumulated by `register_harts`
    pub hart_mask: HartMask,
    /// Peer walk position for the supervisor-init fan-out
    pub iterator: usize,
    /// Execution address of the ancillary data chunk, once seen
    pub ancilliary_data: Option<usize>,
    /// Boot timing counter handle
    pub perf_ctr: Option<usize>,
}

impl LocalData {
    pub(crate) const fn new() -> Self {
        LocalData {
            chunk_cursor: 0,
            zi_cursor: 0,
            chunk_count: 0,
            sub_chunk_offset: 0,
            msg_index: None,
            msg_index_aux: [None; NUM_APP_HARTS],
            hart_mask: HartMask::new(),
            iterator: 0,
            ancilliary_data: None,
            perf_ctr: None,
        }
    }
}

/// A boot state machine bound to one application hart
#[derive(Debug)]
pub(crate) struct BootMachine {
    pub core: StateMachine<BootState>,
    pub target: HartId,
    pub local: LocalData,
}

impl BootMachine {
    pub(crate) const fn new(target: HartId, name: &'static str) -> Self {
        BootMachine {
            core: StateMachine::new(name, BootState::Idle),
            target,
            local: LocalData::new(),
        }
    }

    /// One scheduler step: observed transition callbacks, then the handler
    /// for the current state
    pub(crate) fn step(&mut self, ctx: &mut StepCtx<'_, '_>, stats: &mut SchedStats) {
        if self.core.transition_pending() {
            stats.transitions += 1;
            if let Some(prev) = self.core.prev_state {
                if self.core.debug {
                    boot_log!(
                        Status,
                        "{}::[{} -> {}]",
                        self.core.name,
                        prev.name(),
                        self.core.state.name()
                    );
                }
                self.on_exit(prev, ctx);
            }
            // the exit callback may redirect the transition
            let next = self.core.state;
            self.core.prev_state = Some(next);
            self.on_entry(next, ctx);
        }
        self.run_handler(ctx);
        self.core.execution_count += 1;
    }

    fn on_entry(&mut self, state: BootState, ctx: &mut StepCtx<'_, '_>) {
        match state {
            BootState::SetupPmp => self.setup_pmp_on_entry(ctx),
            BootState::ZeroInitChunks => self.zero_init_chunks_on_entry(ctx),
            BootState::DownloadChunks => self.download_chunks_on_entry(ctx),
            BootState::OpenSbiInit => self.opensbi_init_on_entry(ctx),
            BootState::Complete => self.complete_on_entry(ctx),
            BootState::Idle => self.idle_on_entry(ctx),
            _ => {}
        }
    }

    fn on_exit(&mut self, state: BootState, ctx: &mut StepCtx<'_, '_>) {
        match state {
            BootState::DownloadChunks => self.download_chunks_on_exit(ctx),
            BootState::OpenSbiInit => self.opensbi_init_on_exit(ctx),
            _ => {}
        }
    }

    fn run_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        match self.core.state {
            BootState::Initialization => self.init_handler(ctx),
            BootState::SetupPmp => self.setup_pmp_handler(ctx),
            BootState::SetupPmpComplete => self.setup_pmp_complete_handler(ctx),
            BootState::ZeroInitChunks => self.zero_init_chunks_handler(ctx),
            BootState::DownloadChunks => self.download_chunks_handler(ctx),
            BootState::OpenSbiInit => self.opensbi_init_handler(ctx),
            BootState::Wait => self.wait_handler(ctx),
            BootState::Complete => self.complete_handler(ctx),
            BootState::Idle => self.idle_handler(ctx),
            BootState::Error => self.error_handler(ctx),
        }
    }

    // ------------------------------------------------------------------
    // Initialization

    fn init_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        if !(ctx.plat.is_notified(Event::DdrTrained) && ctx.plat.is_notified(Event::StartupComplete))
        {
            return;
        }

        if let Some(image) = ctx.image {
            ctx.plat.set_boot_fail(false);
            self.core.start_time = ctx.plat.now();

            if image.hart(self.target).flags & FLAG_SKIP_OPENSBI != 0 {
                boot_log!(Status, "{}:: skip-opensbi flag found", self.core.name);
            }

            self.local.perf_ctr = ctx.plat.perf_ctr_allocate(self.core.name);
            self.core.state = BootState::SetupPmp;
        } else {
            boot_log!(Error, "{}::no boot image registered", self.core.name);
            self.core.state = BootState::Error;
        }
    }

    // ------------------------------------------------------------------
    // SetupPmp

    /// Build the co-boot mask for the target and (re-)register its
    /// supervisor domain.
    ///
    /// Runs twice: on entering `SetupPmp` so IPIs work for the remainder of
    /// boot, and again when leaving `DownloadChunks` once the ancillary
    /// data pointer is known.
    fn register_harts(&mut self, ctx: &mut StepCtx<'_, '_>) {
        let image = match ctx.image {
            Some(image) => image,
            None => return,
        };
        let target_entry = image.hart(self.target);
        let primary = target_entry.is_primary_boot_hart();

        self.local.msg_index = None;

        for peer in HartId::APP {
            self.local.msg_index_aux[peer.app_index()] = None;

            if !primary {
                continue;
            }
            let peer_entry = image.hart(peer);
            if peer_entry.flags & FLAG_SKIP_OPENSBI != 0 {
                // skipping the supervisor runtime: not a domain member
                ctx.plat.deregister_hart(peer);
            } else if peer == self.target || peer_entry.entry_point == target_entry.entry_point {
                self.local.hart_mask.set(peer);
                ctx.plat.register_hart(peer, self.target);
            }
        }

        if !primary || target_entry.flags & FLAG_SKIP_OPENSBI != 0 {
            return;
        }
        if let Some(entry) = target_entry.entry_point {
            boot_log!(
                Normal,
                "{}::registering domain \"{}\" (hart mask 0x{:x})",
                self.core.name,
                image.hart_name(self.target),
                self.local.hart_mask
            );

            let arg1 = self.local.ancilliary_data.or(ctx.config.fallback_dtb);
            if self.local.ancilliary_data.is_none() && ctx.config.fallback_dtb.is_some() {
                boot_log!(Warn, "{}::using built-in devicetree", self.core.name);
            }

            ctx.plat.register_boot_hart(&DomainConfig {
                name: image.hart_name(self.target),
                hart_mask: self.local.hart_mask,
                boot_hart: self.target,
                priv_mode: target_entry.priv_mode,
                entry,
                arg1,
                allow_cold_reboot: target_entry.flags & FLAG_ALLOW_COLD_REBOOT != 0,
                allow_warm_reboot: target_entry.flags & FLAG_ALLOW_WARM_REBOOT != 0,
            });
        }
    }

    fn setup_pmp_on_entry(&mut self, ctx: &mut StepCtx<'_, '_>) {
        // register harts up front so IPIs work for the remainder of boot
        self.register_harts(ctx);
    }

    fn setup_pmp_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        let enqueued = match self.local.msg_index {
            Some(_) => true,
            None => match pmp_setup_request(ctx.ipi, self.target) {
                Some(index) => {
                    self.local.msg_index = Some(index);
                    true
                }
                None => false,
            },
        };

        if enqueued {
            self.core.state = BootState::SetupPmpComplete;
        }
    }

    fn setup_pmp_complete_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        if ctx.plat.is_elapsed(self.core.start_time, SETUP_PMP_COMPLETE_TIMEOUT) {
            boot_log!(
                Error,
                "{}::timeout after {} iterations",
                self.core.name,
                self.core.execution_count
            );
            self.free_all_slots(ctx.ipi);
            self.core.state = BootState::Error;
        } else if self.check_for_ipi_acks(ctx.ipi) {
            let flags = match ctx.image {
                Some(image) => image.hart(self.target).flags,
                None => {
                    self.core.state = BootState::Error;
                    return;
                }
            };
            if flags & FLAG_SKIP_AUTOBOOT != 0 {
                self.core.state = BootState::Complete;
            } else {
                self.core.state = BootState::ZeroInitChunks;
            }
        }
    }

    // ------------------------------------------------------------------
    // ZeroInitChunks

    fn zero_init_chunks_on_entry(&mut self, _ctx: &mut StepCtx<'_, '_>) {
        self.local.zi_cursor = 0;
    }

    fn zero_init_chunks_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        let image = match ctx.image {
            Some(image) => image,
            None => {
                self.core.state = BootState::Error;
                return;
            }
        };

        match image.zi_chunk(self.local.zi_cursor) {
            Some(zi) if zi.size != 0 => {
                if zi.owner_hart() == Some(self.target) {
                    if ctx.plat.is_addr_in_ddr(zi.exec_addr)
                        && !ctx.plat.is_notified(Event::DdrTrained)
                    {
                        // DDR region before training: hold this cursor
                    } else {
                        if ctx.config.chunk_debug {
                            boot_log!(
                                Normal,
                                "{}::{}:zi chunk->0x{:x}, {} bytes",
                                self.core.name,
                                self.local.zi_cursor,
                                zi.exec_addr,
                                zi.size
                            );
                        }
                        ctx.plat.zero_mem(zi.exec_addr, zi.size);
                        self.local.zi_cursor += 1;
                    }
                } else {
                    self.local.zi_cursor += 1;
                }
            }
            _ => self.core.state = BootState::DownloadChunks,
        }
    }

    // ------------------------------------------------------------------
    // DownloadChunks

    fn download_chunks_on_entry(&mut self, ctx: &mut StepCtx<'_, '_>) {
        let image = match ctx.image {
            Some(image) => image,
            None => return,
        };
        let target_entry = image.hart(self.target);
        if target_entry.num_chunks == 0 {
            // nothing to place for this machine
            return;
        }

        boot_log!(
            Normal,
            "{}::processing boot image: \"{}\"",
            self.core.name,
            image.hart_name(self.target)
        );
        if ctx.config.chunk_debug {
            boot_log!(
                Normal,
                "{}::chunks {}..={} ({} total)",
                self.core.name,
                target_entry.first_chunk,
                target_entry.last_chunk,
                target_entry.num_chunks
            );
        }

        self.local.chunk_count = 0;
        self.local.sub_chunk_offset = 0;
        self.local.chunk_cursor = target_entry.first_chunk as usize;
    }

    /// Copy one bounded window of the current chunk.
    ///
    /// Placement is permission-checked per chunk before any byte moves: a
    /// crafted image must not be able to direct the monitor at privileged
    /// memory. The ownership and PMP checks happen in the handler; this
    /// only clamps the window to the bytes actually present.
    fn download_sub_chunk(&self, chunk: &ChunkDesc, ctx: &mut StepCtx<'_, '_>) {
        let offset = self.local.sub_chunk_offset;
        let len = SUB_CHUNK_SIZE.min(chunk.size.saturating_sub(offset));
        if len == 0 {
            return;
        }
        let image = match ctx.image {
            Some(image) => image,
            None => return,
        };
        match image.chunk_bytes(chunk, offset, len) {
            Some(src) => ctx.plat.dma_write(chunk.exec_addr + offset, src),
            None => boot_log!(
                Warn,
                "{}::chunk source at 0x{:x} outside image, not copied",
                self.core.name,
                chunk.load_addr + offset
            ),
        }
    }

    fn download_chunks_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        let image = match ctx.image {
            Some(image) => image,
            None => {
                self.core.state = BootState::Error;
                return;
            }
        };
        let target_entry = image.hart(self.target);
        if target_entry.num_chunks == 0 {
            self.core.state = BootState::Complete;
            return;
        }

        // a zero-size sentinel chunk ends the image
        let chunk = match image.chunk(self.local.chunk_cursor) {
            Some(chunk)
                if self.local.chunk_count <= target_entry.last_chunk as usize
                    && chunk.size != 0 =>
            {
                chunk
            }
            _ => {
                self.core.state = BootState::OpenSbiInit;
                return;
            }
        };

        if chunk.owner_hart() == Some(self.target)
            && ctx.plat.pmp_check_write(self.target, chunk.exec_addr, chunk.size)
        {
            if ctx.config.chunk_debug && self.local.sub_chunk_offset == 0 {
                boot_log!(
                    Normal,
                    "{}::{}:chunk@0x{:x}->0x{:x}, {} bytes",
                    self.core.name,
                    self.local.chunk_count,
                    chunk.load_addr,
                    chunk.exec_addr,
                    chunk.size
                );
            }

            self.download_sub_chunk(&chunk, ctx);

            if chunk.is_ancilliary() && self.local.ancilliary_data.is_none() {
                boot_log!(
                    Normal,
                    "{}::{}:ancillary data found at 0x{:x}",
                    self.core.name,
                    self.local.chunk_count,
                    chunk.exec_addr
                );
                self.local.ancilliary_data = Some(chunk.exec_addr);
            }

            self.local.sub_chunk_offset += SUB_CHUNK_SIZE;
            if self.local.sub_chunk_offset > chunk.size {
                self.local.sub_chunk_offset = 0;
                self.local.chunk_count += 1;
                self.local.chunk_cursor += 1;
            }
        } else {
            if chunk.owner == self.target.index() as u32 {
                boot_log!(
                    Error,
                    "{}::skipping chunk {} due to invalid permissions",
                    self.core.name,
                    self.local.chunk_cursor
                );
            } else {
                boot_log!(
                    Warn,
                    "{}::skipping chunk {} due to ownership {}",
                    self.core.name,
                    self.local.chunk_cursor,
                    chunk.owner
                );
            }
            self.local.chunk_cursor += 1;
        }
    }

    fn download_chunks_on_exit(&mut self, ctx: &mut StepCtx<'_, '_>) {
        // re-register now that the ancillary data pointer is known
        self.register_harts(ctx);
    }

    // ------------------------------------------------------------------
    // OpenSbiInit

    fn opensbi_init_on_entry(&mut self, ctx: &mut StepCtx<'_, '_>) {
        let image = match ctx.image {
            Some(image) => image,
            None => return,
        };
        if image.hart(self.target).entry_point.is_some() {
            self.local.iterator = 0;
        }
    }

    /// Allocate an auxiliary slot and deliver the release message for
    /// `dest`: `Goto` when the hart skips the supervisor runtime,
    /// `OpenSbiInit` otherwise.
    fn deliver_release(&mut self, dest: HartId, ctx: &mut StepCtx<'_, '_>) {
        let image = match ctx.image {
            Some(image) => image,
            None => {
                self.core.state = BootState::Error;
                return;
            }
        };
        let dest_entry = image.hart(dest);

        let index = match ctx.ipi.alloc() {
            Some(index) => index,
            None => {
                boot_log!(Error, "{}::{}: message allocation failed", self.core.name, dest);
                self.core.state = BootState::Error;
                return;
            }
        };
        self.local.msg_index_aux[dest.app_index()] = Some(index);

        let op = if dest_entry.flags & FLAG_SKIP_OPENSBI != 0 {
            IpiOp::Goto
        } else {
            IpiOp::OpenSbiInit
        };
        let msg = IpiMessage::release(
            op,
            dest_entry.priv_mode,
            dest_entry.entry_point,
            self.local.ancilliary_data,
        );

        if !ctx.ipi.deliver(index, dest, msg) {
            boot_log!(Error, "{}::{}: sbi_init delivery failed", self.core.name, dest);
            self.local.msg_index_aux[dest.app_index()] = None;
            ctx.ipi.free(index);
            self.core.state = BootState::Error;
        }
    }

    fn opensbi_init_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        let image = match ctx.image {
            Some(image) => image,
            None => {
                self.core.state = BootState::Error;
                return;
            }
        };
        let target_entry = image.hart(self.target);

        if !target_entry.is_primary_boot_hart() {
            // no co-boot set to release; collect nothing
            self.core.state = BootState::Wait;
            return;
        }

        if self.local.iterator < NUM_APP_HARTS {
            let peer = HartId::APP[self.local.iterator];
            if peer != self.target
                && image.hart(peer).entry_point == target_entry.entry_point
            {
                // another hart in the same boot set
                self.deliver_release(peer, ctx);
            }
            self.local.iterator += 1;
        } else {
            self.core.state = BootState::Wait;
        }
    }

    fn opensbi_init_on_exit(&mut self, ctx: &mut StepCtx<'_, '_>) {
        let has_entry = match ctx.image {
            Some(image) => image.hart(self.target).entry_point.is_some(),
            None => false,
        };
        if has_entry {
            self.deliver_release(self.target, ctx);
        } else {
            boot_log!(
                Normal,
                "{}::no entry point for {}, skipping goto/sbi_init",
                self.core.name,
                self.target
            );
        }
    }

    // ------------------------------------------------------------------
    // Wait

    fn wait_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        self.core.start_time = ctx.plat.now();

        let has_entry = match ctx.image {
            Some(image) => image.hart(self.target).entry_point.is_some(),
            None => false,
        };

        if !has_entry {
            // no release was sent, so no ack is coming
            ctx.plat.hart_state_set(self.target, HartRunState::Idle);
            self.core.state = BootState::Complete;
        } else if ctx.plat.is_elapsed(self.core.start_time, WAIT_TIMEOUT) {
            boot_log!(
                Error,
                "{}::ipi ack timeout after {} iterations",
                self.core.name,
                self.core.execution_count
            );
            self.free_all_slots(ctx.ipi);
            self.core.state = BootState::Error;
        } else if self.check_for_ipi_acks(ctx.ipi) {
            // status indicator only, no functional side effect
            ctx.plat.set_boot_status(self.target);
            self.core.state = BootState::Complete;
        }
    }

    // ------------------------------------------------------------------
    // Error / Complete / Idle

    fn error_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        boot_log!(Error, "{}::boot error, converging to idle", self.core.name);
        ctx.plat.set_boot_fail(true);
        self.core.state = BootState::Complete;
    }

    fn complete_on_entry(&mut self, ctx: &mut StepCtx<'_, '_>) {
        ctx.boot_complete[self.target.index()].store(true, Ordering::Release);
    }

    fn complete_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        let all_complete = HartId::APP
            .iter()
            .all(|hart| ctx.boot_complete[hart.index()].load(Ordering::Acquire));

        if all_complete {
            ctx.plat.notify(Event::BootComplete);
            self.core.state = BootState::Idle;
        }
    }

    fn idle_on_entry(&mut self, ctx: &mut StepCtx<'_, '_>) {
        if let Some(counter) = self.local.perf_ctr {
            ctx.plat.perf_ctr_lap(counter);
        }
    }

    fn idle_handler(&mut self, ctx: &mut StepCtx<'_, '_>) {
        // an application hart may ask to be booted again
        if ctx.ipi.consume_intent(self.target, IpiOp::BootRequest) {
            self.core.state = BootState::Initialization;
        }
    }

    // ------------------------------------------------------------------
    // Slot bookkeeping

    /// Poll every outstanding slot; each completed slot is freed as its ack
    /// arrives, not all at once.
    ///
    /// Deliberately uses non-short-circuit `&` so the primary check always
    /// runs and frees its own slot regardless of the auxiliary results.
    pub(crate) fn check_for_ipi_acks(&mut self, ipi: &mut dyn IpiTransport) -> bool {
        let mut result = true;

        for peer in HartId::APP {
            if let Some(index) = self.local.msg_index_aux[peer.app_index()] {
                result = ipi.check_if_complete(index);
                if result {
                    ipi.free(index);
                    self.local.msg_index_aux[peer.app_index()] = None;
                }
            }
        }

        if let Some(index) = self.local.msg_index {
            result = result & ipi.check_if_complete(index);
            if result {
                ipi.free(index);
                self.local.msg_index = None;
            }
        }

        result
    }

    /// Timeout cleanup: return every outstanding slot to the transport
    pub(crate) fn free_all_slots(&mut self, ipi: &mut dyn IpiTransport) {
        for peer in HartId::APP {
            if let Some(index) = self.local.msg_index_aux[peer.app_index()].take() {
                ipi.free(index);
            }
        }
        if let Some(index) = self.local.msg_index.take() {
            ipi.free(index);
        }
    }
}
