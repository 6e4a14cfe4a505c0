//! Test doubles for the boot service.
//!
//! `MockPlatform` and `MockIpi` record every collaborator call so the
//! scenario tests can assert on DMA traffic, domain registrations,
//! deliveries, register writes and slot discipline. `ImageBuilder`
//! assembles syntactically valid boot images in memory, CRC included.

use core::cell::RefCell;

use heapless::{String, Vec};

use crate::image::{
    self, CHUNK_DESC_LEN, HART_ENTRY_LEN, HART_NAME_LEN, HDR_CHUNK_TABLE, HDR_HART_TABLE,
    HDR_HEADER_CRC, HDR_HEADER_LENGTH, HDR_MAGIC, HDR_SET_NAME, HDR_VERSION, HDR_ZI_TABLE,
    HEADER_LEN, HEADER_LEN_V0, IMAGE_MAGIC, ZI_CHUNK_DESC_LEN,
};
use crate::image::BootImage;
use crate::ipi::{IpiMessage, IpiOp, IpiTransport};
use crate::platform::{DomainConfig, Event, HartRunState, Platform};
use crate::types::{HartId, HartMask, PrivMode, NUM_APP_HARTS};

// ---------------------------------------------------------------------------
// MockPlatform

/// An owned copy of a domain registration
#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub name: String<32>,
    pub hart_mask: HartMask,
    pub boot_hart: HartId,
    pub priv_mode: PrivMode,
    pub entry: usize,
    pub arg1: Option<usize>,
    pub allow_cold_reboot: bool,
    pub allow_warm_reboot: bool,
}

/// Recording implementation of [`Platform`]
pub struct MockPlatform {
    /// Monotonic clock, advanced by the test driver
    pub now: u64,
    events: u32,
    /// Every `notify` call in order
    pub notifications: Vec<Event, 32>,
    /// Address ranges the PMP oracle refuses
    pub deny_ranges: Vec<(usize, usize), 8>,
    /// PMP queries in order: (hart, addr, len, verdict)
    pub pmp_checks: RefCell<Vec<(HartId, usize, usize, bool), 128>>,
    /// DMA writes in order: (dst, len)
    pub writes: Vec<(usize, usize), 128>,
    /// Zeroed regions in order: (dst, len)
    pub zeroed: Vec<(usize, usize), 32>,
    /// Last value written to the boot-fail register
    pub boot_fail: Option<bool>,
    /// Accumulated boot-status indicator bits
    pub boot_status: u32,
    /// Hart run-state transitions in order
    pub hart_states: Vec<(HartId, HartRunState), 32>,
    /// Domain membership registrations (peer, boot hart)
    pub registered: Vec<(HartId, HartId), 32>,
    /// Domain membership removals
    pub deregistered: Vec<HartId, 32>,
    /// Full domain registrations
    pub domains: Vec<DomainRecord, 16>,
    /// Harts whose PMPs were actually programmed
    pub pmp_programmed: Vec<HartId, 8>,
    /// Bus configuration count
    pub bus_configured: usize,
    next_perf_ctr: usize,
    /// Allocated performance counter names
    pub perf_allocs: Vec<&'static str, 8>,
    /// Counter laps in order
    pub perf_laps: Vec<usize, 16>,
    /// Verdict of the signature verifier
    pub signing_ok: bool,
    /// Signature verifier invocations
    pub signing_checks: usize,
    /// Entry address the monitor itself jumped to (custom flow)
    pub entered_payload: Option<usize>,
    ddr_range: (usize, usize),
}

impl MockPlatform {
    pub fn new() -> Self {
        MockPlatform {
            now: 0,
            events: 0,
            notifications: Vec::new(),
            deny_ranges: Vec::new(),
            pmp_checks: RefCell::new(Vec::new()),
            writes: Vec::new(),
            zeroed: Vec::new(),
            boot_fail: None,
            boot_status: 0,
            hart_states: Vec::new(),
            registered: Vec::new(),
            deregistered: Vec::new(),
            domains: Vec::new(),
            pmp_programmed: Vec::new(),
            bus_configured: 0,
            next_perf_ctr: 0,
            perf_allocs: Vec::new(),
            perf_laps: Vec::new(),
            signing_ok: true,
            signing_checks: 0,
            entered_payload: None,
            ddr_range: (0x8000_0000, 0x9000_0000),
        }
    }

    /// A platform with DDR training and startup already signalled
    pub fn ready() -> Self {
        let mut plat = Self::new();
        plat.notify(Event::DdrTrained);
        plat.notify(Event::StartupComplete);
        plat
    }

    pub fn deny_writes(&mut self, addr: usize, len: usize) {
        self.deny_ranges.push((addr, len)).unwrap();
    }

    pub fn notified(&self, event: Event) -> bool {
        self.events & (1 << event as u8) != 0
    }

    fn write_permitted(&self, addr: usize, len: usize) -> bool {
        !self
            .deny_ranges
            .iter()
            .any(|&(start, range_len)| addr < start + range_len && start < addr + len)
    }
}

impl Platform for MockPlatform {
    fn now(&self) -> u64 {
        self.now
    }

    fn is_notified(&self, event: Event) -> bool {
        self.notified(event)
    }

    fn notify(&mut self, event: Event) {
        self.events |= 1 << event as u8;
        let _ = self.notifications.push(event);
    }

    fn pmp_check_write(&self, hart: HartId, addr: usize, len: usize) -> bool {
        let verdict = self.write_permitted(addr, len);
        let _ = self.pmp_checks.borrow_mut().push((hart, addr, len, verdict));
        verdict
    }

    fn dma_write(&mut self, dst: usize, src: &[u8]) {
        // every DMA write must be covered by an earlier passing PMP check
        let gated = self
            .pmp_checks
            .borrow()
            .iter()
            .any(|&(_, addr, len, ok)| ok && dst >= addr && dst + src.len() <= addr + len);
        assert!(gated, "DMA write to {dst:#x} ({} bytes) without a passing PMP check", src.len());
        self.writes.push((dst, src.len())).unwrap();
    }

    fn zero_mem(&mut self, dst: usize, len: usize) {
        self.zeroed.push((dst, len)).unwrap();
    }

    fn is_addr_in_ddr(&self, addr: usize) -> bool {
        addr >= self.ddr_range.0 && addr < self.ddr_range.1
    }

    fn set_boot_fail(&mut self, failed: bool) {
        self.boot_fail = Some(failed);
    }

    fn set_boot_status(&mut self, hart: HartId) {
        self.boot_status |= 1 << (hart.index() - 1);
    }

    fn hart_state_set(&mut self, hart: HartId, state: HartRunState) {
        let _ = self.hart_states.push((hart, state));
    }

    fn register_hart(&mut self, peer: HartId, boot_hart: HartId) {
        let _ = self.registered.push((peer, boot_hart));
    }

    fn deregister_hart(&mut self, peer: HartId) {
        let _ = self.deregistered.push(peer);
    }

    fn register_boot_hart(&mut self, domain: &DomainConfig<'_>) {
        let mut name = String::new();
        let _ = name.push_str(domain.name);
        let _ = self.domains.push(DomainRecord {
            name,
            hart_mask: domain.hart_mask,
            boot_hart: domain.boot_hart,
            priv_mode: domain.priv_mode,
            entry: domain.entry,
            arg1: domain.arg1,
            allow_cold_reboot: domain.allow_cold_reboot,
            allow_warm_reboot: domain.allow_warm_reboot,
        });
    }

    fn program_pmp(&mut self, hart: HartId) {
        self.pmp_programmed.push(hart).unwrap();
    }

    fn configure_bus(&mut self) {
        self.bus_configured += 1;
    }

    fn perf_ctr_allocate(&mut self, name: &'static str) -> Option<usize> {
        let counter = self.next_perf_ctr;
        self.next_perf_ctr += 1;
        let _ = self.perf_allocs.push(name);
        Some(counter)
    }

    fn perf_ctr_lap(&mut self, counter: usize) {
        let _ = self.perf_laps.push(counter);
    }

    fn check_code_signing(&mut self, _image: &BootImage<'_>) -> bool {
        self.signing_checks += 1;
        self.signing_ok
    }

    fn enter_payload(&mut self, entry: usize) {
        self.entered_payload = Some(entry);
    }
}

// ---------------------------------------------------------------------------
// MockIpi

const MAX_OUTSTANDING: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    busy: bool,
    acked: bool,
}

/// Recording implementation of [`IpiTransport`]
pub struct MockIpi {
    slots: [Slot; MAX_OUTSTANDING],
    /// Report every slot as acknowledged immediately
    pub auto_ack: bool,
    /// Refuse all deliveries
    pub fail_deliver: bool,
    /// Tracked deliveries in order: (slot, target, message)
    pub deliveries: Vec<(u32, HartId, IpiMessage), 64>,
    /// Fire-and-forget sends in order
    pub sent: Vec<(HartId, IpiMessage), 16>,
    pending_intents: Vec<(HartId, IpiOp), 8>,
    /// Currently allocated slots
    pub live: usize,
    /// High-water mark of allocated slots
    pub max_live: usize,
    /// Total frees
    pub frees: usize,
}

impl MockIpi {
    pub fn new() -> Self {
        MockIpi {
            slots: [Slot::default(); MAX_OUTSTANDING],
            auto_ack: true,
            fail_deliver: false,
            deliveries: Vec::new(),
            sent: Vec::new(),
            pending_intents: Vec::new(),
            live: 0,
            max_live: 0,
            frees: 0,
        }
    }

    /// Acknowledge one tracked slot
    pub fn ack(&mut self, index: u32) {
        self.slots[index as usize].acked = true;
    }

    /// Queue an incoming request for the monitor
    pub fn push_intent(&mut self, source: HartId, op: IpiOp) {
        self.pending_intents.push((source, op)).unwrap();
    }

    /// Deliveries to `target`, excluding PMP setup traffic
    pub fn releases_to(&self, target: HartId) -> Vec<IpiMessage, 16> {
        let mut out = Vec::new();
        for &(_, to, msg) in self.deliveries.iter() {
            if to == target && msg.op != IpiOp::PmpSetup {
                let _ = out.push(msg);
            }
        }
        out
    }
}

impl IpiTransport for MockIpi {
    fn max_outstanding(&self) -> usize {
        MAX_OUTSTANDING
    }

    fn alloc(&mut self) -> Option<u32> {
        let index = self.slots.iter().position(|slot| !slot.busy)?;
        self.slots[index] = Slot { busy: true, acked: false };
        self.live += 1;
        self.max_live = self.max_live.max(self.live);
        Some(index as u32)
    }

    fn deliver(&mut self, index: u32, target: HartId, msg: IpiMessage) -> bool {
        if self.fail_deliver {
            return false;
        }
        self.deliveries.push((index, target, msg)).unwrap();
        true
    }

    fn check_if_complete(&mut self, index: u32) -> bool {
        self.auto_ack || self.slots[index as usize].acked
    }

    fn free(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        assert!(slot.busy, "double free of IPI slot {index}");
        slot.busy = false;
        slot.acked = false;
        self.live -= 1;
        self.frees += 1;
    }

    fn send(&mut self, target: HartId, msg: IpiMessage) -> bool {
        self.sent.push((target, msg)).unwrap();
        true
    }

    fn consume_intent(&mut self, source: HartId, op: IpiOp) -> bool {
        if let Some(position) = self
            .pending_intents
            .iter()
            .position(|&(from, kind)| from == source && kind == op)
        {
            self.pending_intents.remove(position);
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// ImageBuilder

#[derive(Debug, Clone, Copy)]
struct HartCfg {
    entry: Option<usize>,
    flags: u32,
}

#[derive(Debug, Clone, Copy)]
struct ChunkCfg {
    owner: u32,
    exec_addr: usize,
    size: usize,
    fill: u8,
}

/// Assembles a syntactically valid boot image for tests
pub struct ImageBuilder {
    version: u32,
    harts: [HartCfg; NUM_APP_HARTS],
    chunks: Vec<ChunkCfg, 16>,
    zi_chunks: Vec<(u32, usize, usize), 8>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder {
            version: 1,
            harts: [HartCfg { entry: None, flags: 0 }; NUM_APP_HARTS],
            chunks: Vec::new(),
            zi_chunks: Vec::new(),
        }
    }

    /// Use the legacy (pre-signature) header format
    pub fn version(&mut self, version: u32) -> &mut Self {
        self.version = version;
        self
    }

    /// Configure a hart's entry point and flags
    pub fn hart(&mut self, hart: HartId, entry: Option<usize>, flags: u32) -> &mut Self {
        self.harts[hart.app_index()] = HartCfg { entry, flags };
        self
    }

    /// Append a payload chunk; `owner` is the raw owner word, so tests can
    /// set the ancillary marker
    pub fn chunk(&mut self, owner: u32, exec_addr: usize, size: usize, fill: u8) -> &mut Self {
        self.chunks.push(ChunkCfg { owner, exec_addr, size, fill }).unwrap();
        self
    }

    /// Append a zero-init region
    pub fn zi(&mut self, owner: u32, exec_addr: usize, size: usize) -> &mut Self {
        self.zi_chunks.push((owner, exec_addr, size)).unwrap();
        self
    }

    /// Serialise the image, computing the header CRC over the scratch
    /// layout the validator recomputes
    pub fn build(&self) -> Vec<u8, 8192> {
        let header_len = match self.version {
            0 => HEADER_LEN_V0,
            _ => HEADER_LEN,
        };
        let chunk_table_offset = header_len;
        let zi_table_offset = chunk_table_offset + (self.chunks.len() + 1) * CHUNK_DESC_LEN;
        let mut payload_offset = zi_table_offset + (self.zi_chunks.len() + 1) * ZI_CHUNK_DESC_LEN;

        let mut bytes: Vec<u8, 8192> = Vec::new();
        bytes.resize_default(header_len).unwrap();

        put_u32(&mut bytes, HDR_MAGIC, IMAGE_MAGIC);
        put_str(&mut bytes, HDR_SET_NAME, "test-image");
        put_u32(&mut bytes, HDR_VERSION, self.version);
        put_u32(&mut bytes, HDR_HEADER_LENGTH, header_len as u32);
        put_u32(&mut bytes, HDR_CHUNK_TABLE, chunk_table_offset as u32);
        put_u32(&mut bytes, HDR_ZI_TABLE, zi_table_offset as u32);

        for hart in HartId::APP {
            let cfg = self.harts[hart.app_index()];
            let base = HDR_HART_TABLE + hart.app_index() * HART_ENTRY_LEN;

            let mut name: String<16> = String::new();
            let _ = core::fmt::write(&mut name, format_args!("payload{}", hart.index()));
            put_str(&mut bytes, base, &name);
            put_u64(&mut bytes, base + HART_NAME_LEN, cfg.entry.unwrap_or(0) as u64);
            bytes[base + HART_NAME_LEN + 8] = PrivMode::Supervisor as u8;

            let owned: Vec<usize, 16> = self
                .chunks
                .iter()
                .enumerate()
                .filter(|(_, c)| c.owner & !image::OWNER_ANCILLIARY == hart.index() as u32)
                .map(|(index, _)| index)
                .collect();
            let first = owned.first().copied().unwrap_or(0);
            let last = owned.last().copied().unwrap_or(0);
            put_u32(&mut bytes, base + HART_NAME_LEN + 9, first as u32);
            put_u32(&mut bytes, base + HART_NAME_LEN + 13, last as u32);
            put_u32(&mut bytes, base + HART_NAME_LEN + 17, owned.len() as u32);
            put_u32(&mut bytes, base + HART_NAME_LEN + 21, cfg.flags);
        }

        // the signature (when present) stays zero, matching the scratch
        // layout the validator hashes
        let crc = crc32fast::hash(&bytes[..header_len]);
        put_u32(&mut bytes, HDR_HEADER_CRC, crc);

        // chunk table with sentinel
        for chunk in self.chunks.iter() {
            let base = bytes.len();
            bytes.resize_default(base + CHUNK_DESC_LEN).unwrap();
            put_u32(&mut bytes, base, chunk.owner);
            put_u64(&mut bytes, base + 4, payload_offset as u64);
            put_u64(&mut bytes, base + 12, chunk.exec_addr as u64);
            put_u64(&mut bytes, base + 20, chunk.size as u64);
            payload_offset += chunk.size;
        }
        let base = bytes.len();
        bytes.resize_default(base + CHUNK_DESC_LEN).unwrap();

        // zero-init table with sentinel
        for &(owner, exec_addr, size) in self.zi_chunks.iter() {
            let base = bytes.len();
            bytes.resize_default(base + ZI_CHUNK_DESC_LEN).unwrap();
            put_u32(&mut bytes, base, owner);
            put_u64(&mut bytes, base + 4, exec_addr as u64);
            put_u64(&mut bytes, base + 12, size as u64);
        }
        let base = bytes.len();
        bytes.resize_default(base + ZI_CHUNK_DESC_LEN).unwrap();

        // chunk payloads
        for chunk in self.chunks.iter() {
            for _ in 0..chunk.size {
                bytes.push(chunk.fill).unwrap();
            }
        }

        bytes
    }
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_str(bytes: &mut [u8], offset: usize, value: &str) {
    bytes[offset..offset + value.len()].copy_from_slice(value.as_bytes());
}
