//! Boot image model and validator.
//!
//! A boot image is a packed, little-endian blob placed in shared memory by
//! an earlier boot stage: a header naming up to four application harts,
//! a table of payload chunks with load and execution addresses, and a table
//! of zero-init regions. The image is read-only for the whole service; this
//! module wraps the raw bytes in an arena with typed, bounds-checked
//! lookups so the state machines can walk the tables without address
//! arithmetic.
//!
//! Layout (offsets in bytes, header version 1):
//!
//! ```text
//! 0    magic:u32
//! 4    set_name:[u8;32]
//! 36   version:u32
//! 40   header_length:u32
//! 44   header_crc:u32
//! 48   chunk_table_offset:u32
//! 52   zi_chunk_table_offset:u32
//! 56   hart[4] of { name:[u8;32], entry_point:u64, priv_mode:u8,
//!                   first_chunk:u32, last_chunk:u32, num_chunks:u32,
//!                   flags:u32 }                       (57 bytes each)
//! 284  signature:[u8;64]                              (version >= 1 only)
//! ```

use crate::boot_log;
use crate::types::{HartId, PrivMode, NUM_APP_HARTS};

/// Plain-text image magic
pub const IMAGE_MAGIC: u32 = 0xB007_C0DE;
/// Magic of a compressed image; accepted by magic probing but decompressed
/// upstream before registration
pub const IMAGE_MAGIC_COMPRESSED: u32 = 0xC08B_8355;

/// Do not release this hart into the supervisor runtime; send a plain GOTO
pub const FLAG_SKIP_OPENSBI: u32 = 1 << 0;
/// Stop this hart's boot after PMP setup
pub const FLAG_SKIP_AUTOBOOT: u32 = 1 << 1;
/// The supervisor domain may cold-reboot
pub const FLAG_ALLOW_COLD_REBOOT: u32 = 1 << 2;
/// The supervisor domain may warm-reboot
pub const FLAG_ALLOW_WARM_REBOOT: u32 = 1 << 3;

/// High bit of a chunk owner word: the chunk carries ancillary data whose
/// execution address becomes the supervisor-init argument
pub const OWNER_ANCILLIARY: u32 = 1 << 31;

/// Length of the image set name field
pub const SET_NAME_LEN: usize = 32;
/// Length of a per-hart name field
pub const HART_NAME_LEN: usize = 32;
/// Length of the header signature field (version >= 1)
pub const SIGNATURE_LEN: usize = 64;

pub(crate) const HDR_MAGIC: usize = 0;
pub(crate) const HDR_SET_NAME: usize = 4;
pub(crate) const HDR_VERSION: usize = 36;
pub(crate) const HDR_HEADER_LENGTH: usize = 40;
pub(crate) const HDR_HEADER_CRC: usize = 44;
pub(crate) const HDR_CHUNK_TABLE: usize = 48;
pub(crate) const HDR_ZI_TABLE: usize = 52;
pub(crate) const HDR_HART_TABLE: usize = 56;

pub(crate) const HART_ENTRY_LEN: usize = HART_NAME_LEN + 8 + 1 + 4 + 4 + 4 + 4;
pub(crate) const SIGNATURE_OFFSET: usize = HDR_HART_TABLE + NUM_APP_HARTS * HART_ENTRY_LEN;

/// Header length of a version-0 image (pre code signing, no signature)
pub const HEADER_LEN_V0: usize = SIGNATURE_OFFSET;
/// Header length of a current image
pub const HEADER_LEN: usize = SIGNATURE_OFFSET + SIGNATURE_LEN;

pub(crate) const CHUNK_DESC_LEN: usize = 4 + 8 + 8 + 8;
pub(crate) const ZI_CHUNK_DESC_LEN: usize = 4 + 8 + 8;

/// Errors raised when wrapping raw bytes as a boot image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// The byte slice is shorter than the smallest valid header
    Truncated,
}

/// Per-hart boot parameters decoded from the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HartEntry {
    /// Address the hart is released to; `None` when the hart has no payload
    /// entry of its own
    pub entry_point: Option<usize>,
    /// Privilege mode the hart is released into
    pub priv_mode: PrivMode,
    /// Index of the hart's first chunk in the global chunk table
    pub first_chunk: u32,
    /// Index of the hart's last chunk in the global chunk table
    pub last_chunk: u32,
    /// Number of chunks belonging to the hart
    pub num_chunks: u32,
    /// `FLAG_*` bits
    pub flags: u32,
}

impl HartEntry {
    /// A hart that both owns chunks and has an entry point boots its
    /// supervisor domain
    pub fn is_primary_boot_hart(&self) -> bool {
        self.num_chunks != 0 && self.entry_point.is_some()
    }
}

/// A payload chunk: bytes at `load_addr` inside the image, to be copied to
/// `exec_addr` in system memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDesc {
    /// Owning hart id in the low bits, `OWNER_ANCILLIARY` in the high bit
    pub owner: u32,
    /// Source offset relative to the image base
    pub load_addr: usize,
    /// Destination address in system memory
    pub exec_addr: usize,
    /// Payload length; zero marks the table sentinel
    pub size: usize,
}

impl ChunkDesc {
    /// Owning hart with the ancillary marker masked off
    pub fn owner_hart(&self) -> Option<HartId> {
        HartId::from_index((self.owner & !OWNER_ANCILLIARY) as usize)
    }

    /// True when the chunk carries the supervisor-init argument
    pub fn is_ancilliary(&self) -> bool {
        self.owner & OWNER_ANCILLIARY != 0
    }
}

/// A zero-init region: `[exec_addr, exec_addr + size)` is cleared on behalf
/// of the owning hart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZiChunkDesc {
    /// Owning hart id
    pub owner: u32,
    /// Region base address in system memory
    pub exec_addr: usize,
    /// Region length; zero marks the table sentinel
    pub size: usize,
}

impl ZiChunkDesc {
    /// Owning hart
    pub fn owner_hart(&self) -> Option<HartId> {
        HartId::from_index(self.owner as usize)
    }
}

/// Read-only view over a boot image in shared memory
#[derive(Debug, Clone, Copy)]
pub struct BootImage<'a> {
    bytes: &'a [u8],
}

impl<'a> BootImage<'a> {
    /// Wrap raw image bytes
    ///
    /// Only the minimum header length is demanded here; content checks
    /// (magic, signature, CRC) happen at validation time so that probing a
    /// candidate image cannot fault.
    pub fn new(bytes: &'a [u8]) -> Result<BootImage<'a>, ImageError> {
        if bytes.len() < HEADER_LEN_V0 {
            return Err(ImageError::Truncated);
        }
        Ok(BootImage { bytes })
    }

    /// Total image length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// An image is never empty; present for completeness
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn u32_at(&self, offset: usize) -> u32 {
        match self.bytes.get(offset..offset + 4) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    fn u64_at(&self, offset: usize) -> u64 {
        match self.bytes.get(offset..offset + 8) {
            Some(b) => u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            None => 0,
        }
    }

    fn str_at(&self, offset: usize, len: usize) -> &'a str {
        let raw = self.bytes.get(offset..offset + len).unwrap_or(&[]);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        core::str::from_utf8(&raw[..end]).unwrap_or("")
    }

    /// Image magic word
    pub fn magic(&self) -> u32 {
        self.u32_at(HDR_MAGIC)
    }

    /// Image set name
    pub fn set_name(&self) -> &'a str {
        self.str_at(HDR_SET_NAME, SET_NAME_LEN)
    }

    /// Header format version
    pub fn version(&self) -> u32 {
        self.u32_at(HDR_VERSION)
    }

    /// Header length recorded by the image generator
    pub fn header_length(&self) -> u32 {
        self.u32_at(HDR_HEADER_LENGTH)
    }

    /// Stored header CRC
    pub fn header_crc(&self) -> u32 {
        self.u32_at(HDR_HEADER_CRC)
    }

    fn chunk_table_offset(&self) -> usize {
        self.u32_at(HDR_CHUNK_TABLE) as usize
    }

    fn zi_chunk_table_offset(&self) -> usize {
        self.u32_at(HDR_ZI_TABLE) as usize
    }

    /// Decode the boot parameters of an application hart
    pub fn hart(&self, hart: HartId) -> HartEntry {
        let base = HDR_HART_TABLE + hart.app_index() * HART_ENTRY_LEN;
        let entry = self.u64_at(base + HART_NAME_LEN) as usize;
        HartEntry {
            entry_point: if entry == 0 { None } else { Some(entry) },
            priv_mode: PrivMode::from_u8(
                self.bytes.get(base + HART_NAME_LEN + 8).copied().unwrap_or(0),
            ),
            first_chunk: self.u32_at(base + HART_NAME_LEN + 9),
            last_chunk: self.u32_at(base + HART_NAME_LEN + 13),
            num_chunks: self.u32_at(base + HART_NAME_LEN + 17),
            flags: self.u32_at(base + HART_NAME_LEN + 21),
        }
    }

    /// Name of an application hart's payload
    pub fn hart_name(&self, hart: HartId) -> &'a str {
        self.str_at(HDR_HART_TABLE + hart.app_index() * HART_ENTRY_LEN, HART_NAME_LEN)
    }

    /// Look up a chunk by table index
    ///
    /// Returns `None` past the end of the image, so a walk always
    /// terminates even on a table missing its sentinel.
    pub fn chunk(&self, index: usize) -> Option<ChunkDesc> {
        let base = self
            .chunk_table_offset()
            .checked_add(index.checked_mul(CHUNK_DESC_LEN)?)?;
        if base.checked_add(CHUNK_DESC_LEN)? > self.bytes.len() {
            return None;
        }
        Some(ChunkDesc {
            owner: self.u32_at(base),
            load_addr: self.u64_at(base + 4) as usize,
            exec_addr: self.u64_at(base + 12) as usize,
            size: self.u64_at(base + 20) as usize,
        })
    }

    /// Look up a zero-init chunk by table index
    pub fn zi_chunk(&self, index: usize) -> Option<ZiChunkDesc> {
        let base = self
            .zi_chunk_table_offset()
            .checked_add(index.checked_mul(ZI_CHUNK_DESC_LEN)?)?;
        if base.checked_add(ZI_CHUNK_DESC_LEN)? > self.bytes.len() {
            return None;
        }
        Some(ZiChunkDesc {
            owner: self.u32_at(base),
            exec_addr: self.u64_at(base + 4) as usize,
            size: self.u64_at(base + 12) as usize,
        })
    }

    /// Source bytes of a chunk window, or `None` when the window falls
    /// outside the image
    pub fn chunk_bytes(&self, chunk: &ChunkDesc, offset: usize, len: usize) -> Option<&'a [u8]> {
        let start = chunk.load_addr.checked_add(offset)?;
        self.bytes.get(start..start.checked_add(len)?)
    }

    /// True when the magic matches either the plain-text or the compressed
    /// constant
    pub fn verify_magic(&self) -> bool {
        let magic = self.magic();
        if magic == IMAGE_MAGIC || magic == IMAGE_MAGIC_COMPRESSED {
            true
        } else {
            boot_log!(
                Warn,
                "magic is {:08x} vs expected {:08x} or {:08x}",
                magic,
                IMAGE_MAGIC,
                IMAGE_MAGIC_COMPRESSED
            );
            false
        }
    }

    /// Recompute the header CRC and compare with the stored value
    ///
    /// The CRC is taken over a scratch copy of the header with the CRC word
    /// and the signature zeroed. Version-0 images predate the signature
    /// field; the shorter legacy header length keeps their stored CRCs
    /// valid.
    pub fn validate_crc(&self) -> bool {
        let crc_len = match self.version() {
            0 => HEADER_LEN_V0,
            _ => HEADER_LEN,
        };
        let head = match self.bytes.get(..crc_len) {
            Some(head) => head,
            None => return false,
        };

        let mut scratch = [0u8; HEADER_LEN];
        scratch[..crc_len].copy_from_slice(head);
        scratch[HDR_HEADER_CRC..HDR_HEADER_CRC + 4].fill(0);
        if crc_len > SIGNATURE_OFFSET {
            scratch[SIGNATURE_OFFSET..crc_len].fill(0);
        }

        let computed = crc32fast::hash(&scratch[..crc_len]);
        if computed == self.header_crc() {
            true
        } else {
            boot_log!(
                Error,
                "header crc check: calculated {:08x} vs expected {:08x}",
                computed,
                self.header_crc()
            );
            false
        }
    }
}
