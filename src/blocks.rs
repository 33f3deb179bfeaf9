//! Two-layer block subsystem.
//!
//! Presents a contiguous logical block space (LBN 0..N) over a RAM window
//! and a disk image. The low LBNs map to RAM physical blocks after a
//! reserved system range; everything above maps to disk physical blocks,
//! three 1 KiB payloads packed per 4 KiB device block together with 1 KiB
//! of per-block metadata. Allocation state lives in an external bitmap
//! (BAM) mirrored in memory; the mirror is authoritative until flushed.
//!
//! On-device layout (v2): devblock 0 is the volume header, devblocks
//! `1..1+B` hold the BAM, the rest is payload.

use std::fmt;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::blkio::{self, BlockDevice, UNIT_SIZE};
use crate::host::HostServices;

/// Forth block size in bytes.
pub const FORTH_BLOCK_SIZE: usize = 1024;
/// Number of RAM physical blocks.
pub const RAM_BLOCKS: u32 = 1024;
/// First disk physical block number.
pub const DISK_START: u32 = 1024;
/// Device block (devblock) size in bytes.
pub const DEVBLOCK_SIZE: usize = 4096;
/// 1 KiB payloads per devblock.
pub const PACK_RATIO: u32 = 3;
/// Encoded size of one per-block metadata slice.
pub const META_PER_BLOCK: usize = 341;
/// Offset of the metadata region inside a devblock.
const META_REGION_OFFSET: usize = PACK_RATIO as usize * FORTH_BLOCK_SIZE;
/// RAM physical blocks hidden from user code.
pub const RAM_SYS_RESERVED: u32 = 32;
/// Disk physical blocks hidden from user code.
pub const DISK_SYS_RESERVED: u32 = 32;
/// Write-back cache slots.
const CACHE_SLOTS: usize = 8;
/// Tracked blocks per 4 KiB BAM page (one bit each).
const BITS_PER_BAM_PAGE: u64 = 32_768;

/// Volume header magic, "STFR".
pub const VOLUME_MAGIC: u32 = 0x5354_4652;
/// Volume format version.
pub const VOLUME_VERSION: u32 = 2;
/// Per-block metadata magic, "BLK_STRK".
pub const META_MAGIC: u64 = 0x424C_4B5F_5354_524B;

// The LBN->PBN math below assumes the disk physical range starts exactly
// where the RAM range ends.
const _: () = assert!(DISK_START == RAM_BLOCKS);

/// CRC64-ISO, init and output-xor `0xFFFF_FFFF_FFFF_FFFF`.
pub fn crc64(data: &[u8]) -> u64 {
    const fn build_table() -> [u64; 256] {
        const POLY: u64 = 0x42F0_E1EB_A9EA_3693;
        let mut table = [0u64; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u64;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    }
    const TABLE: [u64; 256] = build_table();

    let mut crc = u64::MAX;
    for &byte in data {
        crc = TABLE[((crc ^ u64::from(byte)) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc ^ u64::MAX
}

/// Block-subsystem errors.
#[derive(Debug)]
pub enum Error {
    /// LBN outside the user-visible logical space.
    OutOfRange(u32),
    /// Operation needs an attached device and none is present.
    NoDevice,
    /// RAM blocks carry no persistent allocation or metadata state.
    RamBlock(u32),
    /// Every tracked disk block is allocated.
    Exhausted,
    /// Device I/O failed.
    Io(blkio::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange(lbn) => write!(f, "block {lbn} out of range"),
            Self::NoDevice => f.write_str("no block device attached"),
            Self::RamBlock(lbn) => write!(f, "block {lbn} is RAM-backed"),
            Self::Exhausted => f.write_str("no free blocks"),
            Self::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<blkio::Error> for Error {
    fn from(err: blkio::Error) -> Self {
        Self::Io(err)
    }
}

// Sequential little-endian field codecs for the on-device records.

struct Enc<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Enc<'_> {
    fn u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn u64(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
    }
}

struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        v
    }

    fn bytes(&mut self, len: usize) -> &'a [u8] {
        let v = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        v
    }
}

/// Volume header stored in devblock 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    pub magic: u32,
    pub version: u32,
    pub total_volumes: u32,
    pub flags: u32,
    pub label: [u8; 64],
    /// Count of 4 KiB devblocks on the device.
    pub total_devblocks: u64,
    /// First BAM devblock, normally 1.
    pub bam_start: u32,
    /// 4 KiB pages occupied by the BAM.
    pub bam_devblocks: u32,
    /// First payload devblock, `bam_start + bam_devblocks`.
    pub devblock_base: u32,
    /// Blocks the BAM can track, `32768 * bam_devblocks`.
    pub tracked_blocks: u64,
    /// Usable disk blocks, `min(tracked, 3 * payload_devblocks)`.
    pub total_blocks: u64,
    pub free_blocks: u64,
    /// Allocation scan hint (disk PBN).
    pub first_free: u64,
    pub last_allocated: u64,
    pub reserved_disk_lo: u32,
    pub reserved_ram_lo: u32,
    pub created_time: u64,
    pub mounted_time: u64,
    pub hdr_crc: u64,
}

impl Default for VolumeHeader {
    fn default() -> Self {
        let mut label = [0u8; 64];
        let text = b"StarForth Volume";
        label[..text.len()].copy_from_slice(text);
        Self {
            magic: VOLUME_MAGIC,
            version: VOLUME_VERSION,
            total_volumes: 1,
            flags: 0,
            label,
            total_devblocks: 0,
            bam_start: 0,
            bam_devblocks: 0,
            devblock_base: 0,
            tracked_blocks: 0,
            total_blocks: 0,
            free_blocks: 0,
            first_free: 0,
            last_allocated: 0,
            reserved_disk_lo: DISK_SYS_RESERVED,
            reserved_ram_lo: RAM_SYS_RESERVED,
            created_time: 0,
            mounted_time: 0,
            hdr_crc: 0,
        }
    }
}

impl VolumeHeader {
    pub fn label_str(&self) -> &str {
        let end = self.label.iter().position(|&b| b == 0).unwrap_or(64);
        std::str::from_utf8(&self.label[..end]).unwrap_or("")
    }

    pub(crate) fn encode(&self, buf: &mut [u8; DEVBLOCK_SIZE]) {
        buf.fill(0);
        let mut w = Enc { buf, pos: 0 };
        w.u32(self.magic);
        w.u32(self.version);
        w.u32(self.total_volumes);
        w.u32(self.flags);
        w.bytes(&self.label);
        w.u64(self.total_devblocks);
        w.u32(self.bam_start);
        w.u32(self.bam_devblocks);
        w.u32(self.devblock_base);
        w.u64(self.tracked_blocks);
        w.u64(self.total_blocks);
        w.u64(self.free_blocks);
        w.u64(self.first_free);
        w.u64(self.last_allocated);
        w.u32(self.reserved_disk_lo);
        w.u32(self.reserved_ram_lo);
        w.u64(self.created_time);
        w.u64(self.mounted_time);
        w.u64(self.hdr_crc);
    }

    pub(crate) fn decode(buf: &[u8; DEVBLOCK_SIZE]) -> Self {
        let mut r = Dec { buf, pos: 0 };
        let magic = r.u32();
        let version = r.u32();
        let total_volumes = r.u32();
        let flags = r.u32();
        let label = r.bytes(64).try_into().unwrap();
        Self {
            magic,
            version,
            total_volumes,
            flags,
            label,
            total_devblocks: r.u64(),
            bam_start: r.u32(),
            bam_devblocks: r.u32(),
            devblock_base: r.u32(),
            tracked_blocks: r.u64(),
            total_blocks: r.u64(),
            free_blocks: r.u64(),
            first_free: r.u64(),
            last_allocated: r.u64(),
            reserved_disk_lo: r.u32(),
            reserved_ram_lo: r.u32(),
            created_time: r.u64(),
            mounted_time: r.u64(),
            hdr_crc: r.u64(),
        }
    }
}

bitflags! {
    /// Per-block status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u64 {
        const USED = 1 << 0;
        const WRITE_PROTECTED = 1 << 1;
        const CHAINED = 1 << 2;
    }
}

/// Payload classification recorded in block metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum ContentType {
    Empty = 0,
    Source = 1,
    Data = 2,
}

/// Text encoding recorded in block metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum ContentEncoding {
    Ascii = 0,
    Utf8 = 1,
    Binary = 2,
}

/// Per-block metadata, one 341-byte slice per packed payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMeta {
    /// CRC64 of the 1 KiB payload, refreshed on `update`.
    pub checksum: u64,
    pub magic: u64,
    pub created_time: u64,
    pub modified_time: u64,
    pub flags: BlockFlags,
    pub write_count: u64,
    pub content_type: u64,
    pub encoding: u64,
    pub content_length: u64,
    pub entropy: [u64; 4],
    pub hash: [u64; 4],
    pub owner_id: u64,
    pub permissions: u64,
    pub acl_block: u64,
    pub signature: [u64; 2],
    pub prev_block: u64,
    pub next_block: u64,
    pub parent_block: u64,
    pub chain_length: u64,
    pub app_data: [u64; 15],
}

impl BlockMeta {
    pub fn content_type(&self) -> Option<ContentType> {
        ContentType::try_from(self.content_type).ok()
    }

    pub fn content_encoding(&self) -> Option<ContentEncoding> {
        ContentEncoding::try_from(self.encoding).ok()
    }

    pub(crate) fn encode(&self, slice: &mut [u8]) {
        debug_assert_eq!(slice.len(), META_PER_BLOCK);
        slice.fill(0);
        let mut w = Enc {
            buf: slice,
            pos: 0,
        };
        w.u64(self.checksum);
        w.u64(self.magic);
        w.u64(self.created_time);
        w.u64(self.modified_time);
        w.u64(self.flags.bits());
        w.u64(self.write_count);
        w.u64(self.content_type);
        w.u64(self.encoding);
        w.u64(self.content_length);
        for v in self.entropy {
            w.u64(v);
        }
        for v in self.hash {
            w.u64(v);
        }
        w.u64(self.owner_id);
        w.u64(self.permissions);
        w.u64(self.acl_block);
        for v in self.signature {
            w.u64(v);
        }
        w.u64(self.prev_block);
        w.u64(self.next_block);
        w.u64(self.parent_block);
        w.u64(self.chain_length);
        for v in self.app_data {
            w.u64(v);
        }
    }

    pub(crate) fn decode(slice: &[u8]) -> Self {
        debug_assert_eq!(slice.len(), META_PER_BLOCK);
        let mut r = Dec {
            buf: slice,
            pos: 0,
        };
        let mut meta = Self {
            checksum: r.u64(),
            magic: r.u64(),
            created_time: r.u64(),
            modified_time: r.u64(),
            flags: BlockFlags::from_bits_truncate(r.u64()),
            write_count: r.u64(),
            content_type: r.u64(),
            encoding: r.u64(),
            content_length: r.u64(),
            ..Self::default()
        };
        for v in &mut meta.entropy {
            *v = r.u64();
        }
        for v in &mut meta.hash {
            *v = r.u64();
        }
        meta.owner_id = r.u64();
        meta.permissions = r.u64();
        meta.acl_block = r.u64();
        for v in &mut meta.signature {
            *v = r.u64();
        }
        meta.prev_block = r.u64();
        meta.next_block = r.u64();
        meta.parent_block = r.u64();
        meta.chain_length = r.u64();
        for v in &mut meta.app_data {
            *v = r.u64();
        }
        meta
    }
}

struct CacheSlot {
    devblock: u32,
    data: Box<[u8; DEVBLOCK_SIZE]>,
    meta: [BlockMeta; PACK_RATIO as usize],
    valid: bool,
    loaded: bool,
    dirty: bool,
    meta_dirty: bool,
}

impl CacheSlot {
    fn empty() -> Self {
        Self {
            devblock: 0,
            data: Box::new([0u8; DEVBLOCK_SIZE]),
            meta: Default::default(),
            valid: false,
            loaded: false,
            dirty: false,
            meta_dirty: false,
        }
    }

    fn reset_for(&mut self, devblock: u32) {
        self.devblock = devblock;
        self.data.fill(0);
        self.meta = Default::default();
        self.valid = true;
        self.loaded = false;
        self.dirty = false;
        self.meta_dirty = false;
    }
}

// External BAM bit helpers.
fn bam_test(bam: &[u8], idx: u64) -> bool {
    (bam[(idx >> 3) as usize] >> (idx & 7)) & 1 != 0
}

fn bam_set(bam: &mut [u8], idx: u64) {
    bam[(idx >> 3) as usize] |= 1 << (idx & 7);
}

fn bam_clear(bam: &mut [u8], idx: u64) {
    bam[(idx >> 3) as usize] &= !(1 << (idx & 7));
}

/// The block engine: logical block space, BAM, write-back devblock cache.
///
/// Single-writer by construction; all mutation goes through `&mut self`.
pub struct BlockEngine {
    ram: Vec<u8>,
    dirty_ram: Vec<bool>,
    dev: Option<Box<dyn BlockDevice>>,
    /// Device capacity in 1 KiB units.
    total_units: u32,
    vol: VolumeHeader,
    vol_dirty: bool,
    bam: Vec<u8>,
    bam_dirty: bool,
    cache: Vec<CacheSlot>,
    /// User-visible RAM blocks, `RAM_BLOCKS - RAM_SYS_RESERVED`.
    ram_user: u32,
    /// User-visible logical blocks.
    total_user_lbn: u64,
}

impl BlockEngine {
    #[must_use]
    pub fn new() -> Self {
        let ram_user = RAM_BLOCKS - RAM_SYS_RESERVED;
        Self {
            ram: vec![0u8; RAM_BLOCKS as usize * FORTH_BLOCK_SIZE],
            dirty_ram: vec![false; RAM_BLOCKS as usize],
            dev: None,
            total_units: 0,
            vol: VolumeHeader::default(),
            vol_dirty: false,
            bam: Vec::new(),
            bam_dirty: false,
            cache: (0..CACHE_SLOTS).map(|_| CacheSlot::empty()).collect(),
            ram_user,
            total_user_lbn: u64::from(ram_user),
        }
    }

    /// User-visible logical block count.
    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.total_user_lbn.min(u64::from(u32::MAX)) as u32
    }

    #[must_use]
    pub fn is_valid(&self, lbn: u32) -> bool {
        u64::from(lbn) < self.total_user_lbn
    }

    #[must_use]
    pub fn volume_meta(&self) -> &VolumeHeader {
        &self.vol
    }

    pub fn set_volume_meta(&mut self, vol: VolumeHeader) {
        self.vol = vol;
        self.vol_dirty = true;
    }

    /// Attach a device: load the v2 volume if present, otherwise format it.
    pub fn attach_device(
        &mut self,
        dev: Box<dyn BlockDevice>,
        host: &dyn HostServices,
    ) -> Result<(), Error> {
        self.total_units = dev.total_units();
        self.dev = Some(dev);
        self.format_or_load(host)?;
        self.vol.mounted_time = host.monotonic_ns();
        self.vol_dirty = true;

        log::info!(
            "blk: volume '{}' v2: devblocks={} bam_devblocks={} base={} tracked={} total={} free={}",
            self.vol.label_str(),
            self.vol.total_devblocks,
            self.vol.bam_devblocks,
            self.vol.devblock_base,
            self.vol.tracked_blocks,
            self.vol.total_blocks,
            self.vol.free_blocks
        );
        Ok(())
    }

    /// Flush everything and hand the device back.
    pub fn detach(&mut self) -> Result<Option<Box<dyn BlockDevice>>, Error> {
        self.flush(0)?;
        if self.vol_dirty && self.dev.is_some() {
            let mut buf = [0u8; DEVBLOCK_SIZE];
            self.vol.encode(&mut buf);
            self.write_header(&buf)?;
            self.device()?.flush()?;
            self.vol_dirty = false;
        }
        let dev = self.dev.take();
        self.bam.clear();
        self.bam_dirty = false;
        for slot in &mut self.cache {
            slot.valid = false;
        }
        self.total_user_lbn = u64::from(self.ram_user);
        Ok(dev)
    }

    /// Borrow the 1 KiB buffer for `lbn`. The pointer stays valid until the
    /// next engine call; `writable` marks the owning dirty bit.
    pub fn get_buffer(&mut self, lbn: u32, writable: bool) -> Result<&mut [u8], Error> {
        if !self.is_valid(lbn) {
            return Err(Error::OutOfRange(lbn));
        }

        if lbn < self.ram_user {
            let pbn = (lbn + RAM_SYS_RESERVED) as usize;
            if writable {
                self.dirty_ram[pbn] = true;
            }
            let start = pbn * FORTH_BLOCK_SIZE;
            return Ok(&mut self.ram[start..start + FORTH_BLOCK_SIZE]);
        }

        if self.dev.is_none() {
            return Err(Error::NoDevice);
        }
        let pbn = self.lbn_to_disk_pbn(lbn);
        let (dev4k, pack) = Self::devblock_of(pbn);
        let slot = self.load_devblock(dev4k)?;
        if writable {
            slot.dirty = true;
        }
        let start = pack as usize * FORTH_BLOCK_SIZE;
        Ok(&mut slot.data[start..start + FORTH_BLOCK_SIZE])
    }

    /// As [`get_buffer`](Self::get_buffer) with `writable`, pre-zeroed.
    pub fn get_empty_buffer(&mut self, lbn: u32) -> Result<&mut [u8], Error> {
        let buf = self.get_buffer(lbn, true)?;
        buf.fill(0);
        Ok(buf)
    }

    /// Mark `lbn` dirty. For disk blocks this refreshes the payload CRC64
    /// and timestamps and marks the BAM bit allocated.
    pub fn update(&mut self, lbn: u32, host: &dyn HostServices) -> Result<(), Error> {
        if !self.is_valid(lbn) {
            return Err(Error::OutOfRange(lbn));
        }

        if lbn < self.ram_user {
            self.dirty_ram[(lbn + RAM_SYS_RESERVED) as usize] = true;
            return Ok(());
        }

        if self.dev.is_none() {
            return Err(Error::NoDevice);
        }
        let pbn = self.lbn_to_disk_pbn(lbn);
        let (dev4k, pack) = Self::devblock_of(pbn);
        let now = host.monotonic_ns();
        let slot = self.load_devblock(dev4k)?;

        let start = pack as usize * FORTH_BLOCK_SIZE;
        let crc = crc64(&slot.data[start..start + FORTH_BLOCK_SIZE]);
        let meta = &mut slot.meta[pack as usize];
        meta.checksum = crc;
        if meta.magic == 0 {
            meta.magic = META_MAGIC;
            meta.created_time = now;
        }
        meta.modified_time = now;
        meta.write_count += 1;
        slot.meta_dirty = true;
        slot.dirty = true;

        // BAM is indexed by disk-physical offset; the bit may already be
        // set, in which case free_blocks must not drop twice.
        let off = u64::from(pbn - DISK_START);
        if off < self.vol.total_blocks && !bam_test(&self.bam, off) {
            bam_set(&mut self.bam, off);
            self.bam_dirty = true;
            self.vol.free_blocks = self.vol.free_blocks.saturating_sub(1);
            self.vol_dirty = true;
        }
        Ok(())
    }

    /// Flush one LBN's devblock, or everything when `lbn == 0`: all dirty
    /// cache slots, the BAM and the header.
    pub fn flush(&mut self, lbn: u32) -> Result<(), Error> {
        if lbn > 0 {
            if !self.is_valid(lbn) {
                return Err(Error::OutOfRange(lbn));
            }
            if lbn < self.ram_user {
                self.dirty_ram[(lbn + RAM_SYS_RESERVED) as usize] = false;
                return Ok(());
            }
            if self.dev.is_none() {
                return Err(Error::NoDevice);
            }
            let pbn = self.lbn_to_disk_pbn(lbn);
            let (dev4k, _) = Self::devblock_of(pbn);
            for i in 0..self.cache.len() {
                let slot = &self.cache[i];
                if slot.valid && slot.devblock == dev4k && (slot.dirty || slot.meta_dirty) {
                    self.writeback_slot(i)?;
                    self.device()?.flush()?;
                    self.flush_bam()?;
                    return Ok(());
                }
            }
            return Ok(());
        }

        if self.dev.is_some() {
            for i in 0..self.cache.len() {
                let slot = &self.cache[i];
                if slot.valid && (slot.dirty || slot.meta_dirty) {
                    self.writeback_slot(i)?;
                }
            }
            if self.vol_dirty {
                let mut buf = [0u8; DEVBLOCK_SIZE];
                self.vol.encode(&mut buf);
                self.write_header(&buf)?;
                self.vol_dirty = false;
            }
            self.flush_bam()?;
            self.device()?.flush()?;
        }
        self.dirty_ram.fill(false);
        Ok(())
    }

    /// Allocate the first free disk block, scanning the BAM from the
    /// `first_free` hint. Returns its LBN.
    pub fn allocate(&mut self) -> Result<u32, Error> {
        if self.dev.is_none() {
            return Err(Error::NoDevice);
        }
        if self.vol.free_blocks == 0 {
            return Err(Error::Exhausted);
        }

        let limit = self.vol.total_blocks;
        let start = self
            .vol
            .first_free
            .saturating_sub(u64::from(DISK_START))
            .min(limit.saturating_sub(1));
        for i in 0..limit {
            let off = (start + i) % limit;
            if !bam_test(&self.bam, off) {
                bam_set(&mut self.bam, off);
                self.bam_dirty = true;
                self.vol.free_blocks -= 1;
                let pbn = DISK_START + off as u32;
                self.vol.last_allocated = u64::from(pbn);
                self.vol.first_free = u64::from(pbn) + 1;
                self.vol_dirty = true;

                if pbn < DISK_START + DISK_SYS_RESERVED {
                    // Reserved bits are pre-marked at format; a clear bit
                    // here means the BAM was corrupted externally.
                    return Err(Error::Exhausted);
                }
                return Ok(self.ram_user + (pbn - DISK_START - DISK_SYS_RESERVED));
            }
        }
        Err(Error::Exhausted)
    }

    /// Whether the BAM bit for a disk LBN is set.
    pub fn is_allocated(&self, lbn: u32) -> Result<bool, Error> {
        let off = self.disk_bam_offset(lbn)?;
        Ok(bam_test(&self.bam, off))
    }

    pub fn mark_allocated(&mut self, lbn: u32) -> Result<(), Error> {
        let off = self.disk_bam_offset(lbn)?;
        if !bam_test(&self.bam, off) {
            bam_set(&mut self.bam, off);
            self.bam_dirty = true;
            self.vol.free_blocks = self.vol.free_blocks.saturating_sub(1);
            self.vol_dirty = true;
        }
        Ok(())
    }

    pub fn mark_free(&mut self, lbn: u32) -> Result<(), Error> {
        let off = self.disk_bam_offset(lbn)?;
        if bam_test(&self.bam, off) {
            bam_clear(&mut self.bam, off);
            self.bam_dirty = true;
            self.vol.free_blocks += 1;
            let pbn = u64::from(DISK_START) + off;
            if pbn < self.vol.first_free {
                self.vol.first_free = pbn;
            }
            self.vol_dirty = true;
        }
        Ok(())
    }

    /// Persistent metadata for a disk block. RAM blocks report an empty
    /// record with the correct magic.
    pub fn block_meta(&mut self, lbn: u32) -> Result<BlockMeta, Error> {
        if !self.is_valid(lbn) {
            return Err(Error::OutOfRange(lbn));
        }
        if lbn < self.ram_user {
            return Ok(BlockMeta {
                magic: META_MAGIC,
                ..BlockMeta::default()
            });
        }
        if self.dev.is_none() {
            return Err(Error::NoDevice);
        }
        let pbn = self.lbn_to_disk_pbn(lbn);
        let (dev4k, pack) = Self::devblock_of(pbn);
        let slot = self.load_devblock(dev4k)?;
        Ok(slot.meta[pack as usize].clone())
    }

    /// Replace persistent metadata for a disk block. Ignored for RAM blocks.
    pub fn set_block_meta(&mut self, lbn: u32, meta: BlockMeta) -> Result<(), Error> {
        if !self.is_valid(lbn) {
            return Err(Error::OutOfRange(lbn));
        }
        if lbn < self.ram_user {
            return Ok(());
        }
        if self.dev.is_none() {
            return Err(Error::NoDevice);
        }
        let pbn = self.lbn_to_disk_pbn(lbn);
        let (dev4k, pack) = Self::devblock_of(pbn);
        let slot = self.load_devblock(dev4k)?;
        slot.meta[pack as usize] = meta;
        slot.meta_dirty = true;
        Ok(())
    }

    /// Discard all cached devblocks and RAM dirty state without writing
    /// anything back.
    pub fn empty_buffers(&mut self) {
        for slot in &mut self.cache {
            slot.valid = false;
            slot.dirty = false;
            slot.meta_dirty = false;
        }
        self.dirty_ram.fill(false);
    }

    /// Verify the stored payload CRC64 for a disk block. Returns whether it
    /// matches; verification is explicit, never implied by reads.
    pub fn verify_block(&mut self, lbn: u32) -> Result<bool, Error> {
        if !self.is_valid(lbn) {
            return Err(Error::OutOfRange(lbn));
        }
        if lbn < self.ram_user {
            return Err(Error::RamBlock(lbn));
        }
        if self.dev.is_none() {
            return Err(Error::NoDevice);
        }
        let pbn = self.lbn_to_disk_pbn(lbn);
        let (dev4k, pack) = Self::devblock_of(pbn);
        let slot = self.load_devblock(dev4k)?;
        let start = pack as usize * FORTH_BLOCK_SIZE;
        let actual = crc64(&slot.data[start..start + FORTH_BLOCK_SIZE]);
        let stored = slot.meta[pack as usize].checksum;
        if actual != stored {
            log::warn!("blk: CRC mismatch on block {lbn}: stored {stored:#x}, computed {actual:#x}");
        }
        Ok(actual == stored)
    }

    // ===== mapping =====

    fn lbn_to_disk_pbn(&self, lbn: u32) -> u32 {
        debug_assert!(lbn >= self.ram_user);
        DISK_START + DISK_SYS_RESERVED + (lbn - self.ram_user)
    }

    fn devblock_of(pbn: u32) -> (u32, u32) {
        ((pbn - DISK_START) / PACK_RATIO, (pbn - DISK_START) % PACK_RATIO)
    }

    fn disk_bam_offset(&self, lbn: u32) -> Result<u64, Error> {
        if !self.is_valid(lbn) {
            return Err(Error::OutOfRange(lbn));
        }
        if lbn < self.ram_user {
            return Err(Error::RamBlock(lbn));
        }
        let pbn = self.lbn_to_disk_pbn(lbn);
        let off = u64::from(pbn - DISK_START);
        if off >= self.vol.total_blocks {
            return Err(Error::OutOfRange(lbn));
        }
        Ok(off)
    }

    fn device(&mut self) -> Result<&mut Box<dyn BlockDevice>, Error> {
        self.dev.as_mut().ok_or(Error::NoDevice)
    }

    // ===== 4 KiB I/O over 1 KiB units =====

    fn unit_of_devblock(&self, dev4k: u32) -> u32 {
        (self.vol.devblock_base + dev4k) * 4
    }

    /// Read a payload devblock. Out-of-range or failed unit reads zero that
    /// unit with a warning; the engine never propagates payload read errors.
    fn read_devblock(&mut self, dev4k: u32, buf: &mut [u8; DEVBLOCK_SIZE]) {
        let base = self.unit_of_devblock(dev4k);
        let total = self.total_units;
        let dev = self.dev.as_mut().expect("device attached");
        for i in 0..4u32 {
            let unit = base + i;
            let span = &mut buf[i as usize * UNIT_SIZE..(i as usize + 1) * UNIT_SIZE];
            if unit >= total {
                span.fill(0);
                log::warn!("blk: read out of range (devblock {dev4k}, unit {unit}); zeroed");
                continue;
            }
            if let Err(err) = dev.read(unit, span) {
                span.fill(0);
                log::warn!("blk: read error on unit {unit} ({err}); zeroed");
            }
        }
    }

    fn write_devblock(&mut self, dev4k: u32, buf: &[u8; DEVBLOCK_SIZE]) -> Result<(), Error> {
        let base = self.unit_of_devblock(dev4k);
        let total = self.total_units;
        let dev = self.device()?;
        for i in 0..4u32 {
            let unit = base + i;
            if unit >= total {
                log::error!("blk: write out of range (devblock {dev4k}, unit {unit})");
                return Err(Error::OutOfRange(unit));
            }
            dev.write(unit, &buf[i as usize * UNIT_SIZE..(i as usize + 1) * UNIT_SIZE])?;
        }
        Ok(())
    }

    fn read_header(&mut self, buf: &mut [u8; DEVBLOCK_SIZE]) {
        let dev = self.dev.as_mut().expect("device attached");
        for i in 0..4u32 {
            let span = &mut buf[i as usize * UNIT_SIZE..(i as usize + 1) * UNIT_SIZE];
            if dev.read(i, span).is_err() {
                span.fill(0);
            }
        }
    }

    fn write_header(&mut self, buf: &[u8; DEVBLOCK_SIZE]) -> Result<(), Error> {
        let dev = self.device()?;
        for i in 0..4u32 {
            dev.write(i, &buf[i as usize * UNIT_SIZE..(i as usize + 1) * UNIT_SIZE])?;
        }
        Ok(())
    }

    // ===== cache =====

    fn slot_index_for(&mut self, dev4k: u32) -> Result<usize, Error> {
        if let Some(i) = self
            .cache
            .iter()
            .position(|s| s.valid && s.devblock == dev4k)
        {
            return Ok(i);
        }
        if let Some(i) = self.cache.iter().position(|s| !s.valid) {
            self.cache[i].reset_for(dev4k);
            return Ok(i);
        }
        // Evict slot 0, shift the rest down, load into the freed tail.
        self.writeback_slot(0)?;
        self.cache.rotate_left(1);
        let last = self.cache.len() - 1;
        self.cache[last].reset_for(dev4k);
        Ok(last)
    }

    fn load_devblock(&mut self, dev4k: u32) -> Result<&mut CacheSlot, Error> {
        let i = self.slot_index_for(dev4k)?;
        if !self.cache[i].loaded {
            let mut buf = Box::new([0u8; DEVBLOCK_SIZE]);
            self.read_devblock(dev4k, &mut buf);
            let slot = &mut self.cache[i];
            slot.data = buf;
            for (j, meta) in slot.meta.iter_mut().enumerate() {
                let start = META_REGION_OFFSET + j * META_PER_BLOCK;
                *meta = BlockMeta::decode(&slot.data[start..start + META_PER_BLOCK]);
                if meta.magic != META_MAGIC {
                    *meta = BlockMeta {
                        magic: META_MAGIC,
                        ..BlockMeta::default()
                    };
                }
            }
            slot.loaded = true;
        }
        Ok(&mut self.cache[i])
    }

    fn writeback_slot(&mut self, i: usize) -> Result<(), Error> {
        let slot = &mut self.cache[i];
        if !slot.valid || !(slot.dirty || slot.meta_dirty) {
            return Ok(());
        }
        if slot.meta_dirty {
            for j in 0..PACK_RATIO as usize {
                let start = META_REGION_OFFSET + j * META_PER_BLOCK;
                let meta = slot.meta[j].clone();
                meta.encode(&mut slot.data[start..start + META_PER_BLOCK]);
            }
        }
        let dev4k = slot.devblock;
        let data = slot.data.clone();
        self.write_devblock(dev4k, &data)?;
        let slot = &mut self.cache[i];
        slot.dirty = false;
        slot.meta_dirty = false;
        Ok(())
    }

    // ===== format / load =====

    fn choose_bam_pages(total_devblocks: u64) -> u32 {
        if total_devblocks <= 2 {
            return 1;
        }
        let bits_needed = 3 * (total_devblocks - 1);
        let pages = bits_needed.div_ceil(BITS_PER_BAM_PAGE).max(1);
        pages.min(u64::from(u32::MAX)) as u32
    }

    fn compute_totals(vol: &mut VolumeHeader) {
        let b = u64::from(vol.bam_devblocks);
        vol.tracked_blocks = BITS_PER_BAM_PAGE * b;
        let payload = vol.total_devblocks.saturating_sub(1 + b);
        vol.total_blocks = vol.tracked_blocks.min(3 * payload);

        let reserved = u64::from(DISK_SYS_RESERVED).min(vol.total_blocks);
        vol.first_free = u64::from(DISK_START) + reserved;
        vol.last_allocated = u64::from(DISK_START) + reserved - 1;
    }

    fn load_bam(&mut self) {
        let pages = self.vol.bam_devblocks;
        self.bam = vec![0u8; pages as usize * DEVBLOCK_SIZE];
        for page in 0..pages {
            let base = (self.vol.bam_start + page) * 4;
            for k in 0..4u32 {
                let dst_start = page as usize * DEVBLOCK_SIZE + k as usize * UNIT_SIZE;
                let dev = self.dev.as_mut().expect("device attached");
                if dev
                    .read(base + k, &mut self.bam[dst_start..dst_start + UNIT_SIZE])
                    .is_err()
                {
                    self.bam[dst_start..dst_start + UNIT_SIZE].fill(0);
                }
            }
        }
        self.bam_dirty = false;
    }

    fn flush_bam(&mut self) -> Result<(), Error> {
        if self.bam.is_empty() || !self.bam_dirty {
            return Ok(());
        }
        for page in 0..self.vol.bam_devblocks {
            let base = (self.vol.bam_start + page) * 4;
            for k in 0..4u32 {
                let src_start = page as usize * DEVBLOCK_SIZE + k as usize * UNIT_SIZE;
                let span = self.bam[src_start..src_start + UNIT_SIZE].to_vec();
                self.device()?.write(base + k, &span)?;
            }
        }
        self.device()?.flush()?;
        self.bam_dirty = false;
        Ok(())
    }

    fn refresh_user_span(&mut self) {
        let disk_user = self
            .vol
            .total_blocks
            .saturating_sub(u64::from(DISK_SYS_RESERVED));
        self.total_user_lbn = u64::from(self.ram_user) + disk_user;
    }

    fn format_or_load(&mut self, host: &dyn HostServices) -> Result<(), Error> {
        let mut hdr = [0u8; DEVBLOCK_SIZE];
        self.read_header(&mut hdr);
        let vol = VolumeHeader::decode(&hdr);

        if vol.magic == VOLUME_MAGIC && vol.version == VOLUME_VERSION && vol.bam_devblocks != 0 {
            self.vol = vol;
            self.vol.total_devblocks = u64::from(self.total_units / 4);
            self.load_bam();
            self.refresh_user_span();
            return Ok(());
        }

        // Fresh format.
        let mut vol = VolumeHeader {
            created_time: host.monotonic_ns(),
            total_devblocks: u64::from(self.total_units / 4),
            bam_start: 1,
            ..VolumeHeader::default()
        };
        vol.bam_devblocks = Self::choose_bam_pages(vol.total_devblocks);
        vol.devblock_base = vol.bam_start + vol.bam_devblocks;
        Self::compute_totals(&mut vol);

        self.bam = vec![0u8; vol.bam_devblocks as usize * DEVBLOCK_SIZE];
        let reserve = u64::from(DISK_SYS_RESERVED).min(vol.total_blocks);
        for i in 0..reserve {
            bam_set(&mut self.bam, i);
        }
        vol.free_blocks = vol.total_blocks - reserve;

        self.vol = vol;
        let mut buf = [0u8; DEVBLOCK_SIZE];
        self.vol.encode(&mut buf);
        self.write_header(&buf)?;

        self.bam_dirty = true;
        self.flush_bam()?;
        self.device()?.flush()?;
        self.refresh_user_span();
        Ok(())
    }
}

impl Default for BlockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blkio::RamDevice;
    use crate::host::CapturingHost;

    fn engine_with_device(units: u32) -> (BlockEngine, CapturingHost) {
        let host = CapturingHost::new();
        let mut engine = BlockEngine::new();
        engine
            .attach_device(Box::new(RamDevice::new(units)), &host)
            .unwrap();
        (engine, host)
    }

    #[test]
    fn crc64_is_deterministic() {
        let data = b"the quick brown fox";
        assert_eq!(crc64(data), crc64(data));
        assert_ne!(crc64(data), crc64(b"the quick brown fog"));
        assert_eq!(0, crc64(&[]) ^ crc64(&[]));
    }

    #[test]
    fn header_codec_round_trips() {
        let mut vol = VolumeHeader::default();
        vol.total_devblocks = 1234;
        vol.bam_devblocks = 3;
        vol.free_blocks = 777;
        vol.first_free = 1056;
        let mut buf = [0u8; DEVBLOCK_SIZE];
        vol.encode(&mut buf);
        assert_eq!(vol, VolumeHeader::decode(&buf));
        assert_eq!(&buf[0..4], &VOLUME_MAGIC.to_le_bytes());
    }

    #[test]
    fn meta_codec_round_trips() {
        let meta = BlockMeta {
            checksum: 0xDEAD_BEEF,
            magic: META_MAGIC,
            created_time: 1,
            modified_time: 2,
            flags: BlockFlags::USED | BlockFlags::CHAINED,
            write_count: 9,
            content_type: ContentType::Source.into(),
            encoding: ContentEncoding::Utf8.into(),
            content_length: 812,
            entropy: [1, 2, 3, 4],
            hash: [5, 6, 7, 8],
            owner_id: 42,
            permissions: 0o644,
            acl_block: 0,
            signature: [10, 11],
            prev_block: 1000,
            next_block: 1002,
            parent_block: 0,
            chain_length: 3,
            app_data: [7; 15],
        };
        let mut slice = vec![0u8; META_PER_BLOCK];
        meta.encode(&mut slice);
        let back = BlockMeta::decode(&slice);
        assert_eq!(meta, back);
        assert_eq!(Some(ContentType::Source), back.content_type());
        assert_eq!(Some(ContentEncoding::Utf8), back.content_encoding());
    }

    #[test]
    fn fresh_format_then_reload() {
        let host = CapturingHost::new();
        let mut engine = BlockEngine::new();
        engine
            .attach_device(Box::new(RamDevice::new(256)), &host)
            .unwrap();

        let vol = engine.volume_meta().clone();
        assert_eq!(VOLUME_MAGIC, vol.magic);
        assert_eq!(VOLUME_VERSION, vol.version);
        assert!(vol.bam_devblocks > 0);
        assert_eq!(
            vol.total_blocks - u64::from(DISK_SYS_RESERVED),
            vol.free_blocks
        );

        // Reattach the same device: the header must load, not reformat.
        let dev = engine.detach().unwrap().unwrap();
        let mut engine2 = BlockEngine::new();
        engine2.attach_device(dev, &host).unwrap();
        let vol2 = engine2.volume_meta();
        assert_eq!(vol.created_time, vol2.created_time);
        assert_eq!(vol.total_blocks, vol2.total_blocks);
        assert_eq!(vol.free_blocks, vol2.free_blocks);
    }

    #[test]
    fn every_user_lbn_is_readable() {
        let (mut engine, _host) = engine_with_device(256);
        let total = engine.total_blocks();
        assert!(total > engine.ram_user);
        for lbn in 0..total {
            let buf = engine.get_buffer(lbn, false).unwrap();
            assert_eq!(FORTH_BLOCK_SIZE, buf.len());
        }
        assert!(engine.get_buffer(total, false).is_err());
    }

    #[test]
    fn ram_block_round_trip() {
        let mut engine = BlockEngine::new();
        let buf = engine.get_buffer(0, true).unwrap();
        buf[..4].copy_from_slice(&[1, 2, 3, 4]);
        let buf = engine.get_buffer(0, false).unwrap();
        assert_eq!(&[1, 2, 3, 4], &buf[..4]);
    }

    #[test]
    fn disk_update_sets_bam_once() {
        let (mut engine, host) = engine_with_device(256);
        let ram_user = engine.ram_user;
        let lbn = ram_user; // first disk-backed LBN
        let free_before = engine.volume_meta().free_blocks;

        assert!(!engine.is_allocated(lbn).unwrap());
        let buf = engine.get_buffer(lbn, true).unwrap();
        buf[0] = 0x42;
        engine.update(lbn, &host).unwrap();
        assert!(engine.is_allocated(lbn).unwrap());
        assert_eq!(free_before - 1, engine.volume_meta().free_blocks);

        // Updating again must not double-count.
        engine.update(lbn, &host).unwrap();
        assert_eq!(free_before - 1, engine.volume_meta().free_blocks);

        let meta = engine.block_meta(lbn).unwrap();
        assert_eq!(META_MAGIC, meta.magic);
        assert!(meta.checksum != 0);
        assert!(meta.created_time > 0);
    }

    #[test]
    fn disk_block_survives_flush_and_reattach() {
        let host = CapturingHost::new();
        let mut engine = BlockEngine::new();
        engine
            .attach_device(Box::new(RamDevice::new(256)), &host)
            .unwrap();
        let lbn = engine.ram_user;

        let buf = engine.get_buffer(lbn, true).unwrap();
        for (i, b) in buf.iter_mut().take(10).enumerate() {
            *b = (i + 1) as u8;
        }
        engine.update(lbn, &host).unwrap();
        engine.flush(0).unwrap();

        let dev = engine.detach().unwrap().unwrap();
        let mut engine2 = BlockEngine::new();
        engine2.attach_device(dev, &host).unwrap();
        let buf = engine2.get_buffer(lbn, false).unwrap();
        assert_eq!(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], &buf[..10]);
        assert!(engine2.is_allocated(lbn).unwrap());
        assert!(engine2.verify_block(lbn).unwrap());
    }

    #[test]
    fn flush_of_uncached_block_is_noop() {
        let (mut engine, _host) = engine_with_device(256);
        let lbn = engine.ram_user + 5;
        engine.flush(lbn).unwrap();
    }

    #[test]
    fn allocate_returns_first_free_and_advances() {
        let (mut engine, _host) = engine_with_device(256);
        let first = engine.allocate().unwrap();
        assert_eq!(engine.ram_user, first);
        let second = engine.allocate().unwrap();
        assert_eq!(first + 1, second);
        assert!(engine.is_allocated(first).unwrap());

        engine.mark_free(first).unwrap();
        assert!(!engine.is_allocated(first).unwrap());
        // The freed block becomes the scan hint again.
        let again = engine.allocate().unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn cache_eviction_preserves_data() {
        let (mut engine, host) = engine_with_device(1024);
        let ram_user = engine.ram_user;
        // Touch more devblocks than the cache holds.
        let span = (CACHE_SLOTS as u32 + 4) * PACK_RATIO;
        for i in 0..span {
            let lbn = ram_user + i;
            let buf = engine.get_buffer(lbn, true).unwrap();
            buf[0] = (i & 0xFF) as u8;
            engine.update(lbn, &host).unwrap();
        }
        for i in 0..span {
            let lbn = ram_user + i;
            let buf = engine.get_buffer(lbn, false).unwrap();
            assert_eq!((i & 0xFF) as u8, buf[0], "lbn {lbn}");
        }
    }
}
