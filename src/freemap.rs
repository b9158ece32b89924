//! Bitmap of free and in-use sectors, itself stored in an inode.
//!
//! A bit per sector, scanned linearly for the first free one. The
//! authoritative copy lives in memory behind one lock (the free-map lock
//! at the bottom of the locking hierarchy), and every flip mirrors out to
//! its backing inode, so a lookup never has to touch the cache.
//!
//! Bootstrapping is the one subtlety: the free-map's own data sectors are
//! handed out by this same allocator while its backing inode is still being
//! built (`FileSystem::format`). Until [`FreeMap::attach`] is called, flips
//! only touch the in-memory bitmap; `attach` then persists the bitmap in full
//! once the inode has blocks to hold it.

use std::sync::{Arc, Mutex};

use crate::cache::Cache;
use crate::device::SectorNum;
use crate::error::{FsError, FsResult};
use crate::inode::{Inode, SectorSource};

pub struct FreeMap {
    bits: Mutex<Vec<bool>>,
    inode: Mutex<Option<Arc<Inode>>>,
}

impl FreeMap {
    /// Builds a free-map covering `total_sectors`, with `reserved` already
    /// marked in use. Not yet backed by an inode: used while formatting,
    /// before the free-map's own inode exists.
    pub fn new_reserving(total_sectors: usize, reserved: &[SectorNum]) -> Self {
        let mut bits = vec![false; total_sectors];
        for &sector in reserved {
            bits[sector as usize] = true;
        }
        Self {
            bits: Mutex::new(bits),
            inode: Mutex::new(None),
        }
    }

    /// Loads a free-map from its backing inode's data, for a normal mount.
    pub fn load(cache: &Cache, inode: Arc<Inode>, total_sectors: usize) -> Self {
        let byte_len = (total_sectors + 7) / 8;
        let mut bytes = vec![0u8; byte_len];
        let read = inode.read_at(cache, &mut bytes, 0);
        assert_eq!(read, byte_len, "free-map inode shorter than the device it maps");
        let bits = bytes_to_bits(&bytes, total_sectors);
        Self {
            bits: Mutex::new(bits),
            inode: Mutex::new(Some(inode)),
        }
    }

    /// Attaches the backing inode once it exists and writes the current
    /// bitmap out to it in full. Called exactly once, at the end of format.
    pub fn attach(&self, cache: &Cache, inode: Arc<Inode>) {
        let bits = self.bits.lock().unwrap();
        let bytes = bits_to_bytes(&bits);
        let written = inode.write_at(cache, &NoAlloc, &bytes, 0);
        assert_eq!(
            written.map(|n| n == bytes.len()),
            Ok(true),
            "free-map inode must already be sized to hold the full bitmap"
        );
        *self.inode.lock().unwrap() = Some(inode);
    }

    /// Finds a free sector, marks it used, and returns its number.
    pub fn allocate(&self, cache: &Cache) -> FsResult<SectorNum> {
        let mut bits = self.bits.lock().unwrap();
        let idx = bits
            .iter()
            .position(|used| !used)
            .ok_or(FsError::AllocationFailed)?;
        bits[idx] = true;
        self.persist_bit(cache, &bits, idx);
        Ok(idx as SectorNum)
    }

    /// Marks `sector` free again.
    pub fn release(&self, cache: &Cache, sector: SectorNum) {
        let mut bits = self.bits.lock().unwrap();
        let idx = sector as usize;
        assert!(bits[idx], "releasing sector {} that was already free", sector);
        bits[idx] = false;
        self.persist_bit(cache, &bits, idx);
    }

    /// Number of sectors currently marked in use. Exposed for tests that
    /// check the sector count stays put across a rollback.
    pub fn used_count(&self) -> usize {
        self.bits.lock().unwrap().iter().filter(|&&b| b).count()
    }

    pub fn free_count(&self) -> usize {
        let bits = self.bits.lock().unwrap();
        bits.len() - bits.iter().filter(|&&b| b).count()
    }

    fn persist_bit(&self, cache: &Cache, bits: &[bool], idx: usize) {
        let inode = self.inode.lock().unwrap();
        let inode = match inode.as_ref() {
            Some(inode) => inode,
            None => return, // still bootstrapping; attach() will persist in full
        };
        let byte_idx = idx / 8;
        let byte = pack_byte(bits, byte_idx * 8);
        let written = inode.write_at(cache, &NoAlloc, &[byte], byte_idx);
        assert_eq!(written, Ok(1), "free-map inode write must not need to grow");
    }
}

fn pack_byte(bits: &[bool], start: usize) -> u8 {
    let mut byte = 0u8;
    for i in 0..8 {
        if bits.get(start + i).copied().unwrap_or(false) {
            byte |= 1 << i;
        }
    }
    byte
}

fn bits_to_bytes(bits: &[bool]) -> Vec<u8> {
    (0..bits.len())
        .step_by(8)
        .map(|start| pack_byte(bits, start))
        .collect()
}

fn bytes_to_bits(bytes: &[u8], total_sectors: usize) -> Vec<bool> {
    let mut bits = Vec::with_capacity(total_sectors);
    for i in 0..total_sectors {
        let byte = bytes[i / 8];
        bits.push(byte & (1 << (i % 8)) != 0);
    }
    bits
}

impl SectorSource for FreeMap {
    fn allocate(&self, cache: &Cache) -> FsResult<SectorNum> {
        FreeMap::allocate(self, cache)
    }

    fn release(&self, cache: &Cache, sector: SectorNum) {
        FreeMap::release(self, cache, sector)
    }
}

/// A [`SectorSource`] that never allocates, for use by the free-map's own
/// writes: its inode's length never changes after format, so every write
/// lands inside already-allocated blocks and neither method should fire.
pub(crate) struct NoAlloc;

impl SectorSource for NoAlloc {
    fn allocate(&self, _cache: &Cache) -> FsResult<SectorNum> {
        unreachable!("free-map inode length is fixed at format time")
    }

    fn release(&self, _cache: &Cache, _sector: SectorNum) {
        unreachable!("free-map inode length is fixed at format time")
    }
}
