//! Write-back sector cache fronting a [`BlockDevice`].
//!
//! A fixed number of slots, one lock held for the whole of any operation,
//! and NRU-by-oldest-touch eviction. `last_touched` is a tick counter rather
//! than a wall-clock read, and the lock is a blocking `std::sync::Mutex`
//! rather than a busy-wait spinlock, since this crate runs hosted rather
//! than bare metal.

use std::sync::Mutex;

use crate::device::{BlockDevice, Sector, SectorNum};
use crate::param::SECTOR_SIZE;

struct Entry {
    sector: SectorNum,
    buffer: Sector,
    dirty: bool,
    free: bool,
    last_touched: u64,
}

impl Entry {
    fn new() -> Self {
        Self {
            sector: 0,
            buffer: [0u8; SECTOR_SIZE],
            dirty: false,
            free: true,
            last_touched: 0,
        }
    }
}

struct Inner {
    device: Box<dyn BlockDevice>,
    entries: Vec<Entry>,
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Finds an entry already caching `sector`, or evicts one and fills it
    /// with the on-disk contents. Returns the entry's index.
    fn find_or_fetch(&mut self, sector: SectorNum) -> usize {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| !e.free && e.sector == sector)
        {
            log::trace!("cache hit: sector {}", sector);
            return idx;
        }
        self.evict_and_fetch(sector)
    }

    /// Finds an entry already caching `sector`, or evicts one *without*
    /// reading the device first. Used by full-sector writes, which
    /// overwrite every byte of the slot anyway.
    fn find_or_alloc(&mut self, sector: SectorNum) -> usize {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| !e.free && e.sector == sector)
        {
            return idx;
        }
        let idx = self.evict_victim();
        let entry = &mut self.entries[idx];
        entry.sector = sector;
        entry.free = false;
        entry.dirty = false;
        idx
    }

    fn evict_victim(&mut self) -> usize {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_touched)
            .map(|(i, _)| i)
            .expect("cache has no slots");
        let entry = &mut self.entries[idx];
        if !entry.free && entry.dirty {
            log::debug!("evicting dirty sector {} to device", entry.sector);
            self.device
                .write_sector(entry.sector, &entry.buffer)
                .expect("block device write failed");
        }
        entry.free = true;
        entry.dirty = false;
        idx
    }

    fn evict_and_fetch(&mut self, sector: SectorNum) -> usize {
        let idx = self.evict_victim();
        self.device
            .read_sector(sector, &mut self.entries[idx].buffer)
            .expect("block device read failed");
        let tick = self.next_tick();
        let entry = &mut self.entries[idx];
        entry.sector = sector;
        entry.free = false;
        entry.last_touched = tick;
        idx
    }
}

/// Fixed-size, write-back sector cache. The sole client of the underlying
/// [`BlockDevice`]: all reads and writes to the device go through here.
pub struct Cache {
    inner: Mutex<Inner>,
}

impl Cache {
    pub fn new(device: Box<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0, "cache must have at least one slot");
        let entries = (0..capacity).map(|_| Entry::new()).collect();
        Self {
            inner: Mutex::new(Inner {
                device,
                entries,
                tick: 0,
            }),
        }
    }

    /// Reads a full sector into `dst`.
    pub fn read(&self, sector: SectorNum, dst: &mut Sector) {
        self.read_offset(sector, dst, 0, SECTOR_SIZE);
    }

    /// Reads `len` bytes starting at `ofs` within `sector` into `dst[..len]`.
    pub fn read_offset(&self, sector: SectorNum, dst: &mut [u8], ofs: usize, len: usize) {
        assert!(ofs + len <= SECTOR_SIZE);
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.find_or_fetch(sector);
        let tick = inner.next_tick();
        let entry = &mut inner.entries[idx];
        dst[..len].copy_from_slice(&entry.buffer[ofs..ofs + len]);
        entry.last_touched = tick;
    }

    /// Writes a full sector from `src`.
    pub fn write(&self, sector: SectorNum, src: &Sector) {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.find_or_alloc(sector);
        inner.entries[idx].buffer.copy_from_slice(src);
        let tick = inner.next_tick();
        let entry = &mut inner.entries[idx];
        entry.last_touched = tick;
        // A full-sector write needs no prior read; it flushes eagerly
        // rather than leaving the entry only dirty, while still keeping
        // the fill in the cache entry.
        inner
            .device
            .write_sector(sector, &entry.buffer)
            .expect("block device write failed");
    }

    /// Writes `src[..len]` at offset `ofs` within `sector`; the unwritten
    /// bytes of the sector are preserved (read-before-write) and the entry
    /// is left dirty rather than written through.
    pub fn write_offset(&self, sector: SectorNum, src: &[u8], ofs: usize, len: usize) {
        assert!(ofs + len <= SECTOR_SIZE);
        if ofs == 0 && len == SECTOR_SIZE {
            let mut full = [0u8; SECTOR_SIZE];
            full.copy_from_slice(src);
            self.write(sector, &full);
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        // Partial write: must preserve the bytes outside [ofs, ofs+len), so
        // the sector is read in first if it wasn't already cached.
        let idx = inner.find_or_fetch(sector);
        let tick = inner.next_tick();
        let entry = &mut inner.entries[idx];
        entry.buffer[ofs..ofs + len].copy_from_slice(src);
        entry.dirty = true;
        entry.last_touched = tick;
    }

    /// Writes every dirty entry back to the device. The cache stays
    /// populated afterward.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        for i in 0..inner.entries.len() {
            if !inner.entries[i].free && inner.entries[i].dirty {
                let sector = inner.entries[i].sector;
                let buffer = inner.entries[i].buffer;
                inner
                    .device
                    .write_sector(sector, &buffer)
                    .expect("block device write failed");
                inner.entries[i].dirty = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn cache(capacity: usize, sectors: usize) -> Cache {
        Cache::new(Box::new(MemDevice::new(sectors)), capacity)
    }

    #[test]
    fn full_sector_round_trip() {
        let c = cache(4, 16);
        let mut src = [0u8; SECTOR_SIZE];
        src[0] = 0xAB;
        c.write(3, &src);
        let mut dst = [0u8; SECTOR_SIZE];
        c.read(3, &mut dst);
        assert_eq!(dst, src);
    }

    #[test]
    fn partial_write_preserves_surrounding_bytes() {
        let c = cache(4, 16);
        let mut src = [0u8; SECTOR_SIZE];
        for (i, b) in src.iter_mut().enumerate() {
            *b = i as u8;
        }
        c.write(5, &src);
        c.write_offset(5, &[0xFF, 0xFF], 10, 2);
        let mut dst = [0u8; SECTOR_SIZE];
        c.read(5, &mut dst);
        assert_eq!(dst[9], 9);
        assert_eq!(dst[10], 0xFF);
        assert_eq!(dst[11], 0xFF);
        assert_eq!(dst[12], 12);
    }

    #[test]
    fn eviction_picks_least_recently_touched() {
        // capacity 2: fill both, touch sector 0 again, then bring in a third
        // sector. Sector 1 must be the one evicted (and its dirty data must
        // make it to the device).
        let c = cache(2, 16);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 1;
        c.write(0, &buf);
        buf[0] = 2;
        c.write(1, &buf);

        let mut dst = [0u8; SECTOR_SIZE];
        c.read(0, &mut dst); // touch sector 0 again, it's now the MRU slot

        buf[0] = 3;
        c.write(2, &buf); // evicts sector 1, not sector 0

        c.read(0, &mut dst);
        assert_eq!(dst[0], 1, "sector 0 must survive the eviction");
        c.read(2, &mut dst);
        assert_eq!(dst[0], 3);
    }

    use proptest::prelude::*;

    proptest! {
        /// Invariant 1 (cache transparency): for any sequence of offset
        /// writes to one sector, the cache's view always equals the last
        /// byte written to each offset, and a `flush` makes a bypass read of
        /// the device agree with that view.
        #[test]
        fn cache_transparency_under_random_writes(
            writes in proptest::collection::vec((0usize..SECTOR_SIZE, any::<u8>()), 1..64)
        ) {
            use crate::device::SharedMemDevice;

            let shared = SharedMemDevice::new(4);
            let c = Cache::new(Box::new(shared.clone()), 2);
            let mut model = [0u8; SECTOR_SIZE];

            for (ofs, byte) in &writes {
                c.write_offset(1, std::slice::from_ref(byte), *ofs, 1);
                model[*ofs] = *byte;
            }

            let mut seen = [0u8; SECTOR_SIZE];
            c.read(1, &mut seen);
            prop_assert_eq!(seen, model);

            c.flush();
            let on_disk = shared.bypass_read(1);
            prop_assert_eq!(on_disk, model);
        }
    }

    #[test]
    fn flush_writes_all_dirty_entries() {
        use crate::device::SharedMemDevice;

        let shared = SharedMemDevice::new(4);
        let c = Cache::new(Box::new(shared.clone()), 2);
        let mut full = [0u8; SECTOR_SIZE];
        full[0] = 7;
        c.write(0, &full);
        c.write_offset(0, &[9], 1, 1);
        c.flush();

        let on_disk = shared.bypass_read(0);
        assert_eq!(on_disk[0], 7);
        assert_eq!(on_disk[1], 9);
    }
}
