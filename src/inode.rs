//! On-disk inodes: a fixed-size header plus a direct/indirect/doubly-indirect
//! extent tree, and the in-memory open-inode table layered over it.
//!
//! The extent tree reaches a third, doubly-indirect level beyond plain
//! direct-plus-single-indirect addressing, to cover a larger maximum file
//! size than that alone would allow.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::Cache;
use crate::device::SectorNum;
use crate::error::{FsError, FsResult};
use crate::param::{MAX_FILE_SIZE, NDIRECT, PTRS_PER_BLOCK, SECTOR_SIZE};

pub const INODE_MAGIC: u32 = 0x494e_4f44; // "INOD"

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileType {
    File = 1,
    Directory = 2,
}

impl FileType {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => FileType::File,
            2 => FileType::Directory,
            other => panic!("corrupt inode: unknown type tag {}", other),
        }
    }
}

const DISK_INODE_HEADER: usize = 4 + 4 + NDIRECT * 4 + 4 + 4 + 4;
const DISK_INODE_PADDING: usize = SECTOR_SIZE - DISK_INODE_HEADER;

/// The on-disk inode layout, exactly one sector wide.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    length: u32,
    magic: u32,
    direct: [u32; NDIRECT],
    indirect: u32,
    doubly_indirect: u32,
    file_type: u32,
    _padding: [u8; DISK_INODE_PADDING],
}

const_assert_eq!(std::mem::size_of::<DiskInode>(), SECTOR_SIZE);

impl DiskInode {
    fn zeroed(file_type: FileType) -> Self {
        Self {
            length: 0,
            magic: INODE_MAGIC,
            direct: [0; NDIRECT],
            indirect: 0,
            doubly_indirect: 0,
            file_type: file_type as u32,
            _padding: [0; DISK_INODE_PADDING],
        }
    }

    pub fn read(cache: &Cache, sector: SectorNum) -> Self {
        let mut raw = [0u8; SECTOR_SIZE];
        cache.read(sector, &mut raw);
        let disk = Self::read_from(&raw[..]).expect("sector-sized buffer always parses");
        assert_eq!(disk.magic, INODE_MAGIC, "corrupt inode at sector {}", sector);
        disk
    }

    fn write(&self, cache: &Cache, sector: SectorNum) {
        let mut raw = [0u8; SECTOR_SIZE];
        raw.copy_from_slice(self.as_bytes());
        cache.write(sector, &raw);
    }

    pub fn length(&self) -> usize {
        self.length as usize
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_raw(self.file_type)
    }

    pub fn indirect_ptr(&self) -> SectorNum {
        self.indirect
    }

    pub fn doubly_indirect_ptr(&self) -> SectorNum {
        self.doubly_indirect
    }
}

/// One sector's worth of sector pointers: an indirect block, or one level of
/// the doubly-indirect tree.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct PointerBlock {
    ptrs: [u32; PTRS_PER_BLOCK],
}

const_assert_eq!(std::mem::size_of::<PointerBlock>(), SECTOR_SIZE);

impl PointerBlock {
    fn zeroed() -> Self {
        Self {
            ptrs: [0; PTRS_PER_BLOCK],
        }
    }

    fn read(cache: &Cache, sector: SectorNum) -> Self {
        let mut raw = [0u8; SECTOR_SIZE];
        cache.read(sector, &mut raw);
        Self::read_from(&raw[..]).expect("sector-sized buffer always parses")
    }

    fn write(&self, cache: &Cache, sector: SectorNum) {
        let mut raw = [0u8; SECTOR_SIZE];
        raw.copy_from_slice(self.as_bytes());
        cache.write(sector, &raw);
    }
}

fn zero_sector(cache: &Cache, sector: SectorNum) {
    cache.write(sector, &[0u8; SECTOR_SIZE]);
}

/// Whatever can hand out and take back sector numbers for a resizing inode.
/// Lets `resize` stay ignorant of the free-map's own bootstrapping (see
/// `freemap::NoAlloc`).
pub trait SectorSource {
    fn allocate(&self, cache: &Cache) -> FsResult<SectorNum>;
    fn release(&self, cache: &Cache, sector: SectorNum);
}

/// Grows or shrinks `disk`'s extent tree so its data spans exactly
/// `target_len` bytes, allocating or freeing sectors as needed.
///
/// A single call only ever grows or only ever shrinks, never both: every
/// slot's allocate/free decision depends solely on comparing `target_len`
/// against that slot's fixed byte-offset threshold, and thresholds below the
/// old length are already in the state a shrink would leave them in, while
/// thresholds below the new length are already in the state a grow would
/// leave them in. If an allocation fails partway through a grow, every
/// sector this call itself allocated is released and `disk` is restored to
/// its pre-call snapshot, a direct restore rather than a recursive resize.
pub fn resize(
    disk: &mut DiskInode,
    cache: &Cache,
    source: &dyn SectorSource,
    target_len: usize,
) -> FsResult<()> {
    if target_len == disk.length() {
        return Ok(());
    }
    if target_len > MAX_FILE_SIZE {
        // Past the reach of direct + indirect + doubly-indirect addressing:
        // one byte past the ceiling must fail outright, not silently
        // allocate only up to the ceiling while claiming a longer length.
        return Err(FsError::AllocationFailed);
    }
    let snapshot = *disk;
    let mut allocated = Vec::new();
    match walk_extent_tree(disk, cache, source, target_len, &mut allocated) {
        Ok(()) => {
            disk.length = target_len as u32;
            Ok(())
        }
        Err(e) => {
            log::warn!(
                "resize to {} bytes failed, releasing {} newly allocated sector(s)",
                target_len,
                allocated.len()
            );
            for sector in allocated.into_iter().rev() {
                source.release(cache, sector);
            }
            *disk = snapshot;
            Err(e)
        }
    }
}

fn walk_extent_tree(
    disk: &mut DiskInode,
    cache: &Cache,
    source: &dyn SectorSource,
    target_len: usize,
    allocated: &mut Vec<SectorNum>,
) -> FsResult<()> {
    for i in 0..NDIRECT {
        let pos = i * SECTOR_SIZE;
        if target_len <= pos && disk.direct[i] != 0 {
            source.release(cache, disk.direct[i]);
            disk.direct[i] = 0;
        } else if target_len > pos && disk.direct[i] == 0 {
            let sector = source.allocate(cache)?;
            allocated.push(sector);
            zero_sector(cache, sector);
            disk.direct[i] = sector;
        }
    }

    let indirect_threshold = NDIRECT * SECTOR_SIZE;
    if disk.indirect == 0 && target_len <= indirect_threshold {
        return Ok(());
    }

    let mut indirect_block = if disk.indirect == 0 {
        let sector = source.allocate(cache)?;
        allocated.push(sector);
        zero_sector(cache, sector);
        disk.indirect = sector;
        PointerBlock::zeroed()
    } else {
        PointerBlock::read(cache, disk.indirect)
    };

    for i in 0..PTRS_PER_BLOCK {
        let pos = (NDIRECT + i) * SECTOR_SIZE;
        if target_len <= pos && indirect_block.ptrs[i] != 0 {
            source.release(cache, indirect_block.ptrs[i]);
            indirect_block.ptrs[i] = 0;
        } else if target_len > pos && indirect_block.ptrs[i] == 0 {
            let sector = source.allocate(cache)?;
            allocated.push(sector);
            zero_sector(cache, sector);
            indirect_block.ptrs[i] = sector;
        }
    }

    if target_len <= indirect_threshold {
        source.release(cache, disk.indirect);
        disk.indirect = 0;
    } else {
        indirect_block.write(cache, disk.indirect);
    }

    let doubly_threshold = (NDIRECT + PTRS_PER_BLOCK) * SECTOR_SIZE;
    if disk.doubly_indirect == 0 && target_len <= doubly_threshold {
        return Ok(());
    }

    let mut l1_block = if disk.doubly_indirect == 0 {
        let sector = source.allocate(cache)?;
        allocated.push(sector);
        zero_sector(cache, sector);
        disk.doubly_indirect = sector;
        PointerBlock::zeroed()
    } else {
        PointerBlock::read(cache, disk.doubly_indirect)
    };

    for i in 0..PTRS_PER_BLOCK {
        let base = doubly_threshold + i * PTRS_PER_BLOCK * SECTOR_SIZE;
        if l1_block.ptrs[i] == 0 && target_len <= base {
            break;
        }

        let mut l2_block = if l1_block.ptrs[i] == 0 {
            let sector = source.allocate(cache)?;
            allocated.push(sector);
            zero_sector(cache, sector);
            l1_block.ptrs[i] = sector;
            PointerBlock::zeroed()
        } else {
            PointerBlock::read(cache, l1_block.ptrs[i])
        };

        for j in 0..PTRS_PER_BLOCK {
            let pos = base + j * SECTOR_SIZE;
            if target_len <= pos && l2_block.ptrs[j] != 0 {
                source.release(cache, l2_block.ptrs[j]);
                l2_block.ptrs[j] = 0;
            } else if target_len > pos && l2_block.ptrs[j] == 0 {
                let sector = source.allocate(cache)?;
                allocated.push(sector);
                zero_sector(cache, sector);
                l2_block.ptrs[j] = sector;
            }
        }

        if target_len <= base {
            source.release(cache, l1_block.ptrs[i]);
            l1_block.ptrs[i] = 0;
        } else {
            l2_block.write(cache, l1_block.ptrs[i]);
        }
    }

    if target_len <= doubly_threshold {
        source.release(cache, disk.doubly_indirect);
        disk.doubly_indirect = 0;
    } else {
        l1_block.write(cache, disk.doubly_indirect);
    }

    Ok(())
}

/// Resolves a byte offset within an inode's data to the sector that holds
/// it, or `None` if that slot was never allocated (a sparse hole) or the
/// offset lies past the inode's current length.
///
/// Spec leaves the sparse-hole case open; this crate answers it with a
/// sentinel rather than panicking, since a hole can only be observed from
/// inside `read_at`/`write_at`, which already treat it as "no data here".
pub(crate) fn byte_to_sector(cache: &Cache, inode_sector: SectorNum, pos: usize) -> Option<SectorNum> {
    let disk = DiskInode::read(cache, inode_sector);
    if pos >= disk.length() {
        return None;
    }

    if pos < NDIRECT * SECTOR_SIZE {
        let sector = disk.direct[pos / SECTOR_SIZE];
        return if sector == 0 { None } else { Some(sector) };
    }

    let indirect_threshold = NDIRECT * SECTOR_SIZE;
    if pos < indirect_threshold + PTRS_PER_BLOCK * SECTOR_SIZE {
        if disk.indirect == 0 {
            return None;
        }
        let block = PointerBlock::read(cache, disk.indirect);
        let idx = (pos - indirect_threshold) / SECTOR_SIZE;
        let sector = block.ptrs[idx];
        return if sector == 0 { None } else { Some(sector) };
    }

    if disk.doubly_indirect == 0 {
        return None;
    }
    let doubly_threshold = indirect_threshold + PTRS_PER_BLOCK * SECTOR_SIZE;
    let extra = (pos - doubly_threshold) / SECTOR_SIZE;
    let l1 = PointerBlock::read(cache, disk.doubly_indirect);
    let l1_sector = l1.ptrs[extra / PTRS_PER_BLOCK];
    if l1_sector == 0 {
        return None;
    }
    let l2 = PointerBlock::read(cache, l1_sector);
    let sector = l2.ptrs[extra % PTRS_PER_BLOCK];
    if sector == 0 {
        None
    } else {
        Some(sector)
    }
}

struct InodeMeta {
    open_cnt: usize,
    removed: bool,
    deny_write_cnt: usize,
}

/// An open inode: the in-memory handle, shared by every caller with the
/// sector open. Everything but `sector` lives behind `meta` or `rw`, per the
/// locking hierarchy: `meta` (open counts, resize, type/length reads) is
/// always acquired before `rw` (which only serializes `read_at`/`write_at`
/// against each other and against a growing resize).
pub struct Inode {
    sector: SectorNum,
    meta: Mutex<InodeMeta>,
    rw: Mutex<()>,
    /// Reserved for callers that want to block until `deny_write_cnt` drops
    /// back to zero; nothing in this crate's syscall surface currently waits
    /// on it, `allow_write` notifies it regardless so such a caller could be
    /// added without touching the locking here.
    write_cv: Condvar,
}

impl Inode {
    fn new(sector: SectorNum) -> Self {
        Self {
            sector,
            meta: Mutex::new(InodeMeta {
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
            }),
            rw: Mutex::new(()),
            write_cv: Condvar::new(),
        }
    }

    pub fn inumber(&self) -> SectorNum {
        self.sector
    }

    pub fn file_type(&self, cache: &Cache) -> FileType {
        let _meta = self.meta.lock().unwrap();
        DiskInode::read(cache, self.sector).file_type()
    }

    pub fn length(&self, cache: &Cache) -> usize {
        let _meta = self.meta.lock().unwrap();
        DiskInode::read(cache, self.sector).length()
    }

    pub fn open_cnt(&self) -> usize {
        self.meta.lock().unwrap().open_cnt
    }

    pub fn is_removed(&self) -> bool {
        self.meta.lock().unwrap().removed
    }

    pub fn mark_removed(&self) {
        self.meta.lock().unwrap().removed = true;
    }

    /// Registers one more logical opener of an inode the caller already
    /// holds a handle to, without going through the open-inode table.
    pub fn reopen(self: &Arc<Self>) -> Arc<Self> {
        self.meta.lock().unwrap().open_cnt += 1;
        self.clone()
    }

    pub fn deny_write(&self) {
        let mut meta = self.meta.lock().unwrap();
        meta.deny_write_cnt += 1;
        debug_assert!(meta.deny_write_cnt <= meta.open_cnt);
    }

    pub fn allow_write(&self) {
        let mut meta = self.meta.lock().unwrap();
        debug_assert!(meta.deny_write_cnt > 0);
        meta.deny_write_cnt -= 1;
        if meta.deny_write_cnt == 0 {
            self.write_cv.notify_all();
        }
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes actually read, which is short only at end-of-file.
    pub fn read_at(&self, cache: &Cache, buf: &mut [u8], offset: usize) -> usize {
        let _rw = self.rw.lock().unwrap();
        let length = self.length(cache);
        let mut done = 0;
        let mut pos = offset;
        while done < buf.len() && pos < length {
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - done)
                .min(SECTOR_SIZE - sector_ofs)
                .min(length - pos);
            match byte_to_sector(cache, self.sector, pos) {
                Some(sector) => cache.read_offset(sector, &mut buf[done..done + chunk], sector_ofs, chunk),
                None => buf[done..done + chunk].iter_mut().for_each(|b| *b = 0),
            }
            done += chunk;
            pos += chunk;
        }
        done
    }

    /// Writes `buf` starting at `offset`, growing the inode first if the
    /// write extends past its current length. Returns `Ok(0)` without
    /// writing anything if writes are currently denied.
    pub fn write_at(
        &self,
        cache: &Cache,
        source: &dyn SectorSource,
        buf: &[u8],
        offset: usize,
    ) -> FsResult<usize> {
        {
            let meta = self.meta.lock().unwrap();
            if meta.deny_write_cnt > 0 {
                return Ok(0);
            }
        }
        let _rw = self.rw.lock().unwrap();
        let needed = offset + buf.len();
        {
            let _meta = self.meta.lock().unwrap();
            let mut disk = DiskInode::read(cache, self.sector);
            if needed > disk.length() {
                resize(&mut disk, cache, source, needed)?;
                disk.write(cache, self.sector);
            }
        }
        let mut done = 0;
        let mut pos = offset;
        while done < buf.len() {
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - done).min(SECTOR_SIZE - sector_ofs);
            let sector = byte_to_sector(cache, self.sector, pos)
                .expect("write_at resized the inode, every slot up to `needed` is allocated");
            cache.write_offset(sector, &buf[done..done + chunk], sector_ofs, chunk);
            done += chunk;
            pos += chunk;
        }
        Ok(done)
    }
}

/// Creates a brand-new on-disk inode at `sector` with `length` bytes of
/// zeroed data already allocated.
pub fn create(
    cache: &Cache,
    source: &dyn SectorSource,
    sector: SectorNum,
    length: usize,
    file_type: FileType,
) -> FsResult<()> {
    let mut disk = DiskInode::zeroed(file_type);
    resize(&mut disk, cache, source, length)?;
    disk.write(cache, sector);
    Ok(())
}

/// The open-inode table: one [`Inode`] handle per sector currently open
/// anywhere, so two opens of the same file see the same in-memory state.
/// Guarded by one lock, acquired before any individual
/// inode's own locks.
pub struct InodeTable {
    open: Mutex<BTreeMap<SectorNum, Arc<Inode>>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens `sector`, reusing the existing in-memory inode if one is
    /// already open, and bumping its open count either way.
    pub fn open(&self, sector: SectorNum) -> Arc<Inode> {
        let mut open = self.open.lock().unwrap();
        if let Some(existing) = open.get(&sector) {
            existing.meta.lock().unwrap().open_cnt += 1;
            return existing.clone();
        }
        let inode = Arc::new(Inode::new(sector));
        open.insert(sector, inode.clone());
        inode
    }

    /// Drops one logical opener of `inode`. When the count reaches zero the
    /// inode leaves the table; if it had also been marked removed, its
    /// blocks and its own sector are freed.
    pub fn close(&self, inode: &Arc<Inode>, cache: &Cache, source: &dyn SectorSource) {
        let destroy = {
            let mut meta = inode.meta.lock().unwrap();
            meta.open_cnt -= 1;
            meta.open_cnt == 0
        };
        if !destroy {
            return;
        }
        self.open.lock().unwrap().remove(&inode.sector);
        if inode.is_removed() {
            let mut disk = DiskInode::read(cache, inode.sector);
            resize(&mut disk, cache, source, 0).expect("freeing a removed inode's blocks cannot fail");
            source.release(cache, inode.sector);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
