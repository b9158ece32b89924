//! Directory contents: a flat array of fixed-size entries inside a
//! directory inode's data, one entry per `.`, `..`, or child name.

use arrayvec::ArrayString;
use itertools::Itertools;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::Cache;
use crate::device::SectorNum;
use crate::error::{FsError, FsResult};
use crate::inode::{self, FileType, Inode, SectorSource};
use crate::param::NAME_MAX;

const ENTRY_SIZE: usize = std::mem::size_of::<DirEntry>();

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DirEntry {
    inode_sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

impl DirEntry {
    fn empty() -> Self {
        Self {
            inode_sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }

    fn name_str(&self) -> ArrayString<NAME_MAX> {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        let s = std::str::from_utf8(&self.name[..len]).expect("directory entry names are ASCII");
        ArrayString::from(s).expect("name already validated to fit NAME_MAX")
    }

    fn set_name(&mut self, name: &str) -> FsResult<()> {
        let name = ArrayString::<NAME_MAX>::from(name).map_err(|_| FsError::InvalidName)?;
        if name.is_empty() {
            return Err(FsError::InvalidName);
        }
        self.name = [0; NAME_MAX + 1];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }
}

fn read_entry(inode: &Inode, cache: &Cache, index: usize) -> Option<DirEntry> {
    let mut raw = [0u8; ENTRY_SIZE];
    let read = inode.read_at(cache, &mut raw, index * ENTRY_SIZE);
    if read < ENTRY_SIZE {
        return None;
    }
    Some(DirEntry::read_from(&raw[..]).expect("entry-sized buffer always parses"))
}

fn write_entry(inode: &Inode, cache: &Cache, source: &dyn SectorSource, index: usize, entry: &DirEntry) -> FsResult<()> {
    inode.write_at(cache, source, entry.as_bytes(), index * ENTRY_SIZE)?;
    Ok(())
}

fn entry_count(inode: &Inode, cache: &Cache) -> usize {
    inode.length(cache) / ENTRY_SIZE
}

/// Creates a new, empty directory inode at `sector`, seeded with `.`
/// pointing at itself and `..` pointing at `parent_sector`. The root
/// directory is created with `parent_sector == sector`, so its `..` points
/// at itself too.
pub fn create(
    cache: &Cache,
    source: &dyn SectorSource,
    sector: SectorNum,
    parent_sector: SectorNum,
    initial_entries: usize,
) -> FsResult<()> {
    inode::create(cache, source, sector, initial_entries * ENTRY_SIZE, FileType::Directory)?;
    let table = crate::inode::InodeTable::new();
    let dir = table.open(sector);

    let mut dot = DirEntry::empty();
    dot.set_name(".")?;
    dot.inode_sector = sector;
    dot.in_use = 1;
    write_entry(&dir, cache, source, 0, &dot)?;

    let mut dotdot = DirEntry::empty();
    dotdot.set_name("..")?;
    dotdot.inode_sector = parent_sector;
    dotdot.in_use = 1;
    write_entry(&dir, cache, source, 1, &dotdot)?;

    table.close(&dir, cache, source);
    Ok(())
}

/// Looks up `name` in `dir`, returning the sector of the inode it names.
pub fn lookup(dir: &Inode, cache: &Cache, name: &str) -> FsResult<SectorNum> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(FsError::InvalidName);
    }
    let (_, entry) = (0..entry_count(dir, cache))
        .filter_map(|i| read_entry(dir, cache, i))
        .find_position(|entry| entry.in_use != 0 && entry.name_str().as_str() == name)
        .ok_or(FsError::NotFound)?;
    Ok(entry.inode_sector)
}

/// Adds `name -> sector` to `dir`, reusing a vacated slot if one exists and
/// appending a fresh entry otherwise. Fails if `name` already exists.
pub fn add(
    dir: &Inode,
    cache: &Cache,
    source: &dyn SectorSource,
    name: &str,
    sector: SectorNum,
) -> FsResult<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(FsError::InvalidName);
    }
    let count = entry_count(dir, cache);
    let mut free_slot = None;
    for i in 0..count {
        if let Some(entry) = read_entry(dir, cache, i) {
            if entry.in_use != 0 {
                if entry.name_str().as_str() == name {
                    return Err(FsError::InvalidName);
                }
            } else if free_slot.is_none() {
                free_slot = Some(i);
            }
        }
    }

    let mut entry = DirEntry::empty();
    entry.set_name(name)?;
    entry.inode_sector = sector;
    entry.in_use = 1;
    let index = free_slot.unwrap_or(count);
    write_entry(dir, cache, source, index, &entry)
}

/// Clears the entry named `name`. Fails if it isn't present.
pub fn remove(dir: &Inode, cache: &Cache, source: &dyn SectorSource, name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(FsError::InvalidName);
    }
    for i in 0..entry_count(dir, cache) {
        if let Some(entry) = read_entry(dir, cache, i) {
            if entry.in_use != 0 && entry.name_str().as_str() == name {
                write_entry(dir, cache, source, i, &DirEntry::empty())?;
                return Ok(());
            }
        }
    }
    Err(FsError::NotFound)
}

/// True if `dir` has no entries besides `.` and `..`.
pub fn is_empty(dir: &Inode, cache: &Cache) -> bool {
    for i in 0..entry_count(dir, cache) {
        if let Some(entry) = read_entry(dir, cache, i) {
            if entry.in_use != 0 && entry.name_str().as_str() != "." && entry.name_str().as_str() != ".." {
                return false;
            }
        }
    }
    true
}

/// Returns the next in-use entry at or after the byte cursor `pos`, and
/// advances `pos` past it. `.` and `..` are skipped, matching the syscall
/// surface's `readdir`, which only reports real children.
pub fn readdir(dir: &Inode, cache: &Cache, pos: &mut usize) -> Option<(String, SectorNum)> {
    loop {
        let index = *pos / ENTRY_SIZE;
        if index >= entry_count(dir, cache) {
            return None;
        }
        *pos += ENTRY_SIZE;
        if let Some(entry) = read_entry(dir, cache, index) {
            if entry.in_use != 0 && entry.name_str().as_str() != "." && entry.name_str().as_str() != ".." {
                return Some((entry.name_str().to_string(), entry.inode_sector));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::device::MemDevice;
    use crate::freemap::FreeMap;
    use crate::inode::InodeTable;

    fn setup(sectors: usize) -> (Cache, FreeMap) {
        let cache = Cache::new(Box::new(MemDevice::new(sectors)), 16);
        let freemap = FreeMap::new_reserving(sectors, &[]);
        (cache, freemap)
    }

    #[test]
    fn root_dot_dot_point_at_self() {
        let (cache, freemap) = setup(64);
        create(&cache, &freemap, 1, 1, 16).unwrap();
        let table = InodeTable::new();
        let root = table.open(1);
        assert_eq!(lookup(&root, &cache, ".").unwrap(), 1);
        assert_eq!(lookup(&root, &cache, "..").unwrap(), 1);
        assert!(is_empty(&root, &cache));
    }

    #[test]
    fn add_lookup_remove_round_trip() {
        let (cache, freemap) = setup(64);
        create(&cache, &freemap, 1, 1, 16).unwrap();
        let table = InodeTable::new();
        let root = table.open(1);

        add(&root, &cache, &freemap, "hello.txt", 5).unwrap();
        assert_eq!(lookup(&root, &cache, "hello.txt").unwrap(), 5);
        assert!(!is_empty(&root, &cache));

        assert_eq!(
            add(&root, &cache, &freemap, "hello.txt", 9).unwrap_err(),
            FsError::InvalidName
        );

        remove(&root, &cache, &freemap, "hello.txt").unwrap();
        assert_eq!(lookup(&root, &cache, "hello.txt").unwrap_err(), FsError::NotFound);
        assert!(is_empty(&root, &cache));
    }

    #[test]
    fn readdir_skips_dot_entries_and_gaps() {
        let (cache, freemap) = setup(64);
        create(&cache, &freemap, 1, 1, 16).unwrap();
        let table = InodeTable::new();
        let root = table.open(1);
        add(&root, &cache, &freemap, "a", 10).unwrap();
        add(&root, &cache, &freemap, "b", 11).unwrap();
        remove(&root, &cache, &freemap, "a").unwrap();
        add(&root, &cache, &freemap, "c", 12).unwrap();

        let mut pos = 0;
        let mut names = Vec::new();
        while let Some((name, _)) = readdir(&root, &cache, &mut pos) {
            names.push(name);
        }
        names.sort();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
    }
}
