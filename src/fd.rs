//! A process's file descriptor table.
//!
//! A fixed-size slot array with an explicit kind tag per entry; the
//! reserved console slots and the 128-entry size come straight from the
//! syscall surface this crate exposes.

use std::sync::Arc;

use array_macro::array;

use crate::error::{FsError, FsResult};
use crate::inode::Inode;
use crate::param::{MAX_FS_OPEN, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};

/// What a single descriptor refers to.
pub enum FdEntry {
    /// One of the three reserved slots, dispatched to the process's
    /// [`crate::process::Console`] rather than to the file system.
    Console,
    File { inode: Arc<Inode>, pos: usize },
    Dir { inode: Arc<Inode>, pos: usize },
}

impl FdEntry {
    pub fn inode(&self) -> Option<&Arc<Inode>> {
        match self {
            FdEntry::Console => None,
            FdEntry::File { inode, .. } | FdEntry::Dir { inode, .. } => Some(inode),
        }
    }
}

/// Fixed 128-slot table, with slots 0-2 permanently reserved for the
/// console. `alloc` scans forward from `next_open_fd`, wrapping around past
/// the end of the table back to the first non-reserved slot, rather than
/// always rescanning from slot 3.
pub struct FdTable {
    slots: [Option<FdEntry>; MAX_FS_OPEN],
    next_open_fd: usize,
    open_files_cnt: usize,
}

impl FdTable {
    pub fn new() -> Self {
        let mut slots: [Option<FdEntry>; MAX_FS_OPEN] = array![None; MAX_FS_OPEN];
        slots[STDIN_FILENO] = Some(FdEntry::Console);
        slots[STDOUT_FILENO] = Some(FdEntry::Console);
        slots[STDERR_FILENO] = Some(FdEntry::Console);
        Self {
            slots,
            next_open_fd: STDERR_FILENO + 1,
            open_files_cnt: STDERR_FILENO + 1,
        }
    }

    /// Installs `entry` in the next free slot above the reserved console
    /// descriptors, starting the scan at the rotating hint and wrapping
    /// around.
    pub fn alloc(&mut self, entry: FdEntry) -> FsResult<usize> {
        let reserved = STDERR_FILENO + 1;
        let span = self.slots.len() - reserved;
        for step in 0..span {
            let idx = reserved + (self.next_open_fd - reserved + step) % span;
            if self.slots[idx].is_none() {
                self.slots[idx] = Some(entry);
                self.next_open_fd = reserved + (idx - reserved + 1) % span;
                self.open_files_cnt += 1;
                return Ok(idx);
            }
        }
        Err(FsError::TooManyOpenFiles)
    }

    pub fn get(&self, fd: usize) -> FsResult<&FdEntry> {
        self.slots.get(fd).and_then(|s| s.as_ref()).ok_or(FsError::BadDescriptor)
    }

    pub fn get_mut(&mut self, fd: usize) -> FsResult<&mut FdEntry> {
        self.slots.get_mut(fd).and_then(|s| s.as_mut()).ok_or(FsError::BadDescriptor)
    }

    /// Removes and returns the entry at `fd`. Fails on an unallocated slot
    /// or on one of the reserved console descriptors, which are never
    /// individually closed.
    pub fn take(&mut self, fd: usize) -> FsResult<FdEntry> {
        if fd <= STDERR_FILENO {
            return Err(FsError::BadDescriptor);
        }
        let entry = self.slots.get_mut(fd).and_then(|s| s.take()).ok_or(FsError::BadDescriptor)?;
        self.open_files_cnt -= 1;
        Ok(entry)
    }

    /// Number of occupied slots, including the three reserved console ones.
    pub fn open_files_cnt(&self) -> usize {
        self.open_files_cnt
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_slots_are_preallocated() {
        let table = FdTable::new();
        assert!(matches!(table.get(STDIN_FILENO).unwrap(), FdEntry::Console));
        assert!(matches!(table.get(STDOUT_FILENO).unwrap(), FdEntry::Console));
        assert!(matches!(table.get(STDERR_FILENO).unwrap(), FdEntry::Console));
    }

    #[test]
    fn alloc_skips_reserved_slots_and_rotates_forward() {
        let mut table = FdTable::new();
        let fd = table
            .alloc(FdEntry::File {
                inode: unreachable_inode_for_test(),
                pos: 0,
            })
            .unwrap();
        assert_eq!(fd, STDERR_FILENO + 1);
        assert_eq!(table.open_files_cnt(), STDERR_FILENO + 2);

        // The hint has moved on, so the next alloc does not immediately
        // reclaim the slot `fd` just vacated.
        table.take(fd).unwrap();
        assert_eq!(table.open_files_cnt(), STDERR_FILENO + 1);
        let fd2 = table
            .alloc(FdEntry::File {
                inode: unreachable_inode_for_test(),
                pos: 0,
            })
            .unwrap();
        assert_eq!(fd2, STDERR_FILENO + 2);
    }

    #[test]
    fn alloc_wraps_around_after_filling_the_table() {
        let mut table = FdTable::new();
        let span = MAX_FS_OPEN - (STDERR_FILENO + 1);
        let mut fds = Vec::new();
        for _ in 0..span {
            fds.push(
                table
                    .alloc(FdEntry::File {
                        inode: unreachable_inode_for_test(),
                        pos: 0,
                    })
                    .unwrap(),
            );
        }
        assert_eq!(table.open_files_cnt(), MAX_FS_OPEN);
        assert_eq!(
            table
                .alloc(FdEntry::File {
                    inode: unreachable_inode_for_test(),
                    pos: 0,
                })
                .unwrap_err(),
            FsError::TooManyOpenFiles
        );

        table.take(fds[0]).unwrap();
        let reused = table
            .alloc(FdEntry::File {
                inode: unreachable_inode_for_test(),
                pos: 0,
            })
            .unwrap();
        assert_eq!(reused, fds[0], "wraparound must land on the one freed slot");
    }

    #[test]
    fn take_rejects_reserved_descriptors() {
        let mut table = FdTable::new();
        assert_eq!(table.take(STDOUT_FILENO).unwrap_err(), FsError::BadDescriptor);
    }

    /// A throwaway inode handle for tests that only care about fd-slot
    /// bookkeeping, never about the inode's own behavior.
    fn unreachable_inode_for_test() -> Arc<Inode> {
        use crate::inode::InodeTable;
        InodeTable::new().open(0)
    }
}
