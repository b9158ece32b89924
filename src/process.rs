//! The syscall surface: one [`Process`] per client, each with its own file
//! descriptor table and current working directory.
//!
//! The reserved-descriptor console dispatch splits file descriptors from
//! the two standard streams.

use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::directory;
use crate::error::{FsError, FsResult};
use crate::fd::{FdEntry, FdTable};
use crate::inode::{FileType, Inode};
use crate::param::ROOT_DIR_SECTOR;
use crate::FileSystem;

/// Where descriptors 0/1/2 actually go. A process with no console attached
/// (the default) treats reads as always-empty and writes as discarded,
/// which is enough for tests that never touch stdio. Stdin and stdout/stderr
/// are separate methods, not one shared read/write pair, because the
/// syscall table treats them as distinct streams: writing to fd 0 and
/// reading from fd 1 or 2 are both invalid, not merely no-ops.
pub trait Console: Send {
    fn read_stdin(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let _ = buf;
        Ok(0)
    }

    fn write_stdout(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn write_stderr(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }
}

struct NullConsole;
impl Console for NullConsole {}

/// Connects a process's standard streams to the host's own stdio.
pub struct StdioConsole;
impl Console for StdioConsole {
    fn read_stdin(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::stdin().read(buf)
    }

    fn write_stdout(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        Ok(buf.len())
    }

    fn write_stderr(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        Ok(buf.len())
    }
}

/// One client of the file system: its own descriptor table and current
/// working directory, each behind its own lock so unrelated fds (or a
/// `chdir` racing a `read`) don't serialize on each other.
pub struct Process {
    fds: Mutex<FdTable>,
    cwd: Mutex<Option<Arc<Inode>>>,
    console: Mutex<Box<dyn Console>>,
}

impl Process {
    pub fn new() -> Self {
        Self {
            fds: Mutex::new(FdTable::new()),
            cwd: Mutex::new(None),
            console: Mutex::new(Box::new(NullConsole)),
        }
    }

    pub fn with_console(console: Box<dyn Console>) -> Self {
        Self {
            fds: Mutex::new(FdTable::new()),
            cwd: Mutex::new(None),
            console: Mutex::new(console),
        }
    }

    fn cwd_inode(&self) -> Option<Arc<Inode>> {
        self.cwd.lock().unwrap().clone()
    }

    /// Creates a new file at `path`, pre-sized to `initial_size` bytes of
    /// zeroed data, and leaves it unopened.
    pub fn create(&self, fs: &FileSystem, path: &str, initial_size: usize) -> FsResult<()> {
        let cwd = self.cwd_inode();
        let (parent, name) = crate::path::resolve_parent_and_name(fs, cwd.as_ref(), path)?;
        let result = (|| {
            let sector = fs.freemap().allocate(fs.cache())?;
            // Undoes the allocation unless `defuse`d, so a failure further
            // down this closure (directory full, name taken) can't leak the
            // sector back into use without a matching directory entry.
            let rollback = scopeguard::guard(sector, |sector| fs.freemap().release(fs.cache(), sector));
            crate::inode::create(fs.cache(), fs.freemap(), sector, initial_size, FileType::File)?;
            directory::add(&parent, fs.cache(), fs.freemap(), name, sector)?;
            scopeguard::ScopeGuard::into_inner(rollback);
            Ok(())
        })();
        crate::path::close(fs, &parent);
        result
    }

    /// Unlinks `path`. The inode is only actually freed once every open
    /// handle to it is closed (deferred delete).
    pub fn remove(&self, fs: &FileSystem, path: &str) -> FsResult<()> {
        let cwd = self.cwd_inode();
        let (parent, name) = crate::path::resolve_parent_and_name(fs, cwd.as_ref(), path)?;
        let result = (|| {
            let sector = directory::lookup(&parent, fs.cache(), name)?;
            let target = fs.inodes().open(sector);
            if target.file_type(fs.cache()) == FileType::Directory {
                let is_cwd = cwd.as_ref().map(|c| c.inumber()) == Some(sector);
                if sector == ROOT_DIR_SECTOR || is_cwd || !directory::is_empty(&target, fs.cache()) {
                    crate::path::close(fs, &target);
                    return Err(FsError::DirectoryNotRemovable);
                }
            }
            let removed = directory::remove(&parent, fs.cache(), fs.freemap(), name);
            if removed.is_ok() {
                target.mark_removed();
            }
            crate::path::close(fs, &target);
            removed
        })();
        crate::path::close(fs, &parent);
        result
    }

    /// Opens `path` and returns its descriptor.
    pub fn open(&self, fs: &FileSystem, path: &str) -> FsResult<usize> {
        let cwd = self.cwd_inode();
        let inode = crate::path::resolve(fs, cwd.as_ref(), path)?;
        if inode.is_removed() {
            crate::path::close(fs, &inode);
            return Err(FsError::NotFound);
        }
        let for_rollback = inode.clone();
        let entry = match inode.file_type(fs.cache()) {
            FileType::File => FdEntry::File { inode, pos: 0 },
            FileType::Directory => FdEntry::Dir { inode, pos: 0 },
        };
        let alloc_result = self.fds.lock().unwrap().alloc(entry);
        match alloc_result {
            Ok(fd) => Ok(fd),
            Err(e) => {
                // The fd table is full: the entry built above was dropped
                // along with its Arc clone, but `for_rollback` still shares
                // the same inode's open count, so it closes correctly.
                crate::path::close(fs, &for_rollback);
                Err(e)
            }
        }
    }

    pub fn close(&self, fs: &FileSystem, fd: usize) -> FsResult<()> {
        let entry = self.fds.lock().unwrap().take(fd)?;
        if let Some(inode) = entry.inode() {
            crate::path::close(fs, inode);
        }
        Ok(())
    }

    pub fn read(&self, fs: &FileSystem, fd: usize, buf: &mut [u8]) -> FsResult<usize> {
        if fd == crate::param::STDIN_FILENO {
            return Ok(self.console.lock().unwrap().read_stdin(buf).unwrap_or(0));
        }
        if fd == crate::param::STDOUT_FILENO || fd == crate::param::STDERR_FILENO {
            return Err(FsError::BadDescriptor);
        }
        let mut fds = self.fds.lock().unwrap();
        match fds.get_mut(fd)? {
            FdEntry::File { inode, pos } => {
                let read = inode.read_at(fs.cache(), buf, *pos);
                *pos += read;
                Ok(read)
            }
            FdEntry::Dir { .. } | FdEntry::Console => Err(FsError::BadDescriptor),
        }
    }

    pub fn write(&self, fs: &FileSystem, fd: usize, buf: &[u8]) -> FsResult<usize> {
        if fd == crate::param::STDOUT_FILENO {
            return Ok(self.console.lock().unwrap().write_stdout(buf).unwrap_or(0));
        }
        if fd == crate::param::STDERR_FILENO {
            return Ok(self.console.lock().unwrap().write_stderr(buf).unwrap_or(0));
        }
        if fd == crate::param::STDIN_FILENO {
            return Err(FsError::BadDescriptor);
        }
        let mut fds = self.fds.lock().unwrap();
        match fds.get_mut(fd)? {
            FdEntry::File { inode, pos } => {
                let written = inode.write_at(fs.cache(), fs.freemap(), buf, *pos)?;
                *pos += written;
                Ok(written)
            }
            FdEntry::Dir { .. } | FdEntry::Console => Err(FsError::BadDescriptor),
        }
    }

    pub fn seek(&self, fd: usize, offset: usize) -> FsResult<()> {
        let mut fds = self.fds.lock().unwrap();
        match fds.get_mut(fd)? {
            FdEntry::File { pos, .. } => {
                *pos = offset;
                Ok(())
            }
            _ => Err(FsError::BadDescriptor),
        }
    }

    pub fn tell(&self, fd: usize) -> FsResult<usize> {
        let fds = self.fds.lock().unwrap();
        match fds.get(fd)? {
            FdEntry::File { pos, .. } => Ok(*pos),
            _ => Err(FsError::BadDescriptor),
        }
    }

    pub fn filesize(&self, fs: &FileSystem, fd: usize) -> FsResult<usize> {
        let fds = self.fds.lock().unwrap();
        match fds.get(fd)? {
            FdEntry::File { inode, .. } => Ok(inode.length(fs.cache())),
            _ => Err(FsError::BadDescriptor),
        }
    }

    pub fn isdir(&self, fd: usize) -> FsResult<bool> {
        let fds = self.fds.lock().unwrap();
        Ok(matches!(fds.get(fd)?, FdEntry::Dir { .. }))
    }

    pub fn inumber(&self, fd: usize) -> FsResult<u32> {
        let fds = self.fds.lock().unwrap();
        match fds.get(fd)? {
            FdEntry::File { inode, .. } | FdEntry::Dir { inode, .. } => Ok(inode.inumber()),
            FdEntry::Console => Err(FsError::BadDescriptor),
        }
    }

    pub fn mkdir(&self, fs: &FileSystem, path: &str) -> FsResult<()> {
        let cwd = self.cwd_inode();
        let (parent, name) = crate::path::resolve_parent_and_name(fs, cwd.as_ref(), path)?;
        let result = (|| {
            let sector = fs.freemap().allocate(fs.cache())?;
            // Before the new directory inode exists, rollback is a plain
            // free-map release; after `directory::create` has given it `.`
            // and `..` entries (and so data blocks of its own), rollback has
            // to go through `mark_removed` + close so those blocks are
            // freed too. The guard is rearmed with the right closure at
            // that point rather than composed from two separate guards.
            let rollback = scopeguard::guard(sector, |sector| fs.freemap().release(fs.cache(), sector));
            directory::create(
                fs.cache(),
                fs.freemap(),
                sector,
                parent.inumber(),
                crate::param::INITIAL_DIR_ENTRIES,
            )?;
            scopeguard::ScopeGuard::into_inner(rollback);
            let rollback = scopeguard::guard(sector, |sector| {
                let removed_inode = fs.inodes().open(sector);
                removed_inode.mark_removed();
                crate::path::close(fs, &removed_inode);
            });
            directory::add(&parent, fs.cache(), fs.freemap(), name, sector)?;
            scopeguard::ScopeGuard::into_inner(rollback);
            Ok(())
        })();
        crate::path::close(fs, &parent);
        result
    }

    pub fn chdir(&self, fs: &FileSystem, path: &str) -> FsResult<()> {
        let cwd = self.cwd_inode();
        let inode = crate::path::resolve(fs, cwd.as_ref(), path)?;
        if inode.file_type(fs.cache()) != FileType::Directory {
            crate::path::close(fs, &inode);
            return Err(FsError::NotFound);
        }
        let mut slot = self.cwd.lock().unwrap();
        if let Some(old) = slot.take() {
            crate::path::close(fs, &old);
        }
        *slot = Some(inode);
        Ok(())
    }

    /// Reads the next child entry from a directory fd, advancing its
    /// cursor. `.` and `..` are never reported.
    pub fn readdir(&self, fs: &FileSystem, fd: usize) -> FsResult<Option<String>> {
        let mut fds = self.fds.lock().unwrap();
        match fds.get_mut(fd)? {
            FdEntry::Dir { inode, pos } => Ok(directory::readdir(inode, fs.cache(), pos).map(|(name, _)| name)),
            _ => Err(FsError::BadDescriptor),
        }
    }
}

/// ABI-shaped wrappers with a flat, non-recoverable return convention:
/// `-1`/`false` on any failure, never a typed error. Argument fetch from
/// user memory and the `eax`-ordinal dispatch that would sit in front of
/// these in a real kernel are out of scope here; each method already takes
/// an ordinary, validated Rust argument, as if that marshalling had already
/// happened.
impl Process {
    pub fn sys_create(&self, fs: &FileSystem, name: &str, initial_size: usize) -> bool {
        self.create(fs, name, initial_size).is_ok()
    }

    pub fn sys_remove(&self, fs: &FileSystem, name: &str) -> bool {
        self.remove(fs, name).is_ok()
    }

    pub fn sys_open(&self, fs: &FileSystem, name: &str) -> i64 {
        self.open(fs, name).map(|fd| fd as i64).unwrap_or(-1)
    }

    pub fn sys_close(&self, fs: &FileSystem, fd: i64) -> bool {
        fd_arg(fd).map(|fd| self.close(fs, fd).is_ok()).unwrap_or(false)
    }

    pub fn sys_read(&self, fs: &FileSystem, fd: i64, buf: &mut [u8]) -> i64 {
        fd_arg(fd)
            .and_then(|fd| self.read(fs, fd, buf).ok())
            .map(|n| n as i64)
            .unwrap_or(-1)
    }

    pub fn sys_write(&self, fs: &FileSystem, fd: i64, buf: &[u8]) -> i64 {
        fd_arg(fd)
            .and_then(|fd| self.write(fs, fd, buf).ok())
            .map(|n| n as i64)
            .unwrap_or(-1)
    }

    pub fn sys_seek(&self, fd: i64, offset: usize) -> bool {
        fd_arg(fd).map(|fd| self.seek(fd, offset).is_ok()).unwrap_or(false)
    }

    pub fn sys_tell(&self, fd: i64) -> i64 {
        fd_arg(fd).and_then(|fd| self.tell(fd).ok()).map(|n| n as i64).unwrap_or(-1)
    }

    pub fn sys_filesize(&self, fs: &FileSystem, fd: i64) -> i64 {
        fd_arg(fd)
            .and_then(|fd| self.filesize(fs, fd).ok())
            .map(|n| n as i64)
            .unwrap_or(-1)
    }

    pub fn sys_isdir(&self, fd: i64) -> bool {
        fd_arg(fd).and_then(|fd| self.isdir(fd).ok()).unwrap_or(false)
    }

    pub fn sys_mkdir(&self, fs: &FileSystem, path: &str) -> bool {
        self.mkdir(fs, path).is_ok()
    }

    pub fn sys_chdir(&self, fs: &FileSystem, path: &str) -> bool {
        self.chdir(fs, path).is_ok()
    }

    /// Writes the next entry's name into `out` and returns `true`, or
    /// returns `false` at end of directory. `out` stands in for the
    /// user-memory buffer the real ABI would copy into.
    pub fn sys_readdir(&self, fs: &FileSystem, fd: i64, out: &mut String) -> bool {
        match fd_arg(fd).and_then(|fd| self.readdir(fs, fd).ok()) {
            Some(Some(name)) => {
                *out = name;
                true
            }
            _ => false,
        }
    }

    pub fn sys_inumber(&self, fd: i64) -> i64 {
        fd_arg(fd).and_then(|fd| self.inumber(fd).ok()).map(|n| n as i64).unwrap_or(-1)
    }
}

/// A negative fd is always invalid; the rest of the methods above work in
/// `usize` terms once past this one ABI-boundary check.
fn fd_arg(fd: i64) -> Option<usize> {
    usize::try_from(fd).ok()
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}
