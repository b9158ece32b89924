//! A block-addressed file system core: a write-back sector cache, an
//! extent-tree inode layer on top of it, path resolution and directory
//! operations, and a process-facing file descriptor syscall surface.
//!
//! `FileSystem` is the single point of assembly. It owns the cache, the
//! free-map, and the open-inode table; callers drive it through one
//! [`Process`](process::Process) per client.

mod cache;
mod device;
mod directory;
mod error;
mod fd;
mod freemap;
mod inode;
mod param;
mod path;
mod process;

pub use cache::Cache;
pub use device::{BlockDevice, FileDevice, MemDevice, Sector, SectorNum};
pub use error::{FsError, FsResult};
pub use inode::FileType;
pub use param::*;
pub use process::{Console, Process, StdioConsole};

use freemap::FreeMap;
use inode::InodeTable;

/// An assembled, mounted file system over one block device.
///
/// Use [`FileSystem::format`] on a fresh device and [`FileSystem::mount`] on
/// one that already holds a formatted file system; both leave the cache
/// warm and the free-map loaded. [`FileSystem::shutdown`] flushes every
/// dirty sector back to the device.
pub struct FileSystem {
    cache: Cache,
    freemap: FreeMap,
    inodes: InodeTable,
}

impl FileSystem {
    /// Lays down a fresh file system on `device`: a free-map inode at
    /// [`FREE_MAP_SECTOR`], sized to cover every sector on the device, and
    /// an empty root directory at [`ROOT_DIR_SECTOR`] whose `..` points at
    /// itself.
    pub fn format(device: Box<dyn BlockDevice>) -> FsResult<Self> {
        let total_sectors = device.sector_count() as usize;
        let cache = Cache::new(device, param::NBUF);
        let freemap = FreeMap::new_reserving(total_sectors, &[param::FREE_MAP_SECTOR, param::ROOT_DIR_SECTOR]);

        let bitmap_bytes = (total_sectors + 7) / 8;
        inode::create(&cache, &freemap, param::FREE_MAP_SECTOR, bitmap_bytes, FileType::File)?;
        directory::create(
            &cache,
            &freemap,
            param::ROOT_DIR_SECTOR,
            param::ROOT_DIR_SECTOR,
            param::INITIAL_DIR_ENTRIES,
        )?;

        let inodes = InodeTable::new();
        let free_map_inode = inodes.open(param::FREE_MAP_SECTOR);
        freemap.attach(&cache, free_map_inode);

        log::info!("formatted file system over {} sectors", total_sectors);
        Ok(Self { cache, freemap, inodes })
    }

    /// Mounts a file system that was previously formatted and written to
    /// `device`.
    pub fn mount(device: Box<dyn BlockDevice>) -> Self {
        let total_sectors = device.sector_count() as usize;
        let cache = Cache::new(device, param::NBUF);
        let inodes = InodeTable::new();
        let free_map_inode = inodes.open(param::FREE_MAP_SECTOR);
        let freemap = FreeMap::load(&cache, free_map_inode, total_sectors);
        log::info!("mounted file system over {} sectors", total_sectors);
        Self { cache, freemap, inodes }
    }

    /// Flushes every dirty cache entry back to the device. The `FileSystem`
    /// remains usable afterward.
    pub fn shutdown(&self) {
        self.cache.flush();
    }

    /// Creates a fresh [`Process`] bound to no console and the root working
    /// directory. One per client of this file system.
    pub fn new_process(&self) -> Process {
        Process::new()
    }

    pub(crate) fn cache(&self) -> &Cache {
        &self.cache
    }

    pub(crate) fn freemap(&self) -> &FreeMap {
        &self.freemap
    }

    pub(crate) fn inodes(&self) -> &InodeTable {
        &self.inodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn formatted(sectors: usize) -> FileSystem {
        let _ = env_logger::builder().is_test(true).try_init();
        FileSystem::format(Box::new(MemDevice::new(sectors))).unwrap()
    }

    #[test]
    fn format_then_basic_file_workflow() {
        let fs = formatted(256);
        let proc = Process::new();

        proc.create(&fs, "/greeting.txt", 0).unwrap();
        let fd = proc.open(&fs, "/greeting.txt").unwrap();
        let written = proc.write(&fs, fd, b"hello").unwrap();
        assert_eq!(written, 5);
        proc.seek(fd, 0).unwrap();
        let mut buf = [0u8; 5];
        let read = proc.read(&fs, fd, &mut buf).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");
        proc.close(&fs, fd).unwrap();
    }

    #[test]
    fn create_with_nonzero_initial_size_preallocates_zeros() {
        let fs = formatted(64);
        let proc = Process::new();
        proc.create(&fs, "/presized", 100).unwrap();
        let fd = proc.open(&fs, "/presized").unwrap();
        assert_eq!(proc.filesize(&fs, fd).unwrap(), 100);
        let mut buf = vec![0xFFu8; 100];
        assert_eq!(proc.read(&fs, fd, &mut buf).unwrap(), 100);
        assert_eq!(buf, vec![0u8; 100], "a presized file reads back as zeros");
        proc.close(&fs, fd).unwrap();
    }

    #[test]
    fn mkdir_chdir_and_relative_create() {
        let fs = formatted(256);
        let proc = Process::new();

        proc.mkdir(&fs, "/sub").unwrap();
        proc.chdir(&fs, "/sub").unwrap();
        proc.create(&fs, "inside.txt", 0).unwrap();

        let fd = proc.open(&fs, "inside.txt").unwrap();
        assert!(!proc.isdir(fd).unwrap());
        proc.close(&fs, fd).unwrap();

        let dir_fd = proc.open(&fs, "/sub").unwrap();
        assert!(proc.isdir(dir_fd).unwrap());
        let entry = proc.readdir(&fs, dir_fd).unwrap();
        assert_eq!(entry.as_deref(), Some("inside.txt"));
        assert_eq!(proc.readdir(&fs, dir_fd).unwrap(), None);
        proc.close(&fs, dir_fd).unwrap();
    }

    #[test]
    fn remove_is_deferred_while_open() {
        let fs = formatted(256);
        let proc = Process::new();
        proc.create(&fs, "/doomed.txt", 0).unwrap();
        let fd = proc.open(&fs, "/doomed.txt").unwrap();
        proc.remove(&fs, "/doomed.txt").unwrap();

        // Still readable/writable through the open descriptor...
        proc.write(&fs, fd, b"still here").unwrap();
        // ...but no longer nameable.
        assert_eq!(proc.open(&fs, "/doomed.txt").unwrap_err(), FsError::NotFound);

        proc.close(&fs, fd).unwrap();
    }

    #[test]
    fn growing_past_direct_blocks_allocates_indirect_only() {
        let fs = formatted(2048);
        let proc = Process::new();
        proc.create(&fs, "/big", 0).unwrap();
        let fd = proc.open(&fs, "/big").unwrap();

        let data = vec![0u8; NDIRECT * SECTOR_SIZE + 1];
        let written = proc.write(&fs, fd, &data).unwrap();
        assert_eq!(written, data.len());
        assert_eq!(proc.filesize(&fs, fd).unwrap(), data.len());

        let sector = proc.inumber(fd).unwrap();
        let disk = crate::inode::DiskInode::read(fs.cache(), sector);
        assert_ne!(disk.indirect_ptr(), 0, "one byte past the direct range must allocate the indirect block");
        assert_eq!(
            disk.doubly_indirect_ptr(),
            0,
            "a file this small must never touch the doubly-indirect block"
        );
        proc.close(&fs, fd).unwrap();
    }

    #[test]
    fn two_opens_of_the_same_path_share_inode_state() {
        let fs = formatted(256);
        let proc = Process::new();
        proc.create(&fs, "/shared.txt", 0).unwrap();

        let fd1 = proc.open(&fs, "/shared.txt").unwrap();
        let fd2 = proc.open(&fs, "/shared.txt").unwrap();
        assert_eq!(proc.inumber(fd1).unwrap(), proc.inumber(fd2).unwrap());

        proc.write(&fs, fd1, b"abc").unwrap();
        proc.seek(fd2, 0).unwrap();
        let mut buf = [0u8; 3];
        let read = proc.read(&fs, fd2, &mut buf).unwrap();
        assert_eq!(read, 3);
        assert_eq!(&buf, b"abc");

        proc.close(&fs, fd1).unwrap();
        proc.close(&fs, fd2).unwrap();
    }

    #[test]
    fn cannot_remove_nonempty_or_root_or_cwd() {
        let fs = formatted(256);
        let proc = Process::new();
        assert_eq!(proc.remove(&fs, "/").unwrap_err(), FsError::DirectoryNotRemovable);

        proc.mkdir(&fs, "/d").unwrap();
        proc.create(&fs, "/d/f", 0).unwrap();
        assert_eq!(proc.remove(&fs, "/d").unwrap_err(), FsError::DirectoryNotRemovable);

        proc.chdir(&fs, "/d").unwrap();
        proc.remove(&fs, "/d/f").unwrap();
        assert_eq!(proc.remove(&fs, "/d").unwrap_err(), FsError::DirectoryNotRemovable);
    }

    #[test]
    fn shutdown_persists_across_remount() {
        use crate::device::SharedMemDevice;

        let shared = SharedMemDevice::new(256);
        {
            let fs = FileSystem::format(Box::new(shared.clone())).unwrap();
            let proc = Process::new();
            proc.create(&fs, "/persisted.txt", 0).unwrap();
            let fd = proc.open(&fs, "/persisted.txt").unwrap();
            proc.write(&fs, fd, b"durable").unwrap();
            proc.close(&fs, fd).unwrap();
            fs.shutdown();
        }

        let fs = FileSystem::mount(Box::new(shared));
        let proc = Process::new();
        let fd = proc.open(&fs, "/persisted.txt").unwrap();
        let mut buf = [0u8; 7];
        proc.read(&fs, fd, &mut buf).unwrap();
        assert_eq!(&buf, b"durable");
    }

    /// Exercises `FileDevice` against a real temp file rather than an
    /// in-memory one, so `shutdown` has somewhere outside this process to
    /// actually write to.
    #[test]
    fn shutdown_persists_to_a_real_file() {
        use crate::device::FileDevice;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sectors = 256;

        {
            let file = tmp.reopen().unwrap();
            let device = FileDevice::open(file, sectors).unwrap();
            let fs = FileSystem::format(Box::new(device)).unwrap();
            let proc = Process::new();
            proc.mkdir(&fs, "/d").unwrap();
            proc.create(&fs, "/d/a.txt", 0).unwrap();
            let fd = proc.open(&fs, "/d/a.txt").unwrap();
            proc.write(&fs, fd, b"on disk").unwrap();
            proc.close(&fs, fd).unwrap();
            fs.shutdown();
        }

        let file = tmp.reopen().unwrap();
        let device = FileDevice::open(file, sectors).unwrap();
        let fs = FileSystem::mount(Box::new(device));
        let proc = Process::new();
        let fd = proc.open(&fs, "/d/a.txt").unwrap();
        let mut buf = [0u8; 7];
        proc.read(&fs, fd, &mut buf).unwrap();
        assert_eq!(&buf, b"on disk");
    }
}
