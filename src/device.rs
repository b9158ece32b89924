//! The raw sector device the buffer cache fronts.
//!
//! The block device is an external collaborator; this trait is the
//! boundary to it. Device I/O errors are not modeled at the cache layer;
//! implementations should only fail on genuine out-of-range access, which
//! callers never trigger through the cache.

use std::io;
use std::sync::{Arc, Mutex};

use crate::param::SECTOR_SIZE;

pub type SectorNum = u32;

/// One sector's worth of bytes.
pub type Sector = [u8; SECTOR_SIZE];

pub trait BlockDevice: Send {
    /// Total number of addressable sectors on this device.
    fn sector_count(&self) -> SectorNum;

    /// Read sector `sector` into `buf` in full.
    fn read_sector(&mut self, sector: SectorNum, buf: &mut Sector) -> io::Result<()>;

    /// Write `buf` to sector `sector` in full.
    fn write_sector(&mut self, sector: SectorNum, buf: &Sector) -> io::Result<()>;
}

/// An in-memory device, for tests and for anything that doesn't want a real
/// file backing the file system.
pub struct MemDevice {
    sectors: Vec<Sector>,
}

impl MemDevice {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: vec![[0u8; SECTOR_SIZE]; sector_count],
        }
    }
}

impl BlockDevice for MemDevice {
    fn sector_count(&self) -> SectorNum {
        self.sectors.len() as SectorNum
    }

    fn read_sector(&mut self, sector: SectorNum, buf: &mut Sector) -> io::Result<()> {
        buf.copy_from_slice(&self.sectors[sector as usize]);
        Ok(())
    }

    fn write_sector(&mut self, sector: SectorNum, buf: &Sector) -> io::Result<()> {
        self.sectors[sector as usize].copy_from_slice(buf);
        Ok(())
    }
}

/// An in-memory device with a cloneable handle to its backing store, so a
/// test can hold onto the raw bytes after moving the device proper into a
/// [`crate::cache::Cache`]. Used to check cache transparency: a full flush
/// followed by a bypass read of the device must match the in-cache view.
#[derive(Clone)]
pub struct SharedMemDevice {
    sectors: Arc<Mutex<Vec<Sector>>>,
}

impl SharedMemDevice {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: Arc::new(Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count])),
        }
    }

    /// Reads a sector directly from the backing store, bypassing any cache.
    pub fn bypass_read(&self, sector: SectorNum) -> Sector {
        self.sectors.lock().unwrap()[sector as usize]
    }
}

impl BlockDevice for SharedMemDevice {
    fn sector_count(&self) -> SectorNum {
        self.sectors.lock().unwrap().len() as SectorNum
    }

    fn read_sector(&mut self, sector: SectorNum, buf: &mut Sector) -> io::Result<()> {
        buf.copy_from_slice(&self.sectors.lock().unwrap()[sector as usize]);
        Ok(())
    }

    fn write_sector(&mut self, sector: SectorNum, buf: &Sector) -> io::Result<()> {
        self.sectors.lock().unwrap()[sector as usize].copy_from_slice(buf);
        Ok(())
    }
}

/// A real file used as the backing store, sized in whole sectors.
///
/// Useful for end-to-end tests that want `FileSystem::shutdown` to actually
/// persist to something outside the process.
pub struct FileDevice {
    file: std::fs::File,
    sector_count: SectorNum,
}

impl FileDevice {
    pub fn open(file: std::fs::File, sector_count: SectorNum) -> io::Result<Self> {
        file.set_len((sector_count as u64) * (SECTOR_SIZE as u64))?;
        Ok(Self { file, sector_count })
    }
}

impl BlockDevice for FileDevice {
    fn sector_count(&self) -> SectorNum {
        self.sector_count
    }

    fn read_sector(&mut self, sector: SectorNum, buf: &mut Sector) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        self.file
            .seek(SeekFrom::Start((sector as u64) * (SECTOR_SIZE as u64)))?;
        self.file.read_exact(buf)
    }

    fn write_sector(&mut self, sector: SectorNum, buf: &Sector) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        self.file
            .seek(SeekFrom::Start((sector as u64) * (SECTOR_SIZE as u64)))?;
        self.file.write_all(buf)
    }
}
