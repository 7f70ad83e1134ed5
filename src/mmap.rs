use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU8};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{Error, Result};

enum Map {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

pub struct MmapFile {
    file: File,
    map: Map,
    len: usize,
}

impl MmapFile {
    pub fn create_new(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Config("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            file,
            map: Map::ReadWrite(map),
            len,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Corrupt("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            file,
            map: Map::ReadWrite(map),
            len,
        })
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Corrupt("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map(&file)? };
        Ok(Self {
            file,
            map: Map::ReadOnly(map),
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Map::ReadWrite(map) => map,
            Map::ReadOnly(map) => map,
        }
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        match &mut self.map {
            Map::ReadWrite(map) => Ok(&mut map[offset..end]),
            Map::ReadOnly(_) => Err(Error::Misuse("mapping is read-only")),
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.map, Map::ReadWrite(_))
    }

    /// Atomic view of the byte at `offset`. Stores through the returned
    /// reference require a writable mapping.
    pub fn atomic_u8(&self, offset: usize) -> Result<&AtomicU8> {
        if offset >= self.len {
            return Err(Error::Corrupt("atomic byte out of bounds"));
        }
        let ptr = unsafe { self.as_slice().as_ptr().add(offset) };
        Ok(unsafe { &*(ptr as *const AtomicU8) })
    }

    /// Atomic view of the 8-byte word at `offset`, which must be 8-aligned
    /// within the mapping (the mapping itself is page-aligned).
    pub fn atomic_i64(&self, offset: usize) -> Result<&AtomicI64> {
        let end = offset
            .checked_add(8)
            .ok_or(Error::Corrupt("atomic word out of bounds"))?;
        if end > self.len || offset % 8 != 0 {
            return Err(Error::Corrupt("atomic word out of bounds"));
        }
        let ptr = unsafe { self.as_slice().as_ptr().add(offset) };
        Ok(unsafe { &*(ptr as *const AtomicI64) })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        if let Map::ReadWrite(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        if let Map::ReadWrite(map) = &self.map {
            map.flush_range(offset, len)?;
        }
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        if let Map::ReadWrite(map) = &self.map {
            map.flush_async()?;
        }
        Ok(())
    }
}
