//! Storage backends for prefixdb.
//!
//! This module provides the `Storage` trait and implementations for
//! in-memory and file-based byte storage. A storage is a contiguous,
//! zero-indexed, growable sequence of bytes addressed by 64-bit offsets.

use crate::error::{Error, Result};

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use memmap2::Mmap;

/// Growable random-access byte storage.
///
/// Reads past the current length fail; writes past the current length extend
/// it, zero-filling any gap. All methods take `&self`; implementations use
/// interior mutability and callers serialize access.
pub trait Storage: Send + Sync + Any {
    /// Fill `buf` with the bytes at `[offset, offset + buf.len())`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at `offset`, extending the length if needed.
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current logical length in bytes.
    fn len(&self) -> u64;

    /// Whether the storage holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extend the length by `n` zero bytes; returns the previous length
    /// (the start of the reserved region).
    fn reserve(&self, n: u64) -> Result<u64>;

    /// Ensure all written bytes are persisted to durable media.
    fn flush(&self) -> Result<()>;

    /// Downcast to concrete type
    fn as_any(&self) -> &dyn Any;
}

impl Storage for Box<dyn Storage> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read(offset, buf)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write(offset, data)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }

    fn reserve(&self, n: u64) -> Result<u64> {
        (**self).reserve(n)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }

    fn as_any(&self) -> &dyn Any {
        (**self).as_any()
    }
}

/// In-memory byte storage
///
/// Holds all bytes in a single growable buffer. Contents are lost when the
/// storage is dropped; useful for tests and volatile databases.
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    /// Create a new, empty in-memory storage.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let end = offset as usize + buf.len();
        if end > data.len() {
            return Err(Error::OutOfBounds(format!(
                "read of {} bytes at offset {} exceeds length {}",
                buf.len(),
                offset,
                data.len()
            )));
        }
        buf.copy_from_slice(&data[offset as usize..end]);
        Ok(())
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write();
        let end = offset as usize + src.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(src);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn reserve(&self, n: u64) -> Result<u64> {
        let mut data = self.data.write();
        let old = data.len() as u64;
        data.resize(old as usize + n as usize, 0);
        Ok(old)
    }

    fn flush(&self) -> Result<()> {
        // Nothing to persist
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// File storage
// ============================================================================

/// File-backed byte storage
///
/// Wraps a single file opened read/write. Reads can be served from a shared
/// memory map when enabled; writes always go through the file handle, which
/// stays coherent with the map. The map is rebuilt on `flush` once the file
/// has grown past it.
pub struct FileStorage {
    file: Mutex<File>,
    length: AtomicU64,
    mmap: RwLock<Option<Mmap>>,
    use_mmap: bool,
}

impl FileStorage {
    /// Open or create a storage file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, use_mmap: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;

        let length = file.metadata()?.len();
        info!(
            "Opened storage file {:?} ({} bytes, mmap: {})",
            path.as_ref(),
            length,
            use_mmap
        );

        let storage = Self {
            file: Mutex::new(file),
            length: AtomicU64::new(length),
            mmap: RwLock::new(None),
            use_mmap,
        };
        if use_mmap && length > 0 {
            storage.remap()?;
        }
        Ok(storage)
    }

    fn remap(&self) -> Result<()> {
        let file = self.file.lock();
        let len = file.metadata()?.len();
        let mut mmap = self.mmap.write();
        *mmap = if len > 0 {
            Some(unsafe { Mmap::map(&*file)? })
        } else {
            None
        };
        debug!("Remapped storage file ({} bytes)", len);
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let length = self.length.load(Ordering::Acquire);
        let end = offset + buf.len() as u64;
        if end > length {
            return Err(Error::OutOfBounds(format!(
                "read of {} bytes at offset {} exceeds length {}",
                buf.len(),
                offset,
                length
            )));
        }

        // The map can lag behind the file after growth; fall back to the
        // file handle for any range it does not cover.
        {
            let mmap = self.mmap.read();
            if let Some(map) = mmap.as_ref() {
                if end as usize <= map.len() {
                    buf.copy_from_slice(&map[offset as usize..end as usize]);
                    return Ok(());
                }
            }
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(src)?;
        self.length
            .fetch_max(offset + src.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    fn reserve(&self, n: u64) -> Result<u64> {
        let file = self.file.lock();
        let old = self.length.load(Ordering::Acquire);
        file.set_len(old + n)?;
        self.length.store(old + n, Ordering::Release);
        Ok(old)
    }

    fn flush(&self) -> Result<()> {
        {
            let file = self.file.lock();
            file.sync_all()?;
        }
        if self.use_mmap {
            let stale = {
                let mmap = self.mmap.read();
                mmap.as_ref().map(|m| m.len() as u64) != Some(self.len())
            };
            if stale && self.len() > 0 {
                self.remap()?;
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
