//! Write-back page cache over a byte storage.
//!
//! The cache decomposes the storage into fixed-size pages and serves reads
//! and writes from in-memory page buffers. Mutations only touch the backing
//! storage on [`PageCache::flush`], which writes dirty pages back in
//! ascending offset order. Bytes appended past the backing length live in
//! dirty pages until flushed; the cache's logical length is the maximum of
//! the backing length and the highest appended byte. There is no eviction:
//! pages are retained until flush.

use crate::error::{Error, Result};
use crate::storage::Storage;

use parking_lot::Mutex;
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use log::debug;

/// Default page size in bytes
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// A cached page mirroring storage bytes `[index * size, (index + 1) * size)`.
struct Page {
    data: Vec<u8>,
    /// Number of valid bytes; equals the page size except possibly for the
    /// last page, which may hold bytes past the original storage length.
    used: usize,
    dirty: bool,
}

struct CacheState {
    pages: HashMap<u64, Page>,
    /// Highest appended byte + 1; the logical length is
    /// `max(length, storage.len())`.
    length: u64,
}

/// Write-back page cache over a [`Storage`].
///
/// Implements [`Storage`] itself, so caches can be layered over any backing
/// store and passed wherever a storage is expected.
pub struct PageCache<S: Storage> {
    storage: S,
    page_size: u64,
    state: Mutex<CacheState>,
}

impl<S: Storage> PageCache<S> {
    /// Create a cache over `storage` with the given page size.
    pub fn new(storage: S, page_size: usize) -> Self {
        let length = storage.len();
        Self {
            storage,
            page_size: page_size as u64,
            state: Mutex::new(CacheState {
                pages: HashMap::new(),
                length,
            }),
        }
    }

    /// The backing storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Consume the cache, returning the backing storage. Unflushed pages are
    /// discarded.
    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    /// Number of pages currently resident in the cache.
    pub fn cached_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Current logical length: backing length or highest appended byte + 1,
    /// whichever is greater.
    pub fn len(&self) -> u64 {
        self.state.lock().length.max(self.storage.len())
    }

    /// Whether the cache holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `buf.len()` bytes starting at `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let length = state.length.max(self.storage.len());
        if offset + buf.len() as u64 > length {
            return Err(Error::OutOfBounds(format!(
                "read of {} bytes at offset {} exceeds length {}",
                buf.len(),
                offset,
                length
            )));
        }
        self.read_locked(&mut state, offset, buf)
    }

    /// Write `data` starting at `offset`, extending the logical length if
    /// needed. The backing storage is untouched until [`flush`](Self::flush).
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.write_locked(&mut state, offset, data)
    }

    /// Append `data` at the current logical length, returning the offset it
    /// was written at.
    pub fn write_to_end(&self, data: &[u8]) -> Result<u64> {
        let mut state = self.state.lock();
        let offset = state.length.max(self.storage.len());
        self.write_locked(&mut state, offset, data)?;
        Ok(offset)
    }

    /// Extend the logical length by `n` zero bytes; returns the previous
    /// length. The backing storage grows on flush.
    pub fn reserve(&self, n: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let old = state.length.max(self.storage.len());
        state.length = old + n;
        Ok(old)
    }

    /// Write dirty pages back to the backing storage in ascending offset
    /// order, then flush the backing storage.
    ///
    /// Pages written successfully are marked clean as flushing proceeds, so
    /// a failed flush leaves exactly the unwritten pages dirty.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();

        let mut dirty: Vec<u64> = state
            .pages
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(&index, _)| index)
            .collect();
        dirty.sort_unstable();
        let flushed = dirty.len();

        for index in dirty {
            if let Some(page) = state.pages.get(&index) {
                self.storage.write(index * self.page_size, &page.data[..page.used])?;
            }
            if let Some(page) = state.pages.get_mut(&index) {
                page.dirty = false;
            }
        }

        // Cover any reserved-but-unwritten tail so that the backing length
        // matches the logical length.
        let length = state.length.max(self.storage.len());
        let backing = self.storage.len();
        if backing < length {
            self.storage.reserve(length - backing)?;
        }

        self.storage.flush()?;
        debug!("Flushed {} dirty pages ({} bytes total)", flushed, length);
        Ok(())
    }

    fn read_locked(&self, state: &mut CacheState, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut pos = offset;
        let mut filled = 0;
        while filled < buf.len() {
            let index = pos / self.page_size;
            let in_page = (pos % self.page_size) as usize;
            let n = (self.page_size as usize - in_page).min(buf.len() - filled);
            let page = self.load_page(state, index)?;
            buf[filled..filled + n].copy_from_slice(&page.data[in_page..in_page + n]);
            pos += n as u64;
            filled += n;
        }
        Ok(())
    }

    fn write_locked(&self, state: &mut CacheState, offset: u64, data: &[u8]) -> Result<()> {
        let mut pos = offset;
        let mut written = 0;
        while written < data.len() {
            let index = pos / self.page_size;
            let in_page = (pos % self.page_size) as usize;
            let n = (self.page_size as usize - in_page).min(data.len() - written);
            let page = self.load_page(state, index)?;
            page.data[in_page..in_page + n].copy_from_slice(&data[written..written + n]);
            page.used = page.used.max(in_page + n);
            page.dirty = true;
            pos += n as u64;
            written += n;
        }
        state.length = state.length.max(offset + data.len() as u64);
        Ok(())
    }

    /// Fetch a page into the cache, reading it from the backing storage. A
    /// short read at the tail is allowed when the page crosses the backing
    /// length; pages entirely past it start out zeroed.
    fn load_page<'a>(&self, state: &'a mut CacheState, index: u64) -> Result<&'a mut Page> {
        match state.pages.entry(index) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut data = vec![0u8; self.page_size as usize];
                let start = index * self.page_size;
                let backing = self.storage.len();
                let mut used = 0;
                if start < backing {
                    used = (backing - start).min(self.page_size) as usize;
                    self.storage.read(start, &mut data[..used])?;
                }
                Ok(entry.insert(Page {
                    data,
                    used,
                    dirty: false,
                }))
            }
        }
    }
}

impl<S: Storage> Storage for PageCache<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        PageCache::read(self, offset, buf)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        PageCache::write(self, offset, data)
    }

    fn len(&self) -> u64 {
        PageCache::len(self)
    }

    fn reserve(&self, n: u64) -> Result<u64> {
        PageCache::reserve(self, n)
    }

    fn flush(&self) -> Result<()> {
        PageCache::flush(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
