//! On-disk radix trie engine.
//!
//! The trie lives entirely inside a byte storage, addressed by 64-bit
//! little-endian byte offsets; offset 0 is the null pointer. All node access
//! goes through a write-back [`PageCache`], so nothing touches the backing
//! storage until [`Trie::flush`].
//!
//! # File format
//!
//! The first 24 bytes hold the root record; the remainder is a heap of nodes
//! at monotonically growing offsets. Relocated nodes leave their previous
//! bytes behind as dead space.
//!
//! ```text
//! root record (offset 0, 24 bytes):
//!   [0..8]   pointer to the entry node
//!   [8..16]  pointer to the generation node
//!   [16..24] record count
//!
//! generation node (9 bytes):
//!   [0]      tag = 3
//!   [1..9]   generation counter, bumped on every mutation
//!
//! internal node (13 + 9 * capacity bytes):
//!   [0]      tag = 1
//!   [1..9]   link-to-value pointer (leaf for the key ending at this depth)
//!   [9..11]  child count (u16)
//!   [11..13] child slot capacity (u16, starts at 4, doubles on relocation)
//!   [13..]   `capacity` entries of { discriminant byte, child pointer },
//!            the first `count` populated and sorted ascending by byte,
//!            the rest zero
//!
//! leaf (13 + suffix length + value capacity bytes):
//!   [0]      tag = 2
//!   [1..5]   key suffix length (u32)
//!   [5..9]   value length (u32)
//!   [9..13]  value capacity (u32, >= value length)
//!   [13..]   key suffix bytes, then value bytes, then slack
//! ```
//!
//! A leaf reached through a child entry at depth `d` stores the key suffix
//! `key[d + 1..]`; a link-to-value leaf stores an empty suffix. Growing a
//! node past its slack relocates it to the end of the storage and rewrites
//! the parent's pointer, which is why every mutating traversal keeps an
//! explicit path stack.

use crate::cache::PageCache;
use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::{CacheStats, Config};

use byteorder::{ByteOrder, LittleEndian};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info};

const TAG_INTERNAL: u8 = 1;
const TAG_LEAF: u8 = 2;
const TAG_GENERATION: u8 = 3;

const NULL_PTR: u64 = 0;
const ROOT_RECORD_LEN: usize = 24;
const GENERATION_NODE_LEN: usize = 9;
const INTERNAL_HEADER_LEN: u64 = 13;
const LEAF_HEADER_LEN: u64 = 13;
const CHILD_ENTRY_LEN: u64 = 9;

const INITIAL_CHILD_CAPACITY: u16 = 4;
const MAX_CHILD_CAPACITY: u16 = 256;
const MIN_VALUE_SLACK: u32 = 4;

const MAX_POOLED_BUFFERS: usize = 16;

/// A located record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Full key bytes
    pub key: Vec<u8>,
    /// Offset of the record's leaf node
    pub pointer: u64,
    /// Offset of the value bytes inside the leaf
    pub value_pointer: u64,
    /// Length of the value in bytes
    pub value_length: u32,
}

/// Result of a best-prefix walk: the deepest node reached along the needle's
/// byte path, and the record found there, if the position holds a value.
#[derive(Debug, Clone)]
pub struct Match {
    /// Offset of the deepest node reached
    pub pointer: u64,
    /// Number of needle bytes consumed
    pub depth: usize,
    /// The value-bearing record at the final position, if any
    pub row: Option<Row>,
}

impl Match {
    /// Whether the walk landed on a value.
    pub fn has_link(&self) -> bool {
        self.row.is_some()
    }
}

/// Decoded root record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootNode {
    /// Pointer to the entry internal node
    pub entry: u64,
    /// Pointer to the generation node
    pub generation_pointer: u64,
    /// Number of reachable records
    pub record_count: u64,
}

/// Reusable byte-buffer allocator for node encoding and scratch reads.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Get a zeroed buffer of exactly `len` bytes.
    pub fn acquire(&self, len: usize) -> Vec<u8> {
        let mut buf = self.free.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Return a buffer to the pool for reuse.
    pub fn release(&self, mut buf: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_BUFFERS {
            buf.clear();
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

struct TrieMeta {
    entry: u64,
    generation_pointer: u64,
    generation: u64,
    record_count: u64,
}

struct LookupCache {
    rows: LruCache<Vec<u8>, Row>,
    generation: u64,
}

/// Decoded internal node header and child entries.
struct InternalNode {
    offset: u64,
    link: u64,
    capacity: u16,
    entries: Vec<(u8, u64)>,
}

impl InternalNode {
    fn find_index(&self, byte: u8) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&byte, |&(b, _)| b)
    }

    fn find(&self, byte: u8) -> Option<u64> {
        self.find_index(byte).ok().map(|i| self.entries[i].1)
    }
}

/// Decoded leaf header. The suffix and value bytes stay in storage and are
/// read separately.
struct LeafNode {
    offset: u64,
    suffix_len: u32,
    value_length: u32,
    value_capacity: u32,
}

impl LeafNode {
    fn suffix_pointer(&self) -> u64 {
        self.offset + LEAF_HEADER_LEN
    }

    fn value_pointer(&self) -> u64 {
        self.offset + LEAF_HEADER_LEN + self.suffix_len as u64
    }
}

/// Persistent ordered key-value trie over a byte storage.
///
/// All operations take `&self`; the handle is internally locked but callers
/// must serialize mutations against reads and enumeration (single-writer
/// discipline). Durability requires an explicit [`flush`](Self::flush).
pub struct Trie<S: Storage> {
    cache: PageCache<S>,
    meta: Mutex<TrieMeta>,
    consistency_check: AtomicBool,
    lookup: Mutex<Option<LookupCache>>,
    lookup_capacity: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    pool: BufferPool,
}

impl<S: Storage> Trie<S> {
    /// Open a trie over `storage`, initializing an empty one if the storage
    /// is fresh.
    pub fn open(storage: S, config: &Config) -> Result<Self> {
        let trie = Self {
            cache: PageCache::new(storage, config.page_size),
            meta: Mutex::new(TrieMeta {
                entry: NULL_PTR,
                generation_pointer: NULL_PTR,
                generation: 0,
                record_count: 0,
            }),
            consistency_check: AtomicBool::new(config.consistency_check),
            lookup: Mutex::new(None),
            lookup_capacity: NonZeroUsize::new(config.cache_size)
                .unwrap_or(NonZeroUsize::new(1000).unwrap()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            pool: BufferPool::new(),
        };
        trie.read_root()?;
        Ok(trie)
    }

    /// Re-read the root record from storage.
    pub fn read_root_node(&self) -> Result<RootNode> {
        let mut buf = [0u8; ROOT_RECORD_LEN];
        self.cache.read(0, &mut buf)?;
        Ok(RootNode {
            entry: LittleEndian::read_u64(&buf[0..8]),
            generation_pointer: LittleEndian::read_u64(&buf[8..16]),
            record_count: LittleEndian::read_u64(&buf[16..24]),
        })
    }

    /// Number of records in the trie.
    pub fn record_count(&self) -> u64 {
        self.meta.lock().record_count
    }

    /// Read the generation counter from its node.
    pub fn generation(&self) -> Result<u64> {
        let pointer = self.meta.lock().generation_pointer;
        self.read_generation_at(pointer)
    }

    /// Enable or disable read-back verification after each write.
    pub fn set_consistency_check(&self, enabled: bool) {
        self.consistency_check.store(enabled, Ordering::Relaxed);
    }

    /// Enable the in-memory key lookup cache. Entries are keyed by the
    /// current generation; any mutation invalidates them.
    pub fn activate_cache(&self) {
        let generation = self.meta.lock().generation;
        *self.lookup.lock() = Some(LookupCache {
            rows: LruCache::new(self.lookup_capacity),
            generation,
        });
    }

    /// Lookup cache hit/miss statistics.
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// The trie's byte-buffer allocator.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Write all dirty pages back to the backing storage and flush it.
    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }

    /// Consume the trie, returning the backing storage. Unflushed writes are
    /// discarded.
    pub fn into_storage(self) -> S {
        self.cache.into_storage()
    }

    /// Look up the record for `key`.
    pub fn get_row(&self, key: &[u8]) -> Result<Option<Row>> {
        let (entry, generation) = {
            let meta = self.meta.lock();
            (meta.entry, meta.generation)
        };

        if let Some(lookup) = self.lookup.lock().as_mut() {
            if lookup.generation == generation {
                if let Some(row) = lookup.rows.get(key) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(row.clone()));
                }
            } else {
                lookup.rows.clear();
                lookup.generation = generation;
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        let row = self.walk(entry, key)?;
        if let Some(ref row) = row {
            if let Some(lookup) = self.lookup.lock().as_mut() {
                if lookup.generation == generation {
                    lookup.rows.put(key.to_vec(), row.clone());
                }
            }
        }
        Ok(row)
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.get_row(key)? {
            Some(row) => Ok(Some(self.read_value(&row)?)),
            None => Ok(None),
        }
    }

    /// Read the value bytes for a previously located row.
    pub fn read_value(&self, row: &Row) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; row.value_length as usize];
        self.cache.read(row.value_pointer, &mut buf)?;
        Ok(buf)
    }

    /// Insert or update a record.
    ///
    /// Values that still fit a node's slack are overwritten in place;
    /// anything larger relocates the node to the end of the storage and
    /// rewrites the parent's pointer. The record count changes only when a
    /// new key is created; the generation is bumped on every call.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > u32::MAX as usize {
            return Err(Error::InvalidInput("key too long".into()));
        }
        if value.len() > u32::MAX as usize {
            return Err(Error::InvalidInput("value too long".into()));
        }

        let mut meta = self.meta.lock();
        let mut path: Vec<(u64, usize)> = Vec::new();
        let mut node = self.read_internal(meta.entry)?;
        let mut depth = 0;
        let mut inserted = false;

        loop {
            if depth == key.len() {
                // The key terminates at this node
                if node.link == NULL_PTR {
                    let leaf = self.alloc_leaf(&[], value, 0)?;
                    self.write_ptr(node.offset + 1, leaf)?;
                    inserted = true;
                } else {
                    let leaf = self.read_link_leaf(node.link)?;
                    if let Some(moved) = self.overwrite_leaf_value(&leaf, value)? {
                        self.write_ptr(node.offset + 1, moved)?;
                    }
                }
                break;
            }
            let byte = key[depth];
            match node.find_index(byte) {
                Ok(idx) => {
                    let ptr = node.entries[idx].1;
                    match self.node_tag(ptr)? {
                        TAG_INTERNAL => {
                            path.push((node.offset, idx));
                            node = self.read_internal(ptr)?;
                            depth += 1;
                        }
                        TAG_LEAF => {
                            let leaf = self.read_leaf(ptr)?;
                            let rest = &key[depth + 1..];
                            if self.suffix_matches(&leaf, rest)? {
                                if let Some(moved) = self.overwrite_leaf_value(&leaf, value)? {
                                    self.write_child_ptr(node.offset, idx, moved)?;
                                }
                            } else {
                                let top = self.split_leaf(ptr, &leaf, rest, value)?;
                                self.write_child_ptr(node.offset, idx, top)?;
                                inserted = true;
                            }
                            break;
                        }
                        tag => {
                            return Err(Error::Corrupted(format!(
                                "unexpected node tag {} at offset {}",
                                tag, ptr
                            )))
                        }
                    }
                }
                Err(idx) => {
                    let leaf = self.alloc_leaf(&key[depth + 1..], value, 0)?;
                    self.insert_child(&node, &path, idx, byte, leaf, &mut meta)?;
                    inserted = true;
                    break;
                }
            }
        }

        if inserted {
            meta.record_count += 1;
        }
        meta.generation += 1;
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, meta.generation);
        self.cache.write(meta.generation_pointer + 1, &buf)?;
        self.write_root(&meta)?;
        drop(meta);

        if self.consistency_check.load(Ordering::Relaxed) {
            match self.get(key)? {
                Some(stored) if stored == value => {}
                _ => {
                    return Err(Error::Consistency(format!(
                        "record with key of {} bytes is not readable after write",
                        key.len()
                    )))
                }
            }
        }
        Ok(())
    }

    /// Walk the needle's byte path as deep as the trie allows.
    ///
    /// The result carries a [`Row`] iff the final position holds a value:
    /// the needle matches a stored key exactly, ends on a node with a
    /// link-to-value, or runs past a stored key that is a prefix of it.
    pub fn best_match(&self, needle: &[u8]) -> Result<Match> {
        let entry = self.meta.lock().entry;
        let mut node = self.read_internal(entry)?;
        let mut depth = 0;
        loop {
            if depth == needle.len() {
                let row = match node.link {
                    NULL_PTR => None,
                    link => {
                        let leaf = self.read_link_leaf(link)?;
                        Some(self.leaf_row(needle.to_vec(), &leaf))
                    }
                };
                return Ok(Match {
                    pointer: node.offset,
                    depth,
                    row,
                });
            }
            let ptr = match node.find(needle[depth]) {
                None => {
                    return Ok(Match {
                        pointer: node.offset,
                        depth,
                        row: None,
                    })
                }
                Some(ptr) => ptr,
            };
            match self.node_tag(ptr)? {
                TAG_INTERNAL => {
                    node = self.read_internal(ptr)?;
                    depth += 1;
                }
                TAG_LEAF => {
                    let leaf = self.read_leaf(ptr)?;
                    let suffix = self.read_leaf_suffix(&leaf)?;
                    let rest = &needle[depth + 1..];
                    let row = if rest.len() >= suffix.len() && rest[..suffix.len()] == suffix[..] {
                        let mut key = needle[..depth + 1].to_vec();
                        key.extend_from_slice(&suffix);
                        Some(self.leaf_row(key, &leaf))
                    } else {
                        None
                    };
                    return Ok(Match {
                        pointer: ptr,
                        depth: depth + 1,
                        row,
                    });
                }
                tag => {
                    return Err(Error::Corrupted(format!(
                        "unexpected node tag {} at offset {}",
                        tag, ptr
                    )))
                }
            }
        }
    }

    /// Enumerate all records whose key starts with `prefix`, lazily, in
    /// lexicographic key order.
    ///
    /// Value bytes are not fetched; use [`read_value`](Self::read_value) on
    /// the yielded rows. The iterator is invalidated by any mutation of the
    /// trie and yields an error if one happens underneath it.
    pub fn start_with(&self, prefix: &[u8]) -> Result<StartWith<'_, S>> {
        let (entry, generation) = {
            let meta = self.meta.lock();
            (meta.entry, meta.generation)
        };
        let mut iter = StartWith {
            trie: self,
            generation,
            path: Vec::new(),
            stack: Vec::new(),
            single: None,
            done: false,
        };

        let mut node = self.read_internal(entry)?;
        let mut depth = 0;
        loop {
            if depth == prefix.len() {
                iter.path = prefix.to_vec();
                let pop_to = iter.path.len();
                iter.stack.push(Frame {
                    node,
                    next_child: 0,
                    link_emitted: false,
                    pop_to,
                });
                return Ok(iter);
            }
            let ptr = match node.find(prefix[depth]) {
                None => {
                    iter.done = true;
                    return Ok(iter);
                }
                Some(ptr) => ptr,
            };
            match self.node_tag(ptr)? {
                TAG_INTERNAL => {
                    node = self.read_internal(ptr)?;
                    depth += 1;
                }
                TAG_LEAF => {
                    let leaf = self.read_leaf(ptr)?;
                    let suffix = self.read_leaf_suffix(&leaf)?;
                    let rest = &prefix[depth + 1..];
                    if suffix.len() >= rest.len() && suffix[..rest.len()] == *rest {
                        let mut key = prefix[..depth + 1].to_vec();
                        key.extend_from_slice(&suffix);
                        iter.single = Some(self.leaf_row(key, &leaf));
                    } else {
                        iter.done = true;
                    }
                    return Ok(iter);
                }
                tag => {
                    return Err(Error::Corrupted(format!(
                        "unexpected node tag {} at offset {}",
                        tag, ptr
                    )))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Root record and generation node
    // ------------------------------------------------------------------

    fn read_root(&self) -> Result<()> {
        let len = self.cache.len();
        let mut meta = self.meta.lock();
        if len == 0 {
            info!("Initializing empty trie");
            self.cache.write(0, &[0u8; ROOT_RECORD_LEN])?;
            meta.generation_pointer = self.alloc_generation_node()?;
            meta.entry = self.alloc_internal(NULL_PTR, &[], INITIAL_CHILD_CAPACITY)?;
            self.write_root(&meta)?;
            return Ok(());
        }
        if len < ROOT_RECORD_LEN as u64 {
            return Err(Error::Corrupted(format!(
                "storage of {} bytes is too short for a root record",
                len
            )));
        }
        let root = self.read_root_node()?;
        meta.entry = root.entry;
        meta.generation_pointer = root.generation_pointer;
        meta.record_count = root.record_count;
        if meta.generation_pointer == NULL_PTR {
            meta.generation_pointer = self.alloc_generation_node()?;
            self.write_root(&meta)?;
        }
        meta.generation = self.read_generation_at(meta.generation_pointer)?;
        if meta.entry == NULL_PTR {
            meta.entry = self.alloc_internal(NULL_PTR, &[], INITIAL_CHILD_CAPACITY)?;
            self.write_root(&meta)?;
        }
        Ok(())
    }

    fn write_root(&self, meta: &TrieMeta) -> Result<()> {
        let mut buf = [0u8; ROOT_RECORD_LEN];
        LittleEndian::write_u64(&mut buf[0..8], meta.entry);
        LittleEndian::write_u64(&mut buf[8..16], meta.generation_pointer);
        LittleEndian::write_u64(&mut buf[16..24], meta.record_count);
        self.cache.write(0, &buf)
    }

    fn alloc_generation_node(&self) -> Result<u64> {
        let mut buf = [0u8; GENERATION_NODE_LEN];
        buf[0] = TAG_GENERATION;
        self.cache.write_to_end(&buf)
    }

    fn read_generation_at(&self, pointer: u64) -> Result<u64> {
        if pointer == NULL_PTR {
            return Err(Error::Corrupted("null generation node pointer".into()));
        }
        let mut buf = [0u8; GENERATION_NODE_LEN];
        self.cache.read(pointer, &mut buf)?;
        if buf[0] != TAG_GENERATION {
            return Err(Error::Corrupted(format!(
                "expected generation tag at offset {}, found {}",
                pointer, buf[0]
            )));
        }
        Ok(LittleEndian::read_u64(&buf[1..9]))
    }

    // ------------------------------------------------------------------
    // Node decoding
    // ------------------------------------------------------------------

    fn node_tag(&self, pointer: u64) -> Result<u8> {
        if pointer == NULL_PTR {
            return Err(Error::Corrupted("null child pointer".into()));
        }
        let mut buf = [0u8; 1];
        self.cache.read(pointer, &mut buf)?;
        Ok(buf[0])
    }

    fn read_internal(&self, offset: u64) -> Result<InternalNode> {
        if offset == NULL_PTR {
            return Err(Error::Corrupted(
                "null pointer where an internal node was expected".into(),
            ));
        }
        let mut header = [0u8; INTERNAL_HEADER_LEN as usize];
        self.cache.read(offset, &mut header)?;
        if header[0] != TAG_INTERNAL {
            return Err(Error::Corrupted(format!(
                "expected internal tag at offset {}, found {}",
                offset, header[0]
            )));
        }
        let link = LittleEndian::read_u64(&header[1..9]);
        let count = LittleEndian::read_u16(&header[9..11]);
        let capacity = LittleEndian::read_u16(&header[11..13]);
        if capacity == 0 || capacity > MAX_CHILD_CAPACITY || count > capacity {
            return Err(Error::Corrupted(format!(
                "invalid child slot bookkeeping at offset {} ({}/{})",
                offset, count, capacity
            )));
        }

        let mut entries = Vec::with_capacity(count as usize);
        if count > 0 {
            let mut buf = self.pool.acquire(count as usize * CHILD_ENTRY_LEN as usize);
            self.cache.read(offset + INTERNAL_HEADER_LEN, &mut buf)?;
            for i in 0..count as usize {
                let at = i * CHILD_ENTRY_LEN as usize;
                entries.push((buf[at], LittleEndian::read_u64(&buf[at + 1..at + 9])));
            }
            self.pool.release(buf);
        }
        if entries.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
            return Err(Error::Corrupted(format!(
                "child entries not sorted at offset {}",
                offset
            )));
        }
        Ok(InternalNode {
            offset,
            link,
            capacity,
            entries,
        })
    }

    fn read_leaf(&self, offset: u64) -> Result<LeafNode> {
        if offset == NULL_PTR {
            return Err(Error::Corrupted(
                "null pointer where a leaf was expected".into(),
            ));
        }
        let mut header = [0u8; LEAF_HEADER_LEN as usize];
        self.cache.read(offset, &mut header)?;
        if header[0] != TAG_LEAF {
            return Err(Error::Corrupted(format!(
                "expected leaf tag at offset {}, found {}",
                offset, header[0]
            )));
        }
        let leaf = LeafNode {
            offset,
            suffix_len: LittleEndian::read_u32(&header[1..5]),
            value_length: LittleEndian::read_u32(&header[5..9]),
            value_capacity: LittleEndian::read_u32(&header[9..13]),
        };
        if leaf.value_length > leaf.value_capacity {
            return Err(Error::Corrupted(format!(
                "leaf value length {} exceeds capacity {} at offset {}",
                leaf.value_length, leaf.value_capacity, offset
            )));
        }
        Ok(leaf)
    }

    /// Read a leaf hanging off a link-to-value slot; its stored suffix must
    /// be empty.
    fn read_link_leaf(&self, offset: u64) -> Result<LeafNode> {
        let leaf = self.read_leaf(offset)?;
        if leaf.suffix_len != 0 {
            return Err(Error::Corrupted(format!(
                "link-to-value leaf at offset {} has a non-empty suffix",
                offset
            )));
        }
        Ok(leaf)
    }

    fn read_leaf_suffix(&self, leaf: &LeafNode) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; leaf.suffix_len as usize];
        self.cache.read(leaf.suffix_pointer(), &mut buf)?;
        Ok(buf)
    }

    fn read_leaf_value(&self, leaf: &LeafNode) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; leaf.value_length as usize];
        self.cache.read(leaf.value_pointer(), &mut buf)?;
        Ok(buf)
    }

    fn suffix_matches(&self, leaf: &LeafNode, expected: &[u8]) -> Result<bool> {
        if leaf.suffix_len as usize != expected.len() {
            return Ok(false);
        }
        if expected.is_empty() {
            return Ok(true);
        }
        let mut buf = self.pool.acquire(expected.len());
        self.cache.read(leaf.suffix_pointer(), &mut buf)?;
        let matches = buf[..] == *expected;
        self.pool.release(buf);
        Ok(matches)
    }

    fn leaf_row(&self, key: Vec<u8>, leaf: &LeafNode) -> Row {
        Row {
            key,
            pointer: leaf.offset,
            value_pointer: leaf.value_pointer(),
            value_length: leaf.value_length,
        }
    }

    // ------------------------------------------------------------------
    // Node allocation and mutation
    // ------------------------------------------------------------------

    fn alloc_internal(&self, link: u64, entries: &[(u8, u64)], capacity: u16) -> Result<u64> {
        let size = INTERNAL_HEADER_LEN as usize + capacity as usize * CHILD_ENTRY_LEN as usize;
        let mut buf = self.pool.acquire(size);
        buf[0] = TAG_INTERNAL;
        LittleEndian::write_u64(&mut buf[1..9], link);
        LittleEndian::write_u16(&mut buf[9..11], entries.len() as u16);
        LittleEndian::write_u16(&mut buf[11..13], capacity);
        for (i, &(byte, ptr)) in entries.iter().enumerate() {
            let at = INTERNAL_HEADER_LEN as usize + i * CHILD_ENTRY_LEN as usize;
            buf[at] = byte;
            LittleEndian::write_u64(&mut buf[at + 1..at + 9], ptr);
        }
        let offset = self.cache.write_to_end(&buf)?;
        self.pool.release(buf);
        Ok(offset)
    }

    fn alloc_leaf(&self, suffix: &[u8], value: &[u8], min_capacity: u32) -> Result<u64> {
        let value_length = value.len() as u32;
        let capacity = value_slack_capacity(value_length).max(min_capacity);
        let size = LEAF_HEADER_LEN as usize + suffix.len() + capacity as usize;
        let mut buf = self.pool.acquire(size);
        buf[0] = TAG_LEAF;
        LittleEndian::write_u32(&mut buf[1..5], suffix.len() as u32);
        LittleEndian::write_u32(&mut buf[5..9], value_length);
        LittleEndian::write_u32(&mut buf[9..13], capacity);
        let at = LEAF_HEADER_LEN as usize;
        buf[at..at + suffix.len()].copy_from_slice(suffix);
        buf[at + suffix.len()..at + suffix.len() + value.len()].copy_from_slice(value);
        let offset = self.cache.write_to_end(&buf)?;
        self.pool.release(buf);
        Ok(offset)
    }

    /// Overwrite a leaf's value in place when it fits the slack; otherwise
    /// relocate the leaf with at least doubled value capacity and return the
    /// new offset for the caller to rewire.
    fn overwrite_leaf_value(&self, leaf: &LeafNode, value: &[u8]) -> Result<Option<u64>> {
        let new_length = value.len() as u32;
        if new_length <= leaf.value_capacity {
            self.cache.write(leaf.value_pointer(), value)?;
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, new_length);
            self.cache.write(leaf.offset + 5, &buf)?;
            Ok(None)
        } else {
            let suffix = self.read_leaf_suffix(leaf)?;
            let moved = self.alloc_leaf(&suffix, value, leaf.value_capacity.saturating_mul(2))?;
            debug!(
                "Relocated leaf {} -> {} (value {} -> {} bytes)",
                leaf.offset, moved, leaf.value_length, new_length
            );
            Ok(Some(moved))
        }
    }

    /// Add a child entry at slot `idx`, in place when the node has a free
    /// slot, else by relocating the node with doubled capacity and rewriting
    /// its parent's pointer.
    fn insert_child(
        &self,
        node: &InternalNode,
        path: &[(u64, usize)],
        idx: usize,
        byte: u8,
        pointer: u64,
        meta: &mut TrieMeta,
    ) -> Result<()> {
        if (node.entries.len() as u16) < node.capacity {
            let tail = node.entries.len() - idx + 1;
            let mut buf = self.pool.acquire(tail * CHILD_ENTRY_LEN as usize);
            buf[0] = byte;
            LittleEndian::write_u64(&mut buf[1..9], pointer);
            for (i, &(b, p)) in node.entries[idx..].iter().enumerate() {
                let at = (i + 1) * CHILD_ENTRY_LEN as usize;
                buf[at] = b;
                LittleEndian::write_u64(&mut buf[at + 1..at + 9], p);
            }
            self.cache.write(
                node.offset + INTERNAL_HEADER_LEN + idx as u64 * CHILD_ENTRY_LEN,
                &buf,
            )?;
            self.pool.release(buf);
            let mut count = [0u8; 2];
            LittleEndian::write_u16(&mut count, node.entries.len() as u16 + 1);
            self.cache.write(node.offset + 9, &count)?;
        } else {
            let capacity = (node.capacity * 2).min(MAX_CHILD_CAPACITY);
            let mut entries = node.entries.clone();
            entries.insert(idx, (byte, pointer));
            let moved = self.alloc_internal(node.link, &entries, capacity)?;
            debug!(
                "Relocated node {} -> {} (capacity {} -> {})",
                node.offset, moved, node.capacity, capacity
            );
            match path.last() {
                Some(&(parent, slot)) => self.write_child_ptr(parent, slot, moved)?,
                None => meta.entry = moved,
            }
        }
        Ok(())
    }

    /// Replace a leaf whose stored key diverges from the new key: build
    /// internal nodes for the shared bytes down to the divergence and hang
    /// both records off the deepest one. Returns the top of the chain.
    fn split_leaf(&self, leaf_ptr: u64, leaf: &LeafNode, rest: &[u8], value: &[u8]) -> Result<u64> {
        let suffix = self.read_leaf_suffix(leaf)?;
        let shared = suffix
            .iter()
            .zip(rest.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let mut top = if shared == suffix.len() {
            // The stored key ends at the divergence depth and becomes the
            // new node's link-to-value; shortening the suffix means
            // rewriting the leaf unless it is already empty.
            let link = if suffix.is_empty() {
                leaf_ptr
            } else {
                let old_value = self.read_leaf_value(leaf)?;
                self.alloc_leaf(&[], &old_value, leaf.value_capacity)?
            };
            let fresh = self.alloc_leaf(&rest[shared + 1..], value, 0)?;
            self.alloc_internal(link, &[(rest[shared], fresh)], INITIAL_CHILD_CAPACITY)?
        } else if shared == rest.len() {
            // The new key ends at the divergence depth
            let link = self.alloc_leaf(&[], value, 0)?;
            let old_value = self.read_leaf_value(leaf)?;
            let moved = self.alloc_leaf(&suffix[shared + 1..], &old_value, leaf.value_capacity)?;
            self.alloc_internal(link, &[(suffix[shared], moved)], INITIAL_CHILD_CAPACITY)?
        } else {
            let old_value = self.read_leaf_value(leaf)?;
            let moved = self.alloc_leaf(&suffix[shared + 1..], &old_value, leaf.value_capacity)?;
            let fresh = self.alloc_leaf(&rest[shared + 1..], value, 0)?;
            let mut pair = [(suffix[shared], moved), (rest[shared], fresh)];
            if pair[0].0 > pair[1].0 {
                pair.swap(0, 1);
            }
            self.alloc_internal(NULL_PTR, &pair, INITIAL_CHILD_CAPACITY)?
        };

        // One internal node per shared byte, deepest first
        for i in (0..shared).rev() {
            top = self.alloc_internal(NULL_PTR, &[(rest[i], top)], INITIAL_CHILD_CAPACITY)?;
        }
        debug!("Split leaf at {} ({} shared bytes)", leaf_ptr, shared);
        Ok(top)
    }

    fn walk(&self, entry: u64, key: &[u8]) -> Result<Option<Row>> {
        let mut node = self.read_internal(entry)?;
        let mut depth = 0;
        loop {
            if depth == key.len() {
                if node.link == NULL_PTR {
                    return Ok(None);
                }
                let leaf = self.read_link_leaf(node.link)?;
                return Ok(Some(self.leaf_row(key.to_vec(), &leaf)));
            }
            let ptr = match node.find(key[depth]) {
                None => return Ok(None),
                Some(ptr) => ptr,
            };
            match self.node_tag(ptr)? {
                TAG_INTERNAL => {
                    node = self.read_internal(ptr)?;
                    depth += 1;
                }
                TAG_LEAF => {
                    let leaf = self.read_leaf(ptr)?;
                    if self.suffix_matches(&leaf, &key[depth + 1..])? {
                        return Ok(Some(self.leaf_row(key.to_vec(), &leaf)));
                    }
                    return Ok(None);
                }
                tag => {
                    return Err(Error::Corrupted(format!(
                        "unexpected node tag {} at offset {}",
                        tag, ptr
                    )))
                }
            }
        }
    }

    fn write_ptr(&self, offset: u64, pointer: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, pointer);
        self.cache.write(offset, &buf)
    }

    fn write_child_ptr(&self, node_offset: u64, idx: usize, pointer: u64) -> Result<()> {
        self.write_ptr(
            node_offset + INTERNAL_HEADER_LEN + idx as u64 * CHILD_ENTRY_LEN + 1,
            pointer,
        )
    }
}

fn value_slack_capacity(length: u32) -> u32 {
    length + (length / 2).max(MIN_VALUE_SLACK)
}

struct Frame {
    node: InternalNode,
    next_child: usize,
    link_emitted: bool,
    pop_to: usize,
}

enum Step {
    Link(u64),
    Child(u8, u64),
    Pop(usize),
}

/// Lazy prefix enumerator returned by [`Trie::start_with`].
///
/// Yields rows in lexicographic key order: at each node the link-to-value
/// comes first, then the children in ascending discriminant order.
pub struct StartWith<'a, S: Storage> {
    trie: &'a Trie<S>,
    generation: u64,
    path: Vec<u8>,
    stack: Vec<Frame>,
    single: Option<Row>,
    done: bool,
}

impl<S: Storage> StartWith<'_, S> {
    fn step(&mut self) -> Result<Option<Row>> {
        if let Some(row) = self.single.take() {
            self.done = true;
            return Ok(Some(row));
        }
        loop {
            let step = match self.stack.last_mut() {
                None => return Ok(None),
                Some(frame) => {
                    if !frame.link_emitted {
                        frame.link_emitted = true;
                        if frame.node.link != NULL_PTR {
                            Some(Step::Link(frame.node.link))
                        } else {
                            None
                        }
                    } else if frame.next_child < frame.node.entries.len() {
                        let (byte, ptr) = frame.node.entries[frame.next_child];
                        frame.next_child += 1;
                        Some(Step::Child(byte, ptr))
                    } else {
                        Some(Step::Pop(frame.pop_to))
                    }
                }
            };
            match step {
                None => continue,
                Some(Step::Link(ptr)) => {
                    let leaf = self.trie.read_link_leaf(ptr)?;
                    return Ok(Some(self.trie.leaf_row(self.path.clone(), &leaf)));
                }
                Some(Step::Child(byte, ptr)) => match self.trie.node_tag(ptr)? {
                    TAG_LEAF => {
                        let leaf = self.trie.read_leaf(ptr)?;
                        let suffix = self.trie.read_leaf_suffix(&leaf)?;
                        let mut key = self.path.clone();
                        key.push(byte);
                        key.extend_from_slice(&suffix);
                        return Ok(Some(self.trie.leaf_row(key, &leaf)));
                    }
                    TAG_INTERNAL => {
                        let child = self.trie.read_internal(ptr)?;
                        let pop_to = self.path.len();
                        self.path.push(byte);
                        self.stack.push(Frame {
                            node: child,
                            next_child: 0,
                            link_emitted: false,
                            pop_to,
                        });
                    }
                    tag => {
                        return Err(Error::Corrupted(format!(
                            "unexpected node tag {} at offset {}",
                            tag, ptr
                        )))
                    }
                },
                Some(Step::Pop(pop_to)) => {
                    self.stack.pop();
                    self.path.truncate(pop_to);
                }
            }
        }
    }
}

impl<S: Storage> Iterator for StartWith<'_, S> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.trie.meta.lock().generation != self.generation {
            self.done = true;
            return Some(Err(Error::InvalidInput(
                "enumeration invalidated by a concurrent mutation".into(),
            )));
        }
        match self.step() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn open_trie() -> Trie<MemoryStorage> {
        Trie::open(MemoryStorage::new(), &Config::default()).unwrap()
    }

    fn keys_of(trie: &Trie<MemoryStorage>, prefix: &[u8]) -> Vec<Vec<u8>> {
        trie.start_with(prefix)
            .unwrap()
            .map(|row| row.unwrap().key)
            .collect()
    }

    #[test]
    fn test_fresh_file_layout() {
        let trie = open_trie();
        let root = trie.read_root_node().unwrap();
        assert_eq!(root.generation_pointer, 24);
        assert_eq!(root.entry, 33);
        assert_eq!(root.record_count, 0);
        assert_eq!(trie.generation().unwrap(), 0);

        // First record lands right after the empty entry node
        trie.set(b"abc", b"v1").unwrap();
        let row = trie.get_row(b"abc").unwrap().unwrap();
        assert_eq!(row.pointer, 82);
        assert_eq!(row.value_pointer, 82 + 13 + 2);
        assert_eq!(row.value_length, 2);
        assert_eq!(trie.record_count(), 1);
        assert_eq!(trie.generation().unwrap(), 1);
    }

    #[test]
    fn test_set_get_roundtrip() {
        let trie = open_trie();
        trie.set(b"hello", b"world").unwrap();
        trie.set(b"help", b"me").unwrap();

        assert_eq!(trie.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(trie.get(b"help").unwrap(), Some(b"me".to_vec()));
        assert_eq!(trie.get(b"hel").unwrap(), None);
        assert_eq!(trie.get(b"hello!").unwrap(), None);
        assert_eq!(trie.get(b"other").unwrap(), None);
        assert_eq!(trie.record_count(), 2);
    }

    #[test]
    fn test_overwrite_in_place_and_relocated() {
        let trie = open_trie();
        trie.set(b"key", b"ab").unwrap();
        let first = trie.get_row(b"key").unwrap().unwrap();

        // A 2-byte value gets 4 bytes of slack; 5 bytes still fit in place
        trie.set(b"key", b"abcde").unwrap();
        let second = trie.get_row(b"key").unwrap().unwrap();
        assert_eq!(second.pointer, first.pointer);
        assert_eq!(trie.get(b"key").unwrap(), Some(b"abcde".to_vec()));

        // 7 bytes exceed the capacity of 6 and relocate the leaf
        trie.set(b"key", b"abcdefg").unwrap();
        let third = trie.get_row(b"key").unwrap().unwrap();
        assert_ne!(third.pointer, first.pointer);
        assert_eq!(trie.get(b"key").unwrap(), Some(b"abcdefg".to_vec()));

        // Shrinking stays in place
        trie.set(b"key", b"x").unwrap();
        let fourth = trie.get_row(b"key").unwrap().unwrap();
        assert_eq!(fourth.pointer, third.pointer);
        assert_eq!(trie.get(b"key").unwrap(), Some(b"x".to_vec()));

        assert_eq!(trie.record_count(), 1);
    }

    #[test]
    fn test_prefix_chain_keys() {
        let trie = open_trie();
        trie.set(b"a", b"1").unwrap();
        trie.set(b"ab", b"2").unwrap();
        trie.set(b"abc", b"3").unwrap();

        assert_eq!(trie.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(trie.get(b"ab").unwrap(), Some(b"2".to_vec()));
        assert_eq!(trie.get(b"abc").unwrap(), Some(b"3".to_vec()));
        assert_eq!(trie.record_count(), 3);
    }

    #[test]
    fn test_split_mid_key() {
        let trie = open_trie();
        trie.set(b"romane", b"1").unwrap();
        trie.set(b"romanus", b"2").unwrap();
        trie.set(b"roman", b"3").unwrap();
        trie.set(b"rubens", b"4").unwrap();

        assert_eq!(trie.get(b"romane").unwrap(), Some(b"1".to_vec()));
        assert_eq!(trie.get(b"romanus").unwrap(), Some(b"2".to_vec()));
        assert_eq!(trie.get(b"roman").unwrap(), Some(b"3".to_vec()));
        assert_eq!(trie.get(b"rubens").unwrap(), Some(b"4".to_vec()));
        assert_eq!(trie.get(b"roma").unwrap(), None);
        assert_eq!(trie.get(b"rom").unwrap(), None);
        assert_eq!(trie.record_count(), 4);

        assert_eq!(
            keys_of(&trie, b""),
            vec![
                b"roman".to_vec(),
                b"romane".to_vec(),
                b"romanus".to_vec(),
                b"rubens".to_vec()
            ]
        );
    }

    #[test]
    fn test_empty_key() {
        let trie = open_trie();
        trie.set(b"", b"root value").unwrap();
        trie.set(b"a", b"1").unwrap();

        assert_eq!(trie.get(b"").unwrap(), Some(b"root value".to_vec()));
        assert_eq!(trie.record_count(), 2);
        assert_eq!(keys_of(&trie, b""), vec![b"".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_node_relocation_on_fanout() {
        let trie = open_trie();
        // 26 children overflow the entry node's initial capacity of 4
        for b in b'a'..=b'z' {
            trie.set(&[b], &[b]).unwrap();
        }
        for b in b'a'..=b'z' {
            assert_eq!(trie.get(&[b]).unwrap(), Some(vec![b]));
        }
        assert_eq!(trie.record_count(), 26);

        // The entry node moved; the root record follows it
        let root = trie.read_root_node().unwrap();
        assert_ne!(root.entry, 33);
        assert_eq!(keys_of(&trie, b"").len(), 26);
    }

    #[test]
    fn test_enumeration_order_and_filtering() {
        let trie = open_trie();
        let keys: [&[u8]; 7] = [b"b", b"a", b"ab", b"abc", b"abd", b"ac", b"b1"];
        for key in keys {
            trie.set(key, b"v").unwrap();
        }

        assert_eq!(
            keys_of(&trie, b""),
            vec![
                b"a".to_vec(),
                b"ab".to_vec(),
                b"abc".to_vec(),
                b"abd".to_vec(),
                b"ac".to_vec(),
                b"b".to_vec(),
                b"b1".to_vec()
            ]
        );
        assert_eq!(
            keys_of(&trie, b"ab"),
            vec![b"ab".to_vec(), b"abc".to_vec(), b"abd".to_vec()]
        );
        assert_eq!(keys_of(&trie, b"abc"), vec![b"abc".to_vec()]);
        assert_eq!(keys_of(&trie, b"abcd"), Vec::<Vec<u8>>::new());
        assert_eq!(keys_of(&trie, b"x"), Vec::<Vec<u8>>::new());
        assert_eq!(keys_of(&trie, b"").len() as u64, trie.record_count());
    }

    #[test]
    fn test_enumeration_reads_values_lazily() {
        let trie = open_trie();
        trie.set(b"k1", b"value one").unwrap();
        trie.set(b"k2", b"value two").unwrap();

        let rows: Vec<Row> = trie
            .start_with(b"k")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(trie.read_value(&rows[0]).unwrap(), b"value one");
        assert_eq!(trie.read_value(&rows[1]).unwrap(), b"value two");
    }

    #[test]
    fn test_enumeration_invalidated_by_mutation() {
        let trie = open_trie();
        trie.set(b"a", b"1").unwrap();
        trie.set(b"b", b"2").unwrap();

        let mut iter = trie.start_with(b"").unwrap();
        assert!(iter.next().unwrap().is_ok());

        trie.set(b"c", b"3").unwrap();
        assert!(matches!(iter.next(), Some(Err(Error::InvalidInput(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_best_match() {
        let trie = open_trie();
        trie.set(b"car", b"1").unwrap();
        trie.set(b"cart", b"2").unwrap();

        // Exact key
        let m = trie.best_match(b"car").unwrap();
        assert!(m.has_link());
        assert_eq!(m.row.as_ref().unwrap().key, b"car");

        // Needle runs past a stored key
        let m = trie.best_match(b"carts").unwrap();
        assert!(m.has_link());
        assert_eq!(m.row.as_ref().unwrap().key, b"cart");

        // Needle ends inside the structure with no value at that depth
        let m = trie.best_match(b"ca").unwrap();
        assert!(!m.has_link());
        assert_eq!(m.depth, 2);

        // Divergence
        assert!(!trie.best_match(b"cab").unwrap().has_link());
        assert!(!trie.best_match(b"dog").unwrap().has_link());
    }

    #[test]
    fn test_reload_after_flush() {
        let config = Config::default();
        let trie = Trie::open(MemoryStorage::new(), &config).unwrap();
        trie.set(b"alpha", b"1").unwrap();
        trie.set(b"beta", b"2").unwrap();
        trie.set(b"alpha", b"one").unwrap();
        trie.flush().unwrap();
        let generation = trie.generation().unwrap();

        let trie = Trie::open(trie.into_storage(), &config).unwrap();
        assert_eq!(trie.record_count(), 2);
        assert_eq!(trie.generation().unwrap(), generation);
        assert_eq!(trie.get(b"alpha").unwrap(), Some(b"one".to_vec()));
        assert_eq!(trie.get(b"beta").unwrap(), Some(b"2".to_vec()));
        assert_eq!(
            keys_of(&trie, b""),
            vec![b"alpha".to_vec(), b"beta".to_vec()]
        );
    }

    #[test]
    fn test_generation_bumps_on_every_mutation() {
        let trie = open_trie();
        assert_eq!(trie.generation().unwrap(), 0);
        trie.set(b"k", b"v1").unwrap();
        assert_eq!(trie.generation().unwrap(), 1);
        trie.set(b"k", b"v2").unwrap();
        assert_eq!(trie.generation().unwrap(), 2);
    }

    #[test]
    fn test_lookup_cache() {
        let trie = open_trie();
        trie.set(b"cached", b"value").unwrap();
        trie.activate_cache();

        assert_eq!(trie.get(b"cached").unwrap(), Some(b"value".to_vec()));
        assert_eq!(trie.get(b"cached").unwrap(), Some(b"value".to_vec()));
        let stats = trie.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        // Mutation invalidates the cached row
        trie.set(b"cached", b"new").unwrap();
        assert_eq!(trie.get(b"cached").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_consistency_check() {
        let trie = open_trie();
        trie.set_consistency_check(true);
        trie.set(b"checked", b"value").unwrap();
        assert_eq!(trie.get(b"checked").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn test_corrupted_tag_detected() {
        let trie = open_trie();
        trie.set(b"victim", b"value").unwrap();
        let row = trie.get_row(b"victim").unwrap().unwrap();

        // Stomp the leaf's tag byte
        trie.cache.write(row.pointer, &[7]).unwrap();
        assert!(matches!(trie.get(b"victim"), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_short_storage_rejected() {
        let storage = MemoryStorage::new();
        storage.write(0, &[1u8; 10]).unwrap();
        assert!(matches!(
            Trie::open(storage, &Config::default()),
            Err(Error::Corrupted(_))
        ));
    }
}
