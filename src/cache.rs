//! LRU block cache over a caller-owned buffer.
//!
//! The cache carves a fixed set of pages out of one contiguous buffer and
//! maps block identifiers to pages with least-recently-used eviction. It
//! performs no I/O of its own: when loading a block evicts a dirty victim,
//! the victim's identity and span are handed back to the caller, who flushes
//! it before reusing the page. Page bytes are index ranges into the buffer,
//! never separately allocated.

use crate::error::Result;

/// Backing storage for a [`BlockCache`].
///
/// The borrowed arm keeps ownership (and lifetime responsibility) with the
/// caller; the owned arm backs opens where the caller did not supply a
/// buffer.
pub enum CacheBuffer<'a> {
    Borrowed(&'a mut [u8]),
    Owned(Box<[u8]>),
}

impl CacheBuffer<'_> {
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            CacheBuffer::Borrowed(buf) => buf,
            CacheBuffer::Owned(buf) => buf,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            CacheBuffer::Borrowed(buf) => buf,
            CacheBuffer::Owned(buf) => buf,
        }
    }
}

impl<'a> From<&'a mut [u8]> for CacheBuffer<'a> {
    fn from(buf: &'a mut [u8]) -> Self {
        CacheBuffer::Borrowed(buf)
    }
}

impl From<Vec<u8>> for CacheBuffer<'_> {
    fn from(buf: Vec<u8>) -> Self {
        CacheBuffer::Owned(buf.into_boxed_slice())
    }
}

/// Handle to a page slot, obtained from [`BlockCache::load`].
///
/// Only valid for the cache that issued it; passing a stale or foreign
/// handle is a caller bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef(usize);

/// State of a block displaced by [`BlockCache::load`].
///
/// The page span still holds the victim's bytes until the caller writes
/// into it, so a dirty victim can be flushed from the span after the fact.
#[derive(Debug, Clone, Copy)]
pub struct EvictedBlock {
    pub block_id: u64,
    pub used_size: usize,
    pub dirty: bool,
}

/// Result of binding a block to a page.
#[derive(Debug, Clone, Copy)]
pub struct PageLoad {
    pub page: PageRef,
    /// True when the page was freshly bound and holds no bytes for this
    /// block yet; the caller must fill it before trusting `used_size`.
    pub just_loaded: bool,
    pub used_size: usize,
    pub evicted: Option<EvictedBlock>,
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub pages: usize,
}

impl CacheStats {
    /// Hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PageSlot {
    block: Option<u64>,
    used_size: usize,
    dirty: bool,
    last_used: u64,
}

impl PageSlot {
    const EMPTY: PageSlot = PageSlot {
        block: None,
        used_size: 0,
        dirty: false,
        last_used: 0,
    };
}

/// Fixed-capacity LRU page cache over a borrowed (or owned) buffer.
pub struct BlockCache<'buf> {
    buffer: CacheBuffer<'buf>,
    block_length: usize,
    slots: Vec<PageSlot>,
    /// Monotonic access counter; every access stamps a unique recency value,
    /// so LRU ties cannot occur.
    tick: u64,
    hits: u64,
    misses: u64,
}

impl<'buf> BlockCache<'buf> {
    /// Partition `buffer` into pages of `block_length` bytes, discarding any
    /// remainder smaller than one page.
    ///
    /// # Panics
    ///
    /// Panics if `block_length` is zero or the buffer cannot hold a single
    /// page. A zero-capacity cache is a caller contract violation, not a
    /// runtime condition.
    pub fn new(buffer: impl Into<CacheBuffer<'buf>>, block_length: usize) -> Self {
        let buffer = buffer.into();
        assert!(block_length > 0, "block length must be non-zero");
        let pages = buffer.len() / block_length;
        assert!(
            pages >= 1,
            "cache buffer ({} bytes) cannot hold one {}-byte block",
            buffer.len(),
            block_length
        );

        BlockCache {
            buffer,
            block_length,
            slots: vec![PageSlot::EMPTY; pages],
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn block_length(&self) -> usize {
        self.block_length
    }

    pub fn page_count(&self) -> usize {
        self.slots.len()
    }

    /// Bind `block_id` to a page, evicting the least-recently-used page if
    /// no slot is free. Always succeeds; a displaced block is reported via
    /// [`PageLoad::evicted`] so the caller can flush it before reusing the
    /// span.
    pub fn load(&mut self, block_id: u64) -> PageLoad {
        self.tick += 1;

        if let Some(index) = self.slot_of(block_id) {
            self.hits += 1;
            self.slots[index].last_used = self.tick;
            return PageLoad {
                page: PageRef(index),
                just_loaded: false,
                used_size: self.slots[index].used_size,
                evicted: None,
            };
        }

        self.misses += 1;
        let index = self.victim_index();
        let slot = &mut self.slots[index];
        let evicted = slot.block.map(|old_id| EvictedBlock {
            block_id: old_id,
            used_size: slot.used_size,
            dirty: slot.dirty,
        });

        *slot = PageSlot {
            block: Some(block_id),
            used_size: 0,
            dirty: false,
            last_used: self.tick,
        };

        PageLoad {
            page: PageRef(index),
            just_loaded: true,
            used_size: 0,
            evicted,
        }
    }

    /// Unbind `block_id` without evicting. The caller guarantees no
    /// unflushed data is lost; only valid after an explicit flush.
    pub fn remove(&mut self, block_id: u64) -> bool {
        match self.slot_of(block_id) {
            Some(index) => {
                assert!(
                    !self.slots[index].dirty,
                    "removing dirty block {} from cache",
                    block_id
                );
                self.slots[index] = PageSlot::EMPTY;
                true
            }
            None => false,
        }
    }

    /// Full span of a page (always `block_length` bytes).
    pub fn page_slice(&self, page: PageRef) -> &[u8] {
        let start = self.page_offset(page);
        &self.buffer.as_slice()[start..start + self.block_length]
    }

    /// Mutable span of a page.
    pub fn page_slice_mut(&mut self, page: PageRef) -> &mut [u8] {
        let start = self.page_offset(page);
        let end = start + self.block_length;
        &mut self.buffer.as_mut_slice()[start..end]
    }

    pub fn used_size(&self, page: PageRef) -> usize {
        self.check_page(page);
        self.slots[page.0].used_size
    }

    /// Record how many bytes of the page span are valid.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the block length.
    pub fn set_used_size(&mut self, page: PageRef, n: usize) {
        self.check_page(page);
        assert!(
            n <= self.block_length,
            "used size {} exceeds block length {}",
            n,
            self.block_length
        );
        self.slots[page.0].used_size = n;
    }

    pub fn mark_dirty(&mut self, page: PageRef) {
        self.check_page(page);
        debug_assert!(self.slots[page.0].block.is_some());
        self.slots[page.0].dirty = true;
    }

    pub fn is_dirty(&self, page: PageRef) -> bool {
        self.check_page(page);
        self.slots[page.0].dirty
    }

    /// Write every dirty page through `write_fn`, clearing the dirty flag on
    /// per-page success. All dirty pages are attempted even after a failure;
    /// the first error encountered is returned.
    pub fn flush<F>(&mut self, mut write_fn: F) -> Result<()>
    where
        F: FnMut(u64, &[u8]) -> Result<()>,
    {
        let mut first_error = None;

        for index in 0..self.slots.len() {
            let slot = self.slots[index];
            if !slot.dirty {
                continue;
            }
            let block_id = slot.block.expect("dirty page must be bound to a block");
            let start = index * self.block_length;
            let data = &self.buffer.as_slice()[start..start + slot.used_size];

            match write_fn(block_id, data) {
                Ok(()) => self.slots[index].dirty = false,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// True if any page is dirty.
    pub fn has_dirty_pages(&self) -> bool {
        self.slots.iter().any(|slot| slot.dirty)
    }

    /// Bytes left in the page currently covering `position`, plus the full
    /// capacity of every still-empty page. Reports buffer headroom without
    /// committing any page to a specific block.
    pub fn remaining_capacity(&self, position: u64) -> u64 {
        let block_id = position / self.block_length as u64;
        let offset_in_block = (position % self.block_length as u64) as usize;

        let in_page = if self.slot_of(block_id).is_some() {
            (self.block_length - offset_in_block) as u64
        } else {
            0
        };

        let empty: u64 = self
            .slots
            .iter()
            .filter(|slot| slot.block.is_none())
            .map(|_| self.block_length as u64)
            .sum();

        in_page + empty
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            pages: self.slots.len(),
        }
    }

    fn slot_of(&self, block_id: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.block == Some(block_id))
    }

    /// Empty slots win over bound ones; among bound slots, strictly the
    /// smallest recency stamp.
    fn victim_index(&self) -> usize {
        if let Some(index) = self.slots.iter().position(|slot| slot.block.is_none()) {
            return index;
        }
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(index, _)| index)
            .expect("cache has at least one page")
    }

    fn page_offset(&self, page: PageRef) -> usize {
        self.check_page(page);
        page.0 * self.block_length
    }

    fn check_page(&self, page: PageRef) {
        assert!(page.0 < self.slots.len(), "page handle out of range");
    }
}
