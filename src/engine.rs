//! Integrity-checking I/O engine.
//!
//! Maps a logical byte cursor onto cache blocks, validating checksums when
//! blocks are pulled from the raw stream and recomputing them when dirty
//! blocks are flushed back. All fallible I/O happens here; the cache only
//! does bookkeeping and hands evicted victims back for flushing.

use crate::cache::{BlockCache, CacheBuffer, CacheStats, EvictedBlock, PageRef};
use crate::crc::checksum_of;
use crate::error::{Result, VeristreamError};
use crate::metadata::FileChecksums;
use crate::stream::{read_full, write_all, RawStream};
use std::io::SeekFrom;
use tracing::{debug, warn};

/// Block-granular integrity engine over one raw stream.
///
/// Owns the file's [`FileChecksums`] while the stream is open; the lifecycle
/// manager takes it back via [`into_parts`](IntegrityEngine::into_parts)
/// when the stream closes.
pub struct IntegrityEngine<'buf, S: RawStream> {
    stream: S,
    metadata: FileChecksums,
    cache: BlockCache<'buf>,
    block_length: usize,
    /// Logical cursor, independent of the raw stream's own position.
    position: u64,
    append: bool,
    /// Highest logical end-of-write so far; append mode targets
    /// `max(physical size, this)`.
    write_high_water: u64,
}

impl<'buf, S: RawStream> IntegrityEngine<'buf, S> {
    pub fn new(
        stream: S,
        metadata: FileChecksums,
        buffer: impl Into<CacheBuffer<'buf>>,
    ) -> Result<Self> {
        let buffer = buffer.into();
        let block_length = metadata.block_length as usize;
        if buffer.len() < block_length {
            return Err(VeristreamError::InsufficientCacheBuffer {
                buffer: buffer.len(),
                block_length,
            });
        }

        Ok(IntegrityEngine {
            stream,
            metadata,
            cache: BlockCache::new(buffer, block_length),
            block_length,
            position: 0,
            append: false,
            write_high_water: 0,
        })
    }

    /// Subsequent writes target the logical end of file instead of the
    /// current cursor.
    pub fn enable_append_mode(&mut self) {
        self.append = true;
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn metadata(&self) -> &FileChecksums {
        &self.metadata
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Buffer headroom at the current cursor; see
    /// [`BlockCache::remaining_capacity`].
    pub fn remaining_capacity(&self) -> u64 {
        self.cache.remaining_capacity(self.position)
    }

    /// Logical file size: physical size or the write high-water mark,
    /// whichever is larger (dirty cached tails count).
    pub fn file_size(&mut self) -> Result<u64> {
        Ok(self.stream.file_size()?.max(self.write_high_water))
    }

    /// Move the logical cursor.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let base = match pos {
            SeekFrom::Start(offset) => return self.seek_to(i128::from(offset)),
            SeekFrom::Current(delta) => (i128::from(self.position), delta),
            SeekFrom::End(delta) => (i128::from(self.file_size()?), delta),
        };
        self.seek_to(base.0 + i128::from(base.1))
    }

    fn seek_to(&mut self, target: i128) -> Result<u64> {
        let position = u64::try_from(target).map_err(|_| {
            VeristreamError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ))
        })?;
        self.position = position;
        Ok(position)
    }

    /// Read up to `buf.len()` bytes at the cursor, shrinking at end of file.
    ///
    /// Blocks with a recorded checksum are validated as they are pulled from
    /// the raw stream; a mismatch resets the cursor to the start of the
    /// failing block and fails with
    /// [`IntegrityViolation`](VeristreamError::IntegrityViolation). Blocks
    /// beyond the last recorded checksum (freshly appended data) are served
    /// unvalidated.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read_chunk(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Write `data` at the cursor (or at end of file in append mode).
    ///
    /// Bytes land in cache pages only; checksums are recomputed at flush
    /// time, not on every write.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.append {
            self.position = self.file_size()?;
        }
        let mut total = 0;
        while total < data.len() {
            total += self.write_chunk(&data[total..])?;
        }
        Ok(total)
    }

    /// Flush every dirty page: write its bytes at the block's offset and
    /// record the recomputed checksum, extending the checksum list for new
    /// blocks. All dirty pages are attempted; the first error wins.
    pub fn flush(&mut self) -> Result<()> {
        let stream = &mut self.stream;
        let metadata = &mut self.metadata;
        let block_length = self.block_length as u64;

        let mut flushed = 0u32;
        let result = self.cache.flush(|block_id, data| {
            stream.seek(SeekFrom::Start(block_id * block_length))?;
            write_all(stream, data)?;
            metadata.record_checksum(block_id, checksum_of(metadata.algorithm, data));
            flushed += 1;
            Ok(())
        });
        if flushed > 0 {
            debug!("Flushed {} dirty blocks", flushed);
        }
        result
    }

    /// Flush dirty pages, then sync the raw stream itself.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.stream.sync()
    }

    /// Validate the whole file sequentially, one block at a time, without
    /// going through the cache. Fails on the first mismatch with the raw
    /// stream positioned at the failing block's start; with `rewind`, the
    /// original stream position is restored on success.
    pub fn pre_validate(&mut self, rewind: bool) -> Result<()> {
        let original = self.stream.tell()?;
        self.stream.seek(SeekFrom::Start(0))?;

        let mut block = vec![0u8; self.block_length];
        let mut block_id = 0u64;
        loop {
            let filled = read_full(&mut self.stream, &mut block)?;
            if filled == 0 {
                break;
            }
            if let Some(expected) = self.metadata.checksum_for(block_id) {
                let computed = checksum_of(self.metadata.algorithm, &block[..filled]);
                if computed != expected {
                    warn!(
                        "Pre-validation failed at block {} of '{}'",
                        block_id, self.metadata.relative_name
                    );
                    self.stream
                        .seek(SeekFrom::Start(block_id * self.block_length as u64))?;
                    return Err(VeristreamError::IntegrityViolation { block_id });
                }
            }
            if filled < self.block_length {
                break;
            }
            block_id += 1;
        }

        if rewind {
            self.stream.seek(SeekFrom::Start(original))?;
        }
        Ok(())
    }

    /// Tear down, handing back the raw stream and the (possibly extended)
    /// validation metadata. Dirty pages must have been flushed first.
    pub fn into_parts(self) -> (S, FileChecksums) {
        debug_assert!(!self.cache.has_dirty_pages(), "dropping unflushed blocks");
        (self.stream, self.metadata)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let block_id = self.position / self.block_length as u64;
        let offset_in_block = (self.position % self.block_length as u64) as usize;

        let page = self.load_block(block_id)?;
        let used = self.cache.used_size(page);
        if offset_in_block >= used {
            return Ok(0);
        }

        let n = buf.len().min(used - offset_in_block);
        buf[..n].copy_from_slice(&self.cache.page_slice(page)[offset_in_block..offset_in_block + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<usize> {
        let block_id = self.position / self.block_length as u64;
        let offset_in_block = (self.position % self.block_length as u64) as usize;
        let n = data.len().min(self.block_length - offset_in_block);

        let page = self.load_block_for_write(block_id, offset_in_block, n)?;

        let used = self.cache.used_size(page);
        let span = self.cache.page_slice_mut(page);
        // A cursor past the page's valid bytes leaves a hole; files read
        // zeros there, so the page must too.
        if offset_in_block > used {
            span[used..offset_in_block].fill(0);
        }
        span[offset_in_block..offset_in_block + n].copy_from_slice(&data[..n]);

        self.cache
            .set_used_size(page, used.max(offset_in_block + n));
        self.cache.mark_dirty(page);

        self.position += n as u64;
        self.write_high_water = self.write_high_water.max(self.position);
        Ok(n)
    }

    /// Bind `block_id` to a page for reading: flush a displaced dirty
    /// victim, pull the block's bytes from the raw stream on a fresh load,
    /// and validate them when a checksum is recorded.
    fn load_block(&mut self, block_id: u64) -> Result<PageRef> {
        let load = self.cache.load(block_id);
        if let Some(evicted) = load.evicted.filter(|e| e.dirty) {
            self.flush_evicted(load.page, evicted)?;
        }

        if load.just_loaded {
            let filled = self.fill_page_from_stream(load.page, block_id)?;
            if filled > 0 {
                self.validate_page(load.page, block_id, filled)?;
            }
        }
        Ok(load.page)
    }

    /// Bind `block_id` for a write of `len` bytes at `offset_in_block`.
    /// Existing on-disk bytes the write does not fully cover are pulled in
    /// (and validated) first, so a flush never checksums a half-stale page.
    fn load_block_for_write(
        &mut self,
        block_id: u64,
        offset_in_block: usize,
        len: usize,
    ) -> Result<PageRef> {
        let load = self.cache.load(block_id);
        if let Some(evicted) = load.evicted.filter(|e| e.dirty) {
            self.flush_evicted(load.page, evicted)?;
        }

        if load.just_loaded {
            let on_disk = self.bytes_on_disk(block_id)?;
            let overwrites_everything = offset_in_block == 0 && len >= on_disk;
            if on_disk > 0 && !overwrites_everything {
                let filled = self.fill_page_from_stream(load.page, block_id)?;
                self.validate_page(load.page, block_id, filled)?;
            }
        }
        Ok(load.page)
    }

    /// Write a displaced dirty block's bytes (still present in the page
    /// span) back to the raw stream and record its fresh checksum.
    fn flush_evicted(&mut self, page: PageRef, evicted: EvictedBlock) -> Result<()> {
        debug!("Evicting dirty block {}", evicted.block_id);
        self.stream
            .seek(SeekFrom::Start(evicted.block_id * self.block_length as u64))?;

        let data = &self.cache.page_slice(page)[..evicted.used_size];
        write_all(&mut self.stream, data)?;
        self.metadata
            .record_checksum(evicted.block_id, checksum_of(self.metadata.algorithm, data));
        Ok(())
    }

    /// Read the block's on-disk bytes into the page span and set
    /// `used_size`; returns the byte count (0 when the block lies beyond
    /// end of file).
    fn fill_page_from_stream(&mut self, page: PageRef, block_id: u64) -> Result<usize> {
        self.stream
            .seek(SeekFrom::Start(block_id * self.block_length as u64))?;
        let span = self.cache.page_slice_mut(page);
        let filled = read_full(&mut self.stream, span)?;
        self.cache.set_used_size(page, filled);
        Ok(filled)
    }

    /// Compare the page's bytes against the recorded checksum, if any. On a
    /// mismatch the page is discarded, the cursor resets to the block's
    /// start, and the read/write fails; corrupted storage is never retried.
    fn validate_page(&mut self, page: PageRef, block_id: u64, filled: usize) -> Result<()> {
        let Some(expected) = self.metadata.checksum_for(block_id) else {
            return Ok(());
        };
        let computed = checksum_of(self.metadata.algorithm, &self.cache.page_slice(page)[..filled]);
        if computed == expected {
            return Ok(());
        }

        warn!(
            "Integrity violation in block {} of '{}' (stored {:#x}, computed {:#x})",
            block_id, self.metadata.relative_name, expected, computed
        );
        self.cache.remove(block_id);
        self.position = block_id * self.block_length as u64;
        Err(VeristreamError::IntegrityViolation { block_id })
    }

    /// How many of this block's bytes exist on disk right now.
    fn bytes_on_disk(&mut self, block_id: u64) -> Result<usize> {
        let size = self.stream.file_size()?;
        let start = block_id * self.block_length as u64;
        if size <= start {
            return Ok(0);
        }
        Ok(((size - start).min(self.block_length as u64)) as usize)
    }
}
