//! Block handle
//!
//! A reference-counted handle over one immutable-identity byte sequence on
//! disk. Appends arrive as `(packet_seq, offset, bytes)` tuples, possibly
//! out of order; a bounded per-block sliding window re-orders them so the
//! on-disk byte sequence always equals the packets concatenated by seq.
//! Duplicates are dropped as success, gaps stall the tail until filled.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::counters::Counters;
use crate::file_cache::FileCache;
use crate::meta::BlockMeta;

/// Maximum distance a packet may run ahead of the in-order tail.
const WINDOW_SIZE: i32 = 100;

pub struct Block {
    block_id: i64,
    file_path: PathBuf,
    file_cache: Arc<FileCache>,
    counters: Arc<Counters>,
    deleted: AtomicBool,
    inner: Mutex<Inner>,
}

struct Inner {
    meta: BlockMeta,
    /// Append handle, opened lazily on the first in-order packet
    file: Option<File>,
    /// Parked out-of-order packets: seq -> (expected offset, bytes)
    window: BTreeMap<i32, (i64, Bytes)>,
    /// Next packet seq the in-order tail accepts
    expect_seq: i32,
    /// Bytes durably appended
    disk_size: i64,
    /// Declared packet count, -1 until the last packet announces it
    slice_num: i32,
    finished: bool,
    /// A drained packet carried a mismatched offset; the block is unusable
    broken: bool,
}

impl Block {
    /// Wrap a meta row in a live handle. A sealed row (version > 0) is
    /// reconstructed as finished with its window closed; an unsealed row
    /// resumes from whatever bytes its file already holds.
    pub fn new(
        meta: BlockMeta,
        file_path: PathBuf,
        file_cache: Arc<FileCache>,
        counters: Arc<Counters>,
    ) -> Self {
        let sealed = meta.version > 0;
        let disk_size = if sealed {
            meta.block_size
        } else {
            std::fs::metadata(&file_path).map(|m| m.len() as i64).unwrap_or(0)
        };
        let slice_num = if sealed { meta.version as i32 + 1 } else { -1 };
        Self {
            block_id: meta.block_id,
            file_path,
            file_cache,
            counters,
            deleted: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                meta,
                file: None,
                window: BTreeMap::new(),
                expect_seq: slice_num.max(0),
                disk_size,
                slice_num,
                finished: sealed,
                broken: false,
            }),
        }
    }

    pub fn id(&self) -> i64 {
        self.block_id
    }

    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }

    pub fn meta(&self) -> BlockMeta {
        self.inner.lock().meta
    }

    pub fn version(&self) -> i64 {
        self.inner.lock().meta.version
    }

    /// Sealed size once finished, otherwise the durable byte count so far.
    pub fn size(&self) -> i64 {
        let inner = self.inner.lock();
        if inner.finished {
            inner.meta.block_size
        } else {
            inner.disk_size
        }
    }

    pub fn disk_used(&self) -> i64 {
        self.inner.lock().disk_size
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Flag the block as going away. Returns false if another caller
    /// already did; the winner owns the removal sequence.
    pub fn set_deleted(&self) -> bool {
        !self.deleted.swap(true, Ordering::AcqRel)
    }

    /// Declare the total packet count (last seq + 1).
    pub fn set_slice_num(&self, n: i32) {
        self.inner.lock().slice_num = n;
    }

    /// Record the version the block will seal with.
    pub fn set_version(&self, v: i64) {
        self.inner.lock().meta.version = v;
    }

    /// All declared packets drained to disk.
    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        inner.slice_num >= 0 && inner.expect_seq >= inner.slice_num && inner.window.is_empty()
    }

    /// Accept one packet. Appends immediately when `packet_seq` is the
    /// in-order tail, parks it otherwise. Returns false iff the packet is
    /// unacceptable: offset mismatch, at/past the declared last packet,
    /// too far ahead of the window, or the block is deleted or broken.
    /// Replays of already-applied seqs return true without touching state.
    pub fn write(&self, packet_seq: i32, offset: i64, data: &[u8]) -> bool {
        if self.is_deleted() {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.broken {
            return false;
        }
        if inner.finished {
            // Replays of a sealed block ack; anything new is refused.
            return packet_seq < inner.slice_num;
        }
        if packet_seq < inner.expect_seq || inner.window.contains_key(&packet_seq) {
            debug!("#{} drop duplicate seq {}", self.block_id, packet_seq);
            return true;
        }
        if inner.slice_num >= 0 && packet_seq >= inner.slice_num {
            warn!(
                "#{} seq {} at/past declared last {}",
                self.block_id, packet_seq, inner.slice_num
            );
            return false;
        }
        if packet_seq >= inner.expect_seq + WINDOW_SIZE {
            warn!(
                "#{} seq {} overruns window at {}",
                self.block_id, packet_seq, inner.expect_seq
            );
            return false;
        }

        if packet_seq != inner.expect_seq {
            // Out of order: park until the gap fills.
            self.counters.block_buffers.inc();
            self.counters.buffers_new.inc();
            self.counters.writing_bytes.add(data.len() as i64);
            inner
                .window
                .insert(packet_seq, (offset, Bytes::copy_from_slice(data)));
            return true;
        }

        if offset != inner.disk_size {
            warn!(
                "#{} seq {} offset {} != end {}",
                self.block_id, packet_seq, offset, inner.disk_size
            );
            return false;
        }
        if let Err(e) = self.append(&mut inner, data) {
            warn!("#{} append failed: {}", self.block_id, e);
            return false;
        }
        inner.expect_seq += 1;

        // Drain the in-order tail out of the window.
        loop {
            let next = inner.expect_seq;
            let Some((off, buf)) = inner.window.remove(&next) else {
                break;
            };
            self.counters.block_buffers.dec();
            self.counters.buffers_delete.inc();
            self.counters.writing_bytes.sub(buf.len() as i64);
            if off != inner.disk_size {
                warn!(
                    "#{} buffered seq {} offset {} != end {}, block broken",
                    self.block_id, inner.expect_seq, off, inner.disk_size
                );
                inner.broken = true;
                self.release_window(&mut inner);
                return false;
            }
            if let Err(e) = self.append(&mut inner, &buf) {
                warn!("#{} drain append failed: {}", self.block_id, e);
                inner.broken = true;
                self.release_window(&mut inner);
                return false;
            }
            inner.expect_seq += 1;
        }
        true
    }

    fn append(&self, inner: &mut Inner, data: &[u8]) -> io::Result<()> {
        if inner.file.is_none() {
            if let Some(parent) = self.file_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            inner.file = Some(file);
            self.counters.writing_blocks.inc();
        }
        use std::io::Write;
        inner.file.as_mut().unwrap().write_all(data)?;
        inner.disk_size += data.len() as i64;
        self.counters.data_size.add(data.len() as i64);
        Ok(())
    }

    fn release_window(&self, inner: &mut Inner) {
        for (_, (_, buf)) in std::mem::take(&mut inner.window) {
            self.counters.block_buffers.dec();
            self.counters.buffers_delete.inc();
            self.counters.writing_bytes.sub(buf.len() as i64);
        }
    }

    /// Flush and seal. Effective at most once; only the first successful
    /// call returns true, so completion reporting fires exactly once.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.finished || inner.broken {
            return false;
        }
        if let Some(file) = inner.file.take() {
            if let Err(e) = file.sync_all() {
                warn!("#{} close sync failed: {}", self.block_id, e);
                inner.file = Some(file);
                return false;
            }
            self.counters.writing_blocks.dec();
        }
        inner.meta.block_size = inner.disk_size;
        inner.finished = true;
        info!(
            "#{} sealed, size {} version {}",
            self.block_id, inner.meta.block_size, inner.meta.version
        );
        true
    }

    /// Read up to `len` bytes at `offset`, bounded by the bytes durably
    /// appended before the call.
    pub fn read(&self, offset: i64, len: usize) -> io::Result<Vec<u8>> {
        if self.is_deleted() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "block deleted"));
        }
        let durable = self.inner.lock().disk_size;
        if offset < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative offset"));
        }
        if offset >= durable {
            return Ok(Vec::new());
        }
        let len = len.min((durable - offset) as usize);
        let file = self.file_cache.get(&self.file_path)?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset as u64)?;
        Ok(buf)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (_, (_, buf)) in std::mem::take(&mut inner.window) {
            self.counters.block_buffers.dec();
            self.counters.buffers_delete.inc();
            self.counters.writing_bytes.sub(buf.len() as i64);
        }
        if inner.file.take().is_some() {
            self.counters.writing_blocks.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_block(dir: &std::path::Path, id: i64) -> Block {
        Block::new(
            BlockMeta {
                block_id: id,
                version: 0,
                block_size: 0,
            },
            dir.join(format!("{:03}/{}", id.rem_euclid(1000), id)),
            Arc::new(FileCache::new(16)),
            Arc::new(Counters::default()),
        )
    }

    #[test]
    fn out_of_order_packets_land_in_seq_order() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), 42);

        assert!(block.write(1, 4, b"BBBB"));
        assert!(!block.is_complete());
        assert!(block.write(0, 0, b"AAAA"));
        assert!(block.write(2, 8, b"CCCC"));
        block.set_slice_num(3);
        block.set_version(2);
        assert!(block.is_complete());
        assert!(block.close());

        assert_eq!(block.read(0, 64).unwrap(), b"AAAABBBBCCCC");
        assert_eq!(block.version(), 2);
        assert_eq!(block.size(), 12);
        // Sealing is one-shot.
        assert!(!block.close());
    }

    #[test]
    fn duplicates_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), 1);
        assert!(block.write(0, 0, b"xxxx"));
        assert!(block.write(0, 0, b"xxxx"));
        assert_eq!(block.disk_used(), 4);

        // A parked duplicate is also dropped.
        assert!(block.write(2, 8, b"zzzz"));
        assert!(block.write(2, 8, b"zzzz"));
        assert!(block.write(1, 4, b"yyyy"));
        assert_eq!(block.disk_used(), 12);
        assert_eq!(block.read(0, 12).unwrap(), b"xxxxyyyyzzzz");
    }

    #[test]
    fn gap_blocks_progress_until_filled() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), 2);
        assert!(block.write(0, 0, b"head"));
        assert!(block.write(2, 8, b"tail"));
        block.set_slice_num(3);
        assert!(!block.is_complete());
        assert_eq!(block.disk_used(), 4);
        assert!(block.write(1, 4, b"gap!"));
        assert!(block.is_complete());
        assert_eq!(block.disk_used(), 12);
    }

    #[test]
    fn rejects_past_declared_last() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), 3);
        assert!(block.write(0, 0, b"aa"));
        block.set_slice_num(1);
        assert!(!block.write(1, 2, b"bb"));
    }

    #[test]
    fn rejects_offset_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), 4);
        assert!(block.write(0, 0, b"aaaa"));
        assert!(!block.write(1, 2, b"bbbb"));
    }

    #[test]
    fn rejects_window_overrun() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), 5);
        assert!(!block.write(WINDOW_SIZE, 0, b"far"));
        assert!(block.write(WINDOW_SIZE - 1, 0, b"edge"));
    }

    #[test]
    fn buffered_offset_mismatch_breaks_block() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), 6);
        assert!(block.write(1, 999, b"bad-offset"));
        assert!(!block.write(0, 0, b"aaaa"));
        // Broken blocks refuse everything afterwards.
        assert!(!block.write(2, 14, b"cc"));
        assert!(!block.close());
    }

    #[test]
    fn deleted_blocks_refuse_io() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), 7);
        assert!(block.write(0, 0, b"data"));
        assert!(block.set_deleted());
        assert!(!block.set_deleted());
        assert!(!block.write(1, 4, b"more"));
        assert!(block.read(0, 4).is_err());
    }

    #[test]
    fn reads_are_bounded_by_durable_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), 8);
        assert!(block.write(0, 0, b"0123456789"));
        // Parked bytes are not readable.
        assert!(block.write(2, 20, b"parked"));
        assert_eq!(block.read(4, 100).unwrap(), b"456789");
        assert_eq!(block.read(10, 4).unwrap(), b"");
        assert_eq!(block.read(0, 4).unwrap(), b"0123");
    }

    #[test]
    fn empty_block_seals_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), 9);
        block.set_slice_num(0);
        assert!(block.is_complete());
        assert!(block.close());
        assert_eq!(block.size(), 0);
        assert_eq!(block.read(0, 10).unwrap(), b"");
    }

    #[test]
    fn sealed_meta_reconstructs_finished_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("001/1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"sealed-bytes").unwrap();
        let block = Block::new(
            BlockMeta {
                block_id: 1,
                version: 2,
                block_size: 12,
            },
            path,
            Arc::new(FileCache::new(4)),
            Arc::new(Counters::default()),
        );
        // Replays ack, new appends are refused, reads serve.
        assert!(block.write(0, 0, b"replay"));
        assert!(!block.write(3, 12, b"new"));
        assert!(!block.close());
        assert_eq!(block.read(0, 64).unwrap(), b"sealed-bytes");
    }

    #[test]
    fn window_counters_balance() {
        let dir = tempfile::tempdir().unwrap();
        let counters = Arc::new(Counters::default());
        let block = Block::new(
            BlockMeta {
                block_id: 10,
                version: 0,
                block_size: 0,
            },
            dir.path().join("010/10"),
            Arc::new(FileCache::new(4)),
            Arc::clone(&counters),
        );
        assert!(block.write(1, 4, b"late"));
        assert_eq!(counters.block_buffers.get(), 1);
        assert!(block.write(0, 0, b"earl"));
        assert_eq!(counters.block_buffers.get(), 0);
        assert_eq!(counters.data_size.get(), 8);
    }
}
