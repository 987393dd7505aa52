//! Block registry
//!
//! Owns the canonical in-memory handle for every block on this node and
//! keeps it paired with its persistent meta row. All data paths go through
//! `find_block`; creation persists the meta row before the handle is handed
//! out, and removal tears down cache entry, disk file, meta row, and map
//! entry in that order.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use blockfs_common::{ChunkServerConfig, Result};

use crate::block::Block;
use crate::counters::Counters;
use crate::disk::DiskPlacer;
use crate::file_cache::FileCache;
use crate::meta::{BlockMeta, MetaStore};

pub struct BlockManager {
    placer: DiskPlacer,
    meta: MetaStore,
    file_cache: Arc<FileCache>,
    counters: Arc<Counters>,
    blocks: Mutex<HashMap<i64, Arc<Block>>>,
    namespace_version: AtomicI64,
    disk_quota: AtomicI64,
}

impl BlockManager {
    /// Open the store paths and the meta database. Failure here is fatal
    /// to the node.
    pub fn new(config: &ChunkServerConfig, counters: Arc<Counters>) -> Result<Self> {
        let placer = DiskPlacer::new(&config.block_store_path)?;
        let meta = MetaStore::open(placer.primary())?;
        let file_cache = Arc::new(FileCache::new(config.chunkserver_file_cache_size));
        let disk_quota = placer.disk_quota();
        Ok(Self {
            placer,
            meta,
            file_cache,
            counters,
            blocks: Mutex::new(HashMap::new()),
            namespace_version: AtomicI64::new(0),
            disk_quota: AtomicI64::new(disk_quota),
        })
    }

    /// Rebuild the registry from the meta store.
    pub fn load_storage(&self) -> Result<()> {
        self.namespace_version
            .store(self.meta.namespace_version()?, Ordering::Release);

        let mut loaded = 0i64;
        let mut data_size = 0i64;
        let mut from = 0i64;
        loop {
            let batch = self.meta.scan(from, 1000)?;
            let done = batch.len() < 1000;
            for meta in &batch {
                let block = Arc::new(Block::new(
                    *meta,
                    self.placer.file_path(meta.block_id),
                    Arc::clone(&self.file_cache),
                    Arc::clone(&self.counters),
                ));
                data_size += block.disk_used();
                self.blocks.lock().insert(meta.block_id, block);
                loaded += 1;
                from = meta.block_id + 1;
            }
            if done {
                break;
            }
        }
        self.counters.blocks.add(loaded);
        self.counters.data_size.add(data_size);
        self.disk_quota.fetch_add(data_size, Ordering::Relaxed);

        let version = self.namespace_version();
        info!("loaded {} blocks, namespace version {}", loaded, version);
        if version == 0 && loaded > 0 {
            warn!("namespace version lost");
        }
        Ok(())
    }

    pub fn namespace_version(&self) -> i64 {
        self.namespace_version.load(Ordering::Acquire)
    }

    pub fn set_namespace_version(&self, version: i64) -> Result<()> {
        self.meta.set_namespace_version(version)?;
        self.namespace_version.store(version, Ordering::Release);
        info!("set namespace version {}", version);
        Ok(())
    }

    pub fn disk_quota(&self) -> i64 {
        self.disk_quota.load(Ordering::Relaxed)
    }

    pub fn block_num(&self) -> i64 {
        self.blocks.lock().len() as i64
    }

    /// Look up a block, optionally creating it. Creation persists the meta
    /// row outside the registry lock; on persistence failure the map entry
    /// is rolled back and the caller sees a miss.
    pub fn find_block(&self, block_id: i64, create_if_missing: bool) -> Option<Arc<Block>> {
        self.counters.find_ops.inc();
        {
            let map = self.blocks.lock();
            if let Some(block) = map.get(&block_id) {
                return Some(Arc::clone(block));
            }
            if !create_if_missing {
                return None;
            }
        }

        let meta = BlockMeta {
            block_id,
            version: 0,
            block_size: 0,
        };
        let block = Arc::new(Block::new(
            meta,
            self.placer.file_path(block_id),
            Arc::clone(&self.file_cache),
            Arc::clone(&self.counters),
        ));

        {
            let mut map = self.blocks.lock();
            // A concurrent creator may have won the race while we were
            // constructing; hand out its handle.
            if let Some(existing) = map.get(&block_id) {
                return Some(Arc::clone(existing));
            }
            map.insert(block_id, Arc::clone(&block));
        }

        // The meta write can sit in the fsync region; everyone else keeps
        // using the registry meanwhile.
        match self.meta.put_meta(&meta) {
            Ok(_) => {
                self.counters.blocks.inc();
                Some(block)
            }
            Err(e) => {
                warn!("create #{} meta write failed: {}", block_id, e);
                self.blocks.lock().remove(&block_id);
                None
            }
        }
    }

    /// Metas in ascending id order starting at `from_id`.
    pub fn list_blocks(&self, from_id: i64, limit: usize) -> Result<Vec<BlockMeta>> {
        self.meta.scan(from_id, limit)
    }

    /// Seal a block and re-persist its meta. True only for the first
    /// successful close, so the caller reports completion exactly once.
    pub fn close_block(&self, block: &Block) -> bool {
        if !block.close() {
            return false;
        }
        match self.meta.put_meta(&block.meta()) {
            Ok(_) => true,
            Err(e) => {
                warn!("close #{} meta write failed: {}", block.id(), e);
                false
            }
        }
    }

    /// Remove a block: deleted flag, cache eviction, unlink, meta row, map
    /// entry. Returns false when the block is absent, already being
    /// deleted elsewhere, or the meta delete failed (the entry then stays
    /// for a retry).
    pub fn remove_block(&self, block_id: i64) -> bool {
        let block = {
            let map = self.blocks.lock();
            match map.get(&block_id) {
                Some(block) => Arc::clone(block),
                None => {
                    info!("remove missing block #{}", block_id);
                    return false;
                }
            }
        };
        if !block.set_deleted() {
            info!("#{} already deleted by another caller", block_id);
            return false;
        }

        let du = block.disk_used();
        let file_path = block.file_path();
        self.file_cache.evict(file_path);
        match std::fs::remove_file(file_path) {
            Ok(()) => info!("remove #{} disk file done", block_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && du == 0 => {
                info!("remove #{}: no disk file, zero usage", block_id);
            }
            Err(e) => {
                warn!(
                    "remove #{} disk file {:?} ({} bytes) failed: {}",
                    block_id, file_path, du, e
                );
            }
        }

        match self.meta.delete_meta(block_id) {
            Ok(()) => {
                self.blocks.lock().remove(&block_id);
                self.counters.blocks.dec();
                self.counters.data_size.sub(du);
                info!("remove #{} meta done", block_id);
                true
            }
            Err(e) => {
                warn!("remove #{} meta failed: {}", block_id, e);
                false
            }
        }
    }

}

impl std::fmt::Debug for BlockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockManager")
            .field("blocks", &self.block_num())
            .field("namespace_version", &self.namespace_version())
            .finish()
    }
}

/// Convenience constructor used by tests and the daemon alike.
pub fn open_manager(config: &ChunkServerConfig, counters: Arc<Counters>) -> Result<BlockManager> {
    let manager = BlockManager::new(config, counters)?;
    manager.load_storage()?;
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> ChunkServerConfig {
        let mut cfg = ChunkServerConfig::default();
        cfg.block_store_path = dir.to_str().unwrap().to_string();
        cfg
    }

    fn open(dir: &std::path::Path) -> BlockManager {
        open_manager(&test_config(dir), Arc::new(Counters::default())).unwrap()
    }

    #[test]
    fn create_persists_meta_row() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = open(dir.path());
        assert!(mgr.find_block(42, false).is_none());
        let block = mgr.find_block(42, true).unwrap();
        assert_eq!(block.id(), 42);

        let rows = mgr.list_blocks(0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].block_id, 42);
        assert_eq!(rows[0].version, 0);
    }

    #[test]
    fn concurrent_finders_share_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(open(dir.path()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            handles.push(std::thread::spawn(move || {
                mgr.find_block(7, true).unwrap()
            }));
        }
        let blocks: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for b in &blocks[1..] {
            assert!(Arc::ptr_eq(&blocks[0], b));
        }
        assert_eq!(mgr.list_blocks(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn close_block_seals_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = open(dir.path());
        let block = mgr.find_block(5, true).unwrap();
        assert!(block.write(0, 0, b"hello"));
        block.set_slice_num(1);
        // Version is the last packet seq; seq 0 here.
        block.set_version(0);
        assert!(block.is_complete());
        assert!(mgr.close_block(&block));
        assert!(!mgr.close_block(&block));

        let rows = mgr.list_blocks(5, 1).unwrap();
        assert_eq!(rows[0].block_size, 5);
    }

    #[test]
    fn remove_block_tears_everything_down() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = open(dir.path());
        let block = mgr.find_block(9, true).unwrap();
        assert!(block.write(0, 0, b"bytes"));
        let path = block.file_path().clone();
        assert!(path.exists());
        drop(block);

        assert!(mgr.remove_block(9));
        assert!(mgr.find_block(9, false).is_none());
        assert!(!path.exists());
        assert!(mgr.list_blocks(0, 10).unwrap().is_empty());

        // Gone means gone.
        assert!(!mgr.remove_block(9));
    }

    #[test]
    fn remove_tolerates_missing_file_with_zero_usage() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = open(dir.path());
        mgr.find_block(3, true).unwrap();
        // No write ever happened, so no file exists.
        assert!(mgr.remove_block(3));
    }

    #[test]
    fn registry_and_meta_agree_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mgr = open(dir.path());
            let b1 = mgr.find_block(1, true).unwrap();
            assert!(b1.write(0, 0, b"one"));
            b1.set_slice_num(1);
            b1.set_version(0);
            assert!(mgr.close_block(&b1));
            mgr.find_block(2, true).unwrap();
            mgr.set_namespace_version(7).unwrap();
        }

        let mgr = open(dir.path());
        assert_eq!(mgr.namespace_version(), 7);
        let rows = mgr.list_blocks(0, 10).unwrap();
        assert_eq!(rows.len(), 2);
        for meta in rows {
            assert!(mgr.find_block(meta.block_id, false).is_some());
        }
        // Sealed content still readable through the reloaded handle.
        let b1 = mgr.find_block(1, false).unwrap();
        assert_eq!(b1.read(0, 16).unwrap(), b"one");
        assert_eq!(b1.version(), 0);
    }

    #[test]
    fn counters_track_block_population() {
        let dir = tempfile::tempdir().unwrap();
        let counters = Arc::new(Counters::default());
        let mgr = open_manager(&test_config(dir.path()), Arc::clone(&counters)).unwrap();
        mgr.find_block(1, true).unwrap();
        mgr.find_block(2, true).unwrap();
        assert_eq!(counters.blocks.get(), 2);
        mgr.remove_block(1);
        assert_eq!(counters.blocks.get(), 1);
    }
}
