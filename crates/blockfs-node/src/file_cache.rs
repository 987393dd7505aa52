//! Open-file-handle cache
//!
//! Read paths go through pread on cached handles so hot blocks do not pay
//! an open/close per request. The cache must be told to evict before a
//! block file is unlinked; a cached handle would otherwise keep serving
//! the deleted inode.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct FileCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// path -> (handle, recency stamp)
    map: HashMap<PathBuf, (Arc<File>, u64)>,
    /// recency stamp -> path; oldest first
    order: BTreeMap<u64, PathBuf>,
    tick: u64,
}

impl FileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Fetch a read handle for `path`, opening and caching it on miss.
    pub fn get(&self, path: &Path) -> io::Result<Arc<File>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        if let Some((file, stamp)) = inner.map.get_mut(path) {
            let file = Arc::clone(file);
            let old = *stamp;
            *stamp = tick;
            inner.order.remove(&old);
            inner.order.insert(tick, path.to_path_buf());
            return Ok(file);
        }

        // Open outside the map borrow; still under the cache lock, which
        // keeps eviction and insertion atomic.
        let file = Arc::new(File::open(path)?);
        if inner.map.len() >= self.capacity {
            if let Some((&oldest, _)) = inner.order.iter().next() {
                if let Some(victim) = inner.order.remove(&oldest) {
                    inner.map.remove(&victim);
                }
            }
        }
        inner.map.insert(path.to_path_buf(), (Arc::clone(&file), tick));
        inner.order.insert(tick, path.to_path_buf());
        Ok(file)
    }

    /// Drop the cached handle for `path`, if any. Must run before unlink.
    pub fn evict(&self, path: &Path) {
        let mut inner = self.inner.lock();
        if let Some((_, stamp)) = inner.map.remove(path) {
            inner.order.remove(&stamp);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map.len()
    }
}
