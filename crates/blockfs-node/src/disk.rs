//! Store-path selection
//!
//! Parses the configured store-path list at startup and maps block ids to
//! store paths. Placement is `paths[id mod N]` over the sorted,
//! deduplicated list, so a block lands on the same path across restarts.

use std::path::PathBuf;
use tracing::{info, warn};

use blockfs_common::{Error, Result};

pub struct DiskPlacer {
    store_paths: Vec<String>,
    disk_quota: i64,
}

impl DiskPlacer {
    /// Parse a comma-separated store-path list. Paths whose filesystem
    /// cannot be statted are dropped with a warning; an empty surviving
    /// list is fatal.
    pub fn new(block_store_path: &str) -> Result<Self> {
        let mut store_paths = Vec::new();
        let mut disk_quota: i64 = 0;

        for raw in block_store_path.split(',') {
            let mut path = raw.trim().to_string();
            if path.is_empty() {
                continue;
            }
            if !path.ends_with('/') {
                path.push('/');
            }
            match (fs2::total_space(&path), fs2::available_space(&path)) {
                (Ok(total), Ok(available)) => {
                    info!(
                        "use store path: {} disk {} available {}",
                        path, total, available
                    );
                    disk_quota += available as i64;
                    store_paths.push(path);
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!("stat store path {} failed, ignore it: {}", path, e);
                }
            }
        }

        store_paths.sort();
        store_paths.dedup();
        if store_paths.is_empty() {
            return Err(Error::Config(format!(
                "no usable store path in {block_store_path:?}"
            )));
        }
        info!("{} store path(s) used", store_paths.len());

        Ok(Self {
            store_paths,
            disk_quota,
        })
    }

    /// Store path hosting `block_id`. Pure in the path list and the id.
    pub fn place(&self, block_id: i64) -> &str {
        let n = self.store_paths.len() as i64;
        &self.store_paths[block_id.rem_euclid(n) as usize]
    }

    /// `<store path>/NNN/<block_id>`, NNN = id mod 1000.
    pub fn file_path(&self, block_id: i64) -> PathBuf {
        let dir = block_id.rem_euclid(1000);
        PathBuf::from(self.place(block_id)).join(format!("{dir:03}/{block_id}"))
    }

    /// First store path; hosts the meta database.
    pub fn primary(&self) -> &str {
        &self.store_paths[0]
    }

    /// Available bytes summed across paths at startup.
    pub fn disk_quota(&self) -> i64 {
        self.disk_quota
    }

    pub fn paths(&self) -> &[String] {
        &self.store_paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trims_and_slashes() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().to_str().unwrap();
        let placer = DiskPlacer::new(&format!(" {p} , {p}/")).unwrap();
        // Dedup leaves one path, with a trailing slash.
        assert_eq!(placer.paths().len(), 1);
        assert!(placer.paths()[0].ends_with('/'));
        assert!(placer.disk_quota() > 0);
    }

    #[test]
    fn drops_unstatable_paths() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().to_str().unwrap();
        let placer = DiskPlacer::new(&format!("/nonexistent-blockfs-path,{p}")).unwrap();
        assert_eq!(placer.paths().len(), 1);
    }

    #[test]
    fn no_usable_path_is_fatal() {
        assert!(DiskPlacer::new("/nonexistent-blockfs-path").is_err());
        assert!(DiskPlacer::new("").is_err());
    }

    #[test]
    fn placement_is_pure_and_modular() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let list = format!(
            "{},{}",
            a.path().to_str().unwrap(),
            b.path().to_str().unwrap()
        );
        let placer = DiskPlacer::new(&list).unwrap();
        let placer2 = DiskPlacer::new(&list).unwrap();
        for id in 0..16 {
            assert_eq!(placer.place(id), placer2.place(id));
        }
        assert_ne!(placer.place(0), placer.place(1));
        assert_eq!(placer.place(0), placer.place(2));
    }

    #[test]
    fn file_path_uses_three_digit_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let placer = DiskPlacer::new(dir.path().to_str().unwrap()).unwrap();
        let p = placer.file_path(1042);
        assert!(p.to_str().unwrap().ends_with("042/1042"));
        let p = placer.file_path(7);
        assert!(p.to_str().unwrap().ends_with("007/7"));
    }
}
