//! Persistent block metadata store
//!
//! A redb database under `meta/` in the first store path. Exactly two key
//! shapes live in one table: the reserved namespace-version key (eight NUL
//! bytes + `"version"`) and block keys, the decimal block id right-justified
//! in a 13-byte ASCII field. The block-key format makes byte-ordered scans
//! return ascending block ids for any lower bound formatted the same way.

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use blockfs_common::{Error, Result};

const META_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("block_meta");

/// Reserved key holding the 8-byte LE namespace version.
const VERSION_KEY: &[u8; 15] = b"\0\0\0\0\0\0\0\0version";

/// Fixed-layout persistent descriptor of a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockMeta {
    pub block_id: i64,
    /// 0 while the block is still being written
    pub version: i64,
    /// Total bytes once sealed
    pub block_size: i64,
}

impl BlockMeta {
    pub const ENCODED_LEN: usize = 24;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..8].copy_from_slice(&self.block_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.block_size.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != Self::ENCODED_LEN {
            return Err(Error::meta(format!(
                "bad meta record length: {}",
                data.len()
            )));
        }
        Ok(Self {
            block_id: i64::from_le_bytes(data[..8].try_into().unwrap()),
            version: i64::from_le_bytes(data[8..16].try_into().unwrap()),
            block_size: i64::from_le_bytes(data[16..24].try_into().unwrap()),
        })
    }
}

/// Block id formatted as its meta-store key.
pub fn block_key(block_id: i64) -> Vec<u8> {
    format!("{block_id:13}").into_bytes()
}

pub struct MetaStore {
    db: Database,
    // Serializes read-modify-write of the version key.
    version_mu: Mutex<()>,
}

impl MetaStore {
    /// Open (or create) the store under `<store_path>/meta/`.
    pub fn open(store_path: &str) -> Result<Self> {
        let dir = Path::new(store_path).join("meta");
        std::fs::create_dir_all(&dir)?;
        let db = Database::create(dir.join("meta.redb"))
            .map_err(|e| Error::meta(format!("open meta db: {e}")))?;
        let wtx = db.begin_write().map_err(|e| Error::meta(e.to_string()))?;
        wtx.open_table(META_TABLE)
            .map_err(|e| Error::meta(e.to_string()))?;
        wtx.commit().map_err(|e| Error::meta(e.to_string()))?;
        Ok(Self {
            db,
            version_mu: Mutex::new(()),
        })
    }

    /// Namespace version, 0 when never set.
    pub fn namespace_version(&self) -> Result<i64> {
        let _guard = self.version_mu.lock();
        let rtx = self.db.begin_read().map_err(|e| Error::meta(e.to_string()))?;
        let table = rtx
            .open_table(META_TABLE)
            .map_err(|e| Error::meta(e.to_string()))?;
        match table
            .get(&VERSION_KEY[..])
            .map_err(|e| Error::meta(e.to_string()))?
        {
            Some(v) if v.value().len() == 8 => {
                Ok(i64::from_le_bytes(v.value().try_into().unwrap()))
            }
            Some(v) => {
                warn!("namespace version record has length {}", v.value().len());
                Ok(0)
            }
            None => Ok(0),
        }
    }

    pub fn set_namespace_version(&self, version: i64) -> Result<()> {
        let _guard = self.version_mu.lock();
        let wtx = self.db.begin_write().map_err(|e| Error::meta(e.to_string()))?;
        {
            let mut table = wtx
                .open_table(META_TABLE)
                .map_err(|e| Error::meta(e.to_string()))?;
            table
                .insert(&VERSION_KEY[..], &version.to_le_bytes()[..])
                .map_err(|e| Error::meta(e.to_string()))?;
        }
        wtx.commit().map_err(|e| Error::meta(e.to_string()))?;
        Ok(())
    }

    /// Persist one meta row. Returns the elapsed time so write-path latency
    /// accounting can attribute the sync cost.
    pub fn put_meta(&self, meta: &BlockMeta) -> Result<Duration> {
        let start = Instant::now();
        let key = block_key(meta.block_id);
        let wtx = self.db.begin_write().map_err(|e| Error::meta(e.to_string()))?;
        {
            let mut table = wtx
                .open_table(META_TABLE)
                .map_err(|e| Error::meta(e.to_string()))?;
            table
                .insert(&key[..], &meta.encode()[..])
                .map_err(|e| Error::meta(e.to_string()))?;
        }
        wtx.commit().map_err(|e| Error::meta(e.to_string()))?;
        let elapsed = start.elapsed();
        debug!(
            block_id = meta.block_id,
            micros = elapsed.as_micros() as i64,
            "meta row persisted"
        );
        Ok(elapsed)
    }

    pub fn delete_meta(&self, block_id: i64) -> Result<()> {
        let key = block_key(block_id);
        let wtx = self.db.begin_write().map_err(|e| Error::meta(e.to_string()))?;
        {
            let mut table = wtx
                .open_table(META_TABLE)
                .map_err(|e| Error::meta(e.to_string()))?;
            table
                .remove(&key[..])
                .map_err(|e| Error::meta(e.to_string()))?;
        }
        wtx.commit().map_err(|e| Error::meta(e.to_string()))?;
        Ok(())
    }

    /// Metas in ascending id order starting at `from_id`, at most `limit`.
    ///
    /// The version key sorts before every block key (NUL bytes vs. ASCII
    /// spaces), so a range from a formatted lower bound never sees it.
    pub fn scan(&self, from_id: i64, limit: usize) -> Result<Vec<BlockMeta>> {
        let start = block_key(from_id);
        let rtx = self.db.begin_read().map_err(|e| Error::meta(e.to_string()))?;
        let table = rtx
            .open_table(META_TABLE)
            .map_err(|e| Error::meta(e.to_string()))?;
        let mut out = Vec::new();
        for entry in table
            .range(&start[..]..)
            .map_err(|e| Error::meta(e.to_string()))?
        {
            if out.len() >= limit {
                break;
            }
            let (key, value) = entry.map_err(|e| Error::meta(e.to_string()))?;
            let meta = BlockMeta::decode(value.value())?;
            if block_key(meta.block_id) != key.value() {
                return Err(Error::meta(format!(
                    "meta key does not match record id {}",
                    meta.block_id
                )));
            }
            out.push(meta);
        }
        Ok(out)
    }
}
