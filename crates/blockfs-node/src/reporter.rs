//! Reporting loops
//!
//! Two independent periodic tasks keep the node reconciled with the
//! nameserver: a heartbeat on its own single-worker pool, and a block
//! report on the work pool that sweeps the id space in batches and drives
//! obsolete-block deletion and new-replica pulls. The response state
//! machine is the only place the node's identity (chunkserver id,
//! namespace version) changes.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{error, info, warn};

use blockfs_proto::nameserver::{
    BlockReportRequest, BlockReportResponse, HeartBeatRequest, ReportBlockInfo,
};

use crate::block::Block;
use crate::counters::Counters;
use crate::manager::BlockManager;
use crate::pool::TaskPool;
use crate::replica::PullReplicator;
use crate::rpc::NameServerApi;
use crate::UNKNOWN_CHUNKSERVER_ID;

pub struct Reporter {
    manager: Arc<BlockManager>,
    ns: Arc<dyn NameServerApi>,
    replicator: Arc<PullReplicator>,
    counters: Arc<Counters>,
    work_pool: Arc<TaskPool>,
    write_pool: Arc<TaskPool>,
    heartbeat_pool: Arc<TaskPool>,

    chunkserver_id: AtomicI32,
    data_server_addr: String,
    /// Block-report cursor: last reported id, -1 before a sweep starts.
    /// Blocks created below the cursor mid-sweep surface on the next full
    /// sweep, which the report cadence makes acceptable.
    last_report_id: AtomicI64,

    heartbeat_interval_ms: u64,
    blockreport_interval_ms: u64,
    blockreport_size: usize,

    shutdown_tx: watch::Sender<bool>,
    weak: Weak<Reporter>,
}

impl Reporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<BlockManager>,
        ns: Arc<dyn NameServerApi>,
        replicator: Arc<PullReplicator>,
        counters: Arc<Counters>,
        work_pool: Arc<TaskPool>,
        write_pool: Arc<TaskPool>,
        heartbeat_pool: Arc<TaskPool>,
        data_server_addr: String,
        heartbeat_interval_ms: u64,
        blockreport_interval_ms: u64,
        blockreport_size: usize,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            manager,
            ns,
            replicator,
            counters,
            work_pool,
            write_pool,
            heartbeat_pool,
            chunkserver_id: AtomicI32::new(UNKNOWN_CHUNKSERVER_ID),
            data_server_addr,
            last_report_id: AtomicI64::new(-1),
            heartbeat_interval_ms,
            blockreport_interval_ms,
            blockreport_size,
            shutdown_tx,
            weak: weak.clone(),
        })
    }

    pub fn chunkserver_id(&self) -> i32 {
        self.chunkserver_id.load(Ordering::Acquire)
    }

    /// Resolves to `true` when the nameserver declared this node dead.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Kick off both periodic loops.
    pub fn start(&self) {
        self.schedule_heartbeat(0);
        self.schedule_block_report(0);
    }

    fn schedule_heartbeat(&self, delay_ms: u64) {
        let weak = self.weak.clone();
        self.heartbeat_pool.delay_task(delay_ms, async move {
            if let Some(this) = weak.upgrade() {
                this.send_heartbeat().await;
                // Reschedule unconditionally.
                this.schedule_heartbeat(this.heartbeat_interval_ms);
            }
        });
    }

    fn schedule_block_report(&self, delay_ms: u64) {
        let weak = self.weak.clone();
        self.work_pool.delay_task(delay_ms, async move {
            if let Some(this) = weak.upgrade() {
                this.send_block_report().await;
                this.schedule_block_report(this.blockreport_interval_ms);
            }
        });
    }

    pub async fn send_heartbeat(&self) {
        let request = HeartBeatRequest {
            chunkserver_id: self.chunkserver_id(),
            chunkserver_addr: self.data_server_addr.clone(),
            namespace_version: self.manager.namespace_version(),
            block_num: self.counters.blocks.get(),
            data_size: self.counters.data_size.get(),
            buffers: self.counters.block_buffers.get(),
        };
        match self.ns.heart_beat(request).await {
            Err(e) => warn!("heartbeat fail: {}", e),
            Ok(resp) => {
                let local = self.manager.namespace_version();
                if resp.namespace_version != local {
                    // The block reporter owns the switch; just surface it.
                    info!(
                        "namespace version mismatch self:{} ns:{}",
                        local, resp.namespace_version
                    );
                }
            }
        }
    }

    /// One report batch: sweep from the cursor, send, apply the response.
    pub async fn send_block_report(&self) {
        let from = self.last_report_id.load(Ordering::Acquire) + 1;
        let blocks = match self.manager.list_blocks(from, self.blockreport_size) {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!("list blocks for report failed: {}", e);
                return;
            }
        };

        let is_complete = blocks.len() < self.blockreport_size;
        if is_complete {
            self.last_report_id.store(-1, Ordering::Release);
        } else if let Some(last) = blocks.last() {
            self.last_report_id.store(last.block_id, Ordering::Release);
        }

        let request = BlockReportRequest {
            chunkserver_id: self.chunkserver_id(),
            chunkserver_addr: self.data_server_addr.clone(),
            disk_quota: self.manager.disk_quota(),
            namespace_version: self.manager.namespace_version(),
            blocks: blocks
                .iter()
                .map(|m| ReportBlockInfo {
                    block_id: m.block_id,
                    block_size: m.block_size,
                    version: m.version,
                })
                .collect(),
            is_complete,
        };

        match self.ns.block_report(request).await {
            Err(e) => warn!("block report fail: {}", e),
            Ok(resp) => self.apply_report_response(resp),
        }
    }

    /// The response state machine. Identity changes happen here and only
    /// here; obsolete deletions and pulls are dispatched to the write pool.
    pub fn apply_report_response(&self, resp: BlockReportResponse) {
        if resp.status != 0 {
            error!("block report returned {}, requesting shutdown", resp.status);
            self.shutdown_tx.send_replace(true);
            return;
        }

        let local_version = self.manager.namespace_version();
        let local_id = self.chunkserver_id();
        if resp.namespace_version != local_version {
            // Nameserver reset or new cluster; the node is considered
            // empty and will re-offer its blocks on following sweeps.
            info!(
                "new namespace version: {} chunkserver id: {}",
                resp.namespace_version, resp.chunkserver_id
            );
            if let Err(e) = self.manager.set_namespace_version(resp.namespace_version) {
                error!("can not change namespace version: {}", e);
                self.shutdown_tx.send_replace(true);
                return;
            }
            self.chunkserver_id
                .store(resp.chunkserver_id, Ordering::Release);
        } else if local_id == UNKNOWN_CHUNKSERVER_ID
            && resp.chunkserver_id != UNKNOWN_CHUNKSERVER_ID
        {
            // Rejoin after restart.
            self.chunkserver_id
                .store(resp.chunkserver_id, Ordering::Release);
            info!(
                "reconnect to nameserver, version {} new cs_id {}",
                local_version, resp.chunkserver_id
            );
        } else if resp.chunkserver_id == UNKNOWN_CHUNKSERVER_ID {
            // Nameserver rejects our identity; keep the old id and retry
            // on the next cycle.
            info!(
                "old chunkserver, namespace version {} old id {}",
                local_version, local_id
            );
        } else if resp.chunkserver_id != local_id {
            // Nameserver restart reassigned us.
            info!(
                "chunkserver id change from {} to {}",
                local_id, resp.chunkserver_id
            );
            self.chunkserver_id
                .store(resp.chunkserver_id, Ordering::Release);
        }

        if !resp.obsolete_blocks.is_empty() {
            let manager = Arc::clone(&self.manager);
            let obsolete = resp.obsolete_blocks;
            self.write_pool.add_task(async move {
                for block_id in obsolete {
                    if !manager.remove_block(block_id) {
                        info!("remove block fail: #{}", block_id);
                    }
                }
            });
        }

        if !resp.new_replicas.is_empty() {
            info!("block report done, {} replica blocks", resp.new_replicas.len());
            let replicator = Arc::clone(&self.replicator);
            let chunkserver_id = self.chunkserver_id();
            let new_replicas = resp.new_replicas;
            self.write_pool.add_task(async move {
                replicator.pull_new_blocks(new_replicas, chunkserver_id).await;
            });
        }
    }

    /// One-off report for a just-sealed block; fire-and-forget beyond the
    /// transport's own retries.
    pub async fn report_finish(&self, block: &Block) {
        let request = BlockReportRequest {
            chunkserver_id: self.chunkserver_id(),
            chunkserver_addr: self.data_server_addr.clone(),
            disk_quota: self.manager.disk_quota(),
            namespace_version: self.manager.namespace_version(),
            blocks: vec![ReportBlockInfo {
                block_id: block.id(),
                block_size: block.size(),
                version: 0,
            }],
            is_complete: false,
        };
        match self.ns.block_report(request).await {
            Err(e) => warn!("report finish fail #{}: {}", block.id(), e),
            Ok(_) => info!("report finish done #{}", block.id()),
        }
    }
}
