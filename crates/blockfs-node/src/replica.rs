//! Pull replication
//!
//! Fetches blocks this node was told to host from peer chunkservers. The
//! stream is pulled 256 KiB at a time by offset; `seq` is the pull-local
//! packet counter, so switching peers mid-stream is invisible to the
//! destination block as long as the offset is right. Every attempted block
//! ends up in one pull report, success or failure; the nameserver decides
//! what happens next.

use std::sync::Arc;
use tracing::{info, warn};

use blockfs_proto::chunkserver::ReadBlockRequest;
use blockfs_proto::nameserver::{PullBlockReportRequest, ReplicaInfo};

use crate::manager::BlockManager;
use crate::rpc::{NameServerApi, PeerChannel};

const PULL_READ_LEN: i32 = 256 * 1024;

pub struct PullReplicator {
    manager: Arc<BlockManager>,
    peers: Arc<dyn PeerChannel>,
    ns: Arc<dyn NameServerApi>,
}

impl PullReplicator {
    pub fn new(
        manager: Arc<BlockManager>,
        peers: Arc<dyn PeerChannel>,
        ns: Arc<dyn NameServerApi>,
    ) -> Self {
        Self { manager, peers, ns }
    }

    /// Pull every block in the batch, then report the whole batch.
    pub async fn pull_new_blocks(&self, replicas: Vec<ReplicaInfo>, chunkserver_id: i32) {
        let mut report = PullBlockReportRequest {
            sequence_id: 0,
            chunkserver_id,
            blocks: Vec::new(),
        };

        for info in replicas {
            let block_id = info.block_id;
            let Some(block) = self.manager.find_block(block_id, true) else {
                warn!("can't create block #{}", block_id);
                continue;
            };
            if info.chunkserver_address.is_empty() {
                warn!("no source chunkservers for pull #{}", block_id);
                drop(block);
                self.manager.remove_block(block_id);
                report.blocks.push(block_id);
                continue;
            }
            info!("start pull #{} from {}", block_id, info.chunkserver_address[0]);

            let sources = &info.chunkserver_address;
            let init = 0usize;
            let mut cur = init;
            let mut seq: i64 = 0;
            let mut offset: i64 = 0;
            let mut success = true;

            loop {
                let request = ReadBlockRequest {
                    sequence_id: seq,
                    block_id,
                    offset,
                    read_len: PULL_READ_LEN,
                    require_block_version: true,
                };
                let reply = match self.peers.read_block(&sources[cur], request).await {
                    Ok(reply) if reply.status == 0 => reply,
                    other => {
                        if let Err(e) = other {
                            warn!("pull #{} read from {} failed: {}", block_id, sources[cur], e);
                        }
                        // Rotate to the next peer; seq stays put so the
                        // retry re-requests the same range.
                        cur = (cur + 1) % sources.len();
                        if cur == init {
                            success = false;
                            break;
                        }
                        info!("change src chunkserver to {} for pull #{}", sources[cur], block_id);
                        continue;
                    }
                };

                let len = reply.databuf.len();
                if len > 0 {
                    if !block.write(seq as i32, offset, &reply.databuf) {
                        success = false;
                        break;
                    }
                    offset += len as i64;
                    seq += 1;
                } else {
                    // Empty buffer is the peer's end-of-block signal.
                    block.set_slice_num(seq as i32);
                    block.set_version(reply.block_version);
                }
                if block.is_complete() && self.manager.close_block(&block) {
                    info!("pull block #{} finish", block_id);
                    break;
                }
                if len == 0 {
                    // Peer said end-of-block but the window disagrees.
                    warn!("pull #{} end-of-block without completion", block_id);
                    success = false;
                    break;
                }
            }

            drop(block);
            if !success {
                self.manager.remove_block(block_id);
            }
            report.blocks.push(block_id);
        }

        let count = report.blocks.len();
        match self.ns.pull_block_report(report).await {
            Ok(_) => info!("report pull finish done, {} blocks", count),
            Err(e) => warn!("report pull finish fail: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    use blockfs_common::ChunkServerConfig;
    use blockfs_proto::chunkserver::{ReadBlockResponse, WriteBlockRequest, WriteBlockResponse};
    use blockfs_proto::nameserver::{
        BlockReportRequest, BlockReportResponse, HeartBeatRequest, HeartBeatResponse,
        PullBlockReportResponse,
    };

    use crate::counters::Counters;
    use crate::manager::open_manager;
    use crate::rpc::{RpcError, RpcResult};

    /// Scripted replies per peer address, consumed in order.
    struct ScriptedPeers {
        replies: Mutex<HashMap<String, Vec<RpcResult<ReadBlockResponse>>>>,
    }

    impl ScriptedPeers {
        fn new(script: Vec<(&str, Vec<RpcResult<ReadBlockResponse>>)>) -> Self {
            let mut replies = HashMap::new();
            for (addr, mut seq) in script {
                seq.reverse();
                replies.insert(addr.to_string(), seq);
            }
            Self {
                replies: Mutex::new(replies),
            }
        }
    }

    #[async_trait]
    impl PeerChannel for ScriptedPeers {
        async fn write_block(
            &self,
            _addr: &str,
            _request: WriteBlockRequest,
        ) -> RpcResult<WriteBlockResponse> {
            unreachable!("pulls never write to peers")
        }

        async fn read_block(
            &self,
            addr: &str,
            _request: ReadBlockRequest,
        ) -> RpcResult<ReadBlockResponse> {
            self.replies
                .lock()
                .get_mut(addr)
                .and_then(|v| v.pop())
                .unwrap_or_else(|| {
                    Err(RpcError::transport(14, format!("no script for {addr}")))
                })
        }
    }

    #[derive(Default)]
    struct CapturingNs {
        pulls: Mutex<Vec<PullBlockReportRequest>>,
    }

    #[async_trait]
    impl NameServerApi for CapturingNs {
        async fn heart_beat(&self, _r: HeartBeatRequest) -> RpcResult<HeartBeatResponse> {
            Ok(HeartBeatResponse::default())
        }

        async fn block_report(&self, _r: BlockReportRequest) -> RpcResult<BlockReportResponse> {
            Ok(BlockReportResponse::default())
        }

        async fn pull_block_report(
            &self,
            r: PullBlockReportRequest,
        ) -> RpcResult<PullBlockReportResponse> {
            self.pulls.lock().push(r);
            Ok(PullBlockReportResponse::default())
        }
    }

    fn data_reply(data: &[u8]) -> RpcResult<ReadBlockResponse> {
        Ok(ReadBlockResponse {
            sequence_id: 0,
            status: 0,
            databuf: data.to_vec(),
            block_version: 0,
            timestamp: vec![],
        })
    }

    fn end_reply(version: i64) -> RpcResult<ReadBlockResponse> {
        Ok(ReadBlockResponse {
            sequence_id: 0,
            status: 0,
            databuf: vec![],
            block_version: version,
            timestamp: vec![],
        })
    }

    fn status_reply(status: i32) -> RpcResult<ReadBlockResponse> {
        Ok(ReadBlockResponse {
            status,
            ..ReadBlockResponse::default()
        })
    }

    fn make_manager(dir: &std::path::Path) -> Arc<BlockManager> {
        let mut cfg = ChunkServerConfig::default();
        cfg.block_store_path = dir.to_str().unwrap().to_string();
        Arc::new(open_manager(&cfg, Arc::new(Counters::default())).unwrap())
    }

    fn replica(id: i64, peers: &[&str]) -> ReplicaInfo {
        ReplicaInfo {
            block_id: id,
            chunkserver_address: peers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn pull_streams_and_seals() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        let peers = Arc::new(ScriptedPeers::new(vec![(
            "a:1",
            vec![data_reply(b"0123"), data_reply(b"4567"), end_reply(1)],
        )]));
        let ns = Arc::new(CapturingNs::default());
        let repl = PullReplicator::new(Arc::clone(&manager), peers, Arc::clone(&ns) as Arc<dyn NameServerApi>);

        repl.pull_new_blocks(vec![replica(77, &["a:1"])], 3).await;

        let block = manager.find_block(77, false).unwrap();
        assert_eq!(block.read(0, 64).unwrap(), b"01234567");
        assert_eq!(block.version(), 1);
        assert_eq!(block.size(), 8);

        let pulls = ns.pulls.lock();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].blocks, vec![77]);
        assert_eq!(pulls[0].chunkserver_id, 3);
    }

    #[tokio::test]
    async fn pull_fails_over_mid_stream() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        // Peer A serves the first chunk then errors; B picks up at the
        // same offset and finishes.
        let peers = Arc::new(ScriptedPeers::new(vec![
            ("a:1", vec![data_reply(b"0123"), status_reply(1)]),
            ("b:1", vec![data_reply(b"4567"), end_reply(1)]),
        ]));
        let ns = Arc::new(CapturingNs::default());
        let repl = PullReplicator::new(Arc::clone(&manager), peers, Arc::clone(&ns) as Arc<dyn NameServerApi>);

        repl.pull_new_blocks(vec![replica(77, &["a:1", "b:1"])], 3).await;

        let block = manager.find_block(77, false).unwrap();
        assert_eq!(block.read(0, 64).unwrap(), b"01234567");
        assert_eq!(block.version(), 1);
        assert_eq!(ns.pulls.lock()[0].blocks, vec![77]);
    }

    #[tokio::test]
    async fn full_cycle_of_failures_removes_block() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        let peers = Arc::new(ScriptedPeers::new(vec![
            ("a:1", vec![status_reply(1)]),
            ("b:1", vec![Err(RpcError::transport(14, "down"))]),
        ]));
        let ns = Arc::new(CapturingNs::default());
        let repl = PullReplicator::new(Arc::clone(&manager), peers, Arc::clone(&ns) as Arc<dyn NameServerApi>);

        repl.pull_new_blocks(vec![replica(9, &["a:1", "b:1"])], 3).await;

        // Failed pulls leave no local trace but are still reported.
        assert!(manager.find_block(9, false).is_none());
        assert_eq!(ns.pulls.lock()[0].blocks, vec![9]);
    }

    #[tokio::test]
    async fn empty_source_list_removes_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        let peers = Arc::new(ScriptedPeers::new(vec![]));
        let ns = Arc::new(CapturingNs::default());
        let repl = PullReplicator::new(Arc::clone(&manager), peers, Arc::clone(&ns) as Arc<dyn NameServerApi>);

        repl.pull_new_blocks(vec![replica(5, &[])], 1).await;

        assert!(manager.find_block(5, false).is_none());
        assert_eq!(ns.pulls.lock()[0].blocks, vec![5]);
    }
}
