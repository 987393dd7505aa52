//! Chunkserver RPC service
//!
//! The write pipeline: admission control at the door, chain forwarding to
//! the next replica, then the local sequenced append on the write pool.
//! Reads and block-info lookups run on the read pool. Handlers answer
//! with in-band status codes; transport errors never leak upstream.

use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use blockfs_common::{status, Error};
use blockfs_proto::chunkserver::chunk_server_server::ChunkServer;
use blockfs_proto::chunkserver::{
    GetBlockInfoRequest, GetBlockInfoResponse, ReadBlockRequest, ReadBlockResponse,
    WriteBlockRequest, WriteBlockResponse,
};

use crate::counters::Counters;
use crate::manager::BlockManager;
use crate::now_micros;
use crate::pool::TaskPool;
use crate::reporter::Reporter;
use crate::rpc::PeerChannel;

/// Delay before re-sending a chain packet the downstream could not buffer.
const CHAIN_RETRY_MS: u64 = 10;

#[derive(Clone)]
pub struct ChunkServerImpl {
    manager: Arc<BlockManager>,
    counters: Arc<Counters>,
    peers: Arc<dyn PeerChannel>,
    reporter: Arc<Reporter>,
    work_pool: Arc<TaskPool>,
    read_pool: Arc<TaskPool>,
    write_pool: Arc<TaskPool>,
    max_pending_buffers: i64,
    write_buf_size: usize,
}

impl ChunkServerImpl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<BlockManager>,
        counters: Arc<Counters>,
        peers: Arc<dyn PeerChannel>,
        reporter: Arc<Reporter>,
        work_pool: Arc<TaskPool>,
        read_pool: Arc<TaskPool>,
        write_pool: Arc<TaskPool>,
        max_pending_buffers: i64,
        write_buf_size: usize,
    ) -> Self {
        Self {
            manager,
            counters,
            peers,
            reporter,
            work_pool,
            read_pool,
            write_pool,
            max_pending_buffers,
            write_buf_size,
        }
    }

    /// Start the reporting loops and the per-second status log line.
    pub fn start(&self) {
        self.reporter.start();
        self.schedule_status_log();
    }

    fn schedule_status_log(&self) {
        let svc = self.clone();
        self.work_pool.delay_task(1000, async move {
            let rates = svc.counters.gather();
            info!(
                "[status] blocks {} {} buffers {} data {}B, find {} read {} write {} {} {}B, \
                 rpc_delay {} {}",
                svc.counters.writing_blocks.get(),
                svc.counters.blocks.get(),
                svc.counters.block_buffers.get(),
                svc.counters.data_size.get(),
                rates.find_ops,
                rates.read_ops,
                rates.write_ops,
                rates.refuse_ops,
                rates.write_bytes,
                rates.rpc_delay,
                rates.rpc_delay_all,
            );
            svc.schedule_status_log();
        });
    }

    /// Drain every pool; queued work finishes, new work is refused.
    pub async fn stop(&self) {
        self.work_pool.stop().await;
        self.read_pool.stop().await;
        self.write_pool.stop().await;
    }

    /// Chain forwarding plus local append, already past admission.
    async fn process_write(
        &self,
        request: WriteBlockRequest,
        mut response: WriteBlockResponse,
    ) -> WriteBlockResponse {
        response.timestamp.push(now_micros());
        info!(
            "[WriteBlock] #{} seq:{} offset:{} len:{}",
            request.block_id,
            request.packet_seq,
            request.offset,
            request.databuf.len()
        );

        if !request.chunkservers.is_empty() {
            // Forward to the next replica with this node stripped off the
            // chain. The local append waits for the child's verdict.
            let next_server = request.chunkservers[0].clone();
            let mut child = request.clone();
            child.chunkservers = request.chunkservers[1..].to_vec();
            debug!(
                "[WriteBlock] send #{} seq:{} to next {}",
                request.block_id, request.packet_seq, next_server
            );
            loop {
                match self.peers.write_block(&next_server, child.clone()).await {
                    Ok(child_resp) if child_resp.status == status::OK => {
                        debug!(
                            "[WriteBlock] send #{} seq:{} to next done",
                            request.block_id, request.packet_seq
                        );
                        break;
                    }
                    Ok(child_resp) => {
                        warn!(
                            "[WriteBlock] next {} fail: #{} seq:{} status {}",
                            next_server, request.block_id, request.packet_seq, child_resp.status
                        );
                        response.status = child_resp.status;
                        return response;
                    }
                    Err(e) if e.is_transient() => {
                        tokio::time::sleep(Duration::from_millis(CHAIN_RETRY_MS)).await;
                    }
                    Err(e) => {
                        warn!(
                            "[WriteBlock] next {} fail: #{} seq:{} error {}",
                            next_server, request.block_id, request.packet_seq, e
                        );
                        response.status = e.code();
                        return response;
                    }
                }
            }
        }

        let svc = self.clone();
        self.write_pool
            .run(async move { svc.local_write(request, response).await })
            .await
            .unwrap_or_else(|| WriteBlockResponse {
                status: status::BUSY,
                ..WriteBlockResponse::default()
            })
    }

    async fn local_write(
        &self,
        request: WriteBlockRequest,
        mut response: WriteBlockResponse,
    ) -> WriteBlockResponse {
        // Window buffers are sized for one write buffer.
        if request.databuf.len() > self.write_buf_size {
            let e = Error::append_rejected(
                request.block_id,
                format!(
                    "packet of {} bytes over write_buf_size {}",
                    request.databuf.len(),
                    self.write_buf_size
                ),
            );
            warn!("[WriteBlock] seq:{} {}", request.packet_seq, e);
            response.status = e.status_code();
            return response;
        }

        let find_start = now_micros();
        let Some(block) = self.manager.find_block(request.block_id, true) else {
            let e = Error::BlockUnavailable {
                block_id: request.block_id,
            };
            warn!("[WriteBlock] {}", e);
            response.status = e.status_code();
            return response;
        };

        let write_start = now_micros();
        if !block.write(request.packet_seq, request.offset, &request.databuf) {
            let e = Error::append_rejected(
                request.block_id,
                format!(
                    "seq {} offset {} refused by the window",
                    request.packet_seq, request.offset
                ),
            );
            warn!("[WriteBlock] {}", e);
            response.status = e.status_code();
            return response;
        }
        let write_end = now_micros();

        if request.is_last {
            block.set_slice_num(request.packet_seq + 1);
            block.set_version(request.packet_seq as i64);
        }

        // The first successful close wins the one-shot completion report.
        let mut report_start = write_end;
        if block.is_complete() && self.manager.close_block(&block) {
            info!(
                "[WriteBlock] block finish #{} size:{}",
                request.block_id,
                block.size()
            );
            report_start = now_micros();
            self.reporter.report_finish(&block).await;
        }

        let done = now_micros();
        let arrival = response.timestamp.first().copied().unwrap_or(done);
        response
            .timestamp
            .extend([find_start, write_start, write_end, report_start, done]);
        info!(
            "[WriteBlock] done #{} seq:{} offset:{} len:{} use {} {} {} {} {} us",
            request.block_id,
            request.packet_seq,
            request.offset,
            request.databuf.len(),
            arrival - request.sequence_id,
            write_start - find_start,
            write_end - write_start,
            report_start - write_end,
            done - report_start,
        );
        self.counters.rpc_delay.add(arrival - request.sequence_id);
        self.counters.rpc_delay_all.add(done - request.sequence_id);
        self.counters.rpc_count.inc();
        self.counters.write_ops.inc();
        self.counters.write_bytes.add(request.databuf.len() as i64);
        response.status = status::OK;
        response
    }

    async fn process_read(
        &self,
        request: ReadBlockRequest,
        mut response: ReadBlockResponse,
    ) -> ReadBlockResponse {
        let find_start = now_micros();
        let Some(block) = self.manager.find_block(request.block_id, false) else {
            let e = Error::BlockNotFound {
                block_id: request.block_id,
            };
            warn!(
                "[ReadBlock] {} offset:{} len:{}",
                e, request.offset, request.read_len
            );
            response.status = e.status_code();
            return response;
        };

        let read_start = now_micros();
        match block.read(request.offset, request.read_len.max(0) as usize) {
            Ok(data) => {
                let read_end = now_micros();
                debug!(
                    "[ReadBlock] #{} offset:{} len:{} return:{}",
                    request.block_id,
                    request.offset,
                    request.read_len,
                    data.len()
                );
                response.databuf = data;
                if request.require_block_version {
                    response.block_version = block.version();
                }
                response
                    .timestamp
                    .extend([find_start, read_start, read_end]);
                self.counters.read_ops.inc();
                response.status = status::OK;
            }
            Err(e) => {
                let e = Error::DiskIo(e);
                warn!(
                    "[ReadBlock] #{} fail offset:{} len:{}: {}",
                    request.block_id, request.offset, request.read_len, e
                );
                response.status = e.status_code();
            }
        }
        response
    }
}

#[tonic::async_trait]
impl ChunkServer for ChunkServerImpl {
    async fn write_block(
        &self,
        request: Request<WriteBlockRequest>,
    ) -> Result<Response<WriteBlockResponse>, Status> {
        let request = request.into_inner();
        let mut response = WriteBlockResponse {
            sequence_id: request.sequence_id,
            status: status::OK,
            timestamp: vec![],
        };

        // Flow control: shed the write before it touches anything.
        if self.counters.block_buffers.get() >= self.max_pending_buffers
            || self.work_pool.pending_num() >= self.max_pending_buffers
        {
            warn!(
                "[WriteBlock] pending buf[{}] req[{}] reject #{} seq:{} offset:{} len:{}",
                self.counters.block_buffers.get(),
                self.work_pool.pending_num(),
                request.block_id,
                request.packet_seq,
                request.offset,
                request.databuf.len()
            );
            self.counters.refuse_ops.inc();
            response.status = Error::Busy.status_code();
            return Ok(Response::new(response));
        }
        response.timestamp.push(now_micros());

        let svc = self.clone();
        match self
            .work_pool
            .run(async move { svc.process_write(request, response).await })
            .await
        {
            Some(response) => Ok(Response::new(response)),
            None => Err(Status::unavailable("chunkserver shutting down")),
        }
    }

    async fn read_block(
        &self,
        request: Request<ReadBlockRequest>,
    ) -> Result<Response<ReadBlockResponse>, Status> {
        let request = request.into_inner();
        let mut response = ReadBlockResponse {
            sequence_id: request.sequence_id,
            ..ReadBlockResponse::default()
        };
        response.timestamp.push(now_micros());

        let svc = self.clone();
        match self
            .read_pool
            .run(async move { svc.process_read(request, response).await })
            .await
        {
            Some(response) => Ok(Response::new(response)),
            None => Err(Status::unavailable("chunkserver shutting down")),
        }
    }

    async fn get_block_info(
        &self,
        request: Request<GetBlockInfoRequest>,
    ) -> Result<Response<GetBlockInfoResponse>, Status> {
        let request = request.into_inner();
        let mut response = GetBlockInfoResponse {
            sequence_id: request.sequence_id,
            ..GetBlockInfoResponse::default()
        };
        response.timestamp.push(now_micros());

        let manager = Arc::clone(&self.manager);
        let out = self
            .read_pool
            .run(async move {
                match manager.find_block(request.block_id, false) {
                    Some(block) => {
                        response.block_size = block.meta().block_size;
                        response.status = status::OK;
                    }
                    None => {
                        let e = Error::BlockNotFound {
                            block_id: request.block_id,
                        };
                        warn!("[GetBlockInfo] {}", e);
                        response.status = e.status_code();
                    }
                }
                response.timestamp.push(now_micros());
                response
            })
            .await;
        match out {
            Some(response) => Ok(Response::new(response)),
            None => Err(Status::unavailable("chunkserver shutting down")),
        }
    }
}
