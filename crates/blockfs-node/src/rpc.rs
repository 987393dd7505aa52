//! Outbound RPC plumbing
//!
//! Thin trait seams over the tonic clients so the pipeline, replicator,
//! and reporter can be exercised against scripted peers in tests. The
//! tonic implementations cache one channel per address and wrap every
//! call in an absolute timeout with a bounded retry count.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tonic::transport::Channel;
use tracing::{debug, warn};

use blockfs_proto::chunkserver::chunk_server_client::ChunkServerClient;
use blockfs_proto::chunkserver::{
    ReadBlockRequest, ReadBlockResponse, WriteBlockRequest, WriteBlockResponse,
};
use blockfs_proto::nameserver::name_server_client::NameServerClient;
use blockfs_proto::nameserver::{
    BlockReportRequest, BlockReportResponse, HeartBeatRequest, HeartBeatResponse,
    PullBlockReportRequest, PullBlockReportResponse,
};

/// Error from an outbound call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The peer's receive side is saturated; retry after a short delay.
    #[error("send buffer full")]
    SendBufferFull,

    /// Anything else: dead connection, timeout, peer-side failure.
    #[error("transport error {code}: {message}")]
    Transport { code: i32, message: String },
}

impl RpcError {
    pub fn transport(code: i32, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    /// Numeric code adopted into the in-band status when a child replica
    /// fails without reporting its own status.
    pub fn code(&self) -> i32 {
        match self {
            Self::SendBufferFull => tonic::Code::ResourceExhausted as i32,
            Self::Transport { code, .. } => *code,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SendBufferFull)
    }
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::ResourceExhausted => Self::SendBufferFull,
            code => Self::transport(code as i32, status.message().to_string()),
        }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Peer chunkserver surface used by chain forwarding and pulls.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    async fn write_block(&self, addr: &str, request: WriteBlockRequest)
        -> RpcResult<WriteBlockResponse>;

    async fn read_block(&self, addr: &str, request: ReadBlockRequest)
        -> RpcResult<ReadBlockResponse>;
}

/// Nameserver surface used by the reporter and the pull replicator.
#[async_trait]
pub trait NameServerApi: Send + Sync {
    async fn heart_beat(&self, request: HeartBeatRequest) -> RpcResult<HeartBeatResponse>;

    async fn block_report(&self, request: BlockReportRequest) -> RpcResult<BlockReportResponse>;

    async fn pull_block_report(
        &self,
        request: PullBlockReportRequest,
    ) -> RpcResult<PullBlockReportResponse>;
}

fn endpoint_uri(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

async fn connect(addr: &str) -> RpcResult<Channel> {
    tonic::transport::Endpoint::new(endpoint_uri(addr))
        .map_err(|e| RpcError::transport(tonic::Code::Unavailable as i32, e.to_string()))?
        .connect()
        .await
        .map_err(|e| RpcError::transport(tonic::Code::Unavailable as i32, e.to_string()))
}

/// Per-address cache of peer chunkserver channels.
pub struct TonicPeers {
    clients: RwLock<HashMap<String, ChunkServerClient<Channel>>>,
    timeout: Duration,
}

impl TonicPeers {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            timeout: Duration::from_secs(30),
        }
    }

    async fn get_or_connect(&self, addr: &str) -> RpcResult<ChunkServerClient<Channel>> {
        if let Some(client) = self.clients.read().await.get(addr) {
            return Ok(client.clone());
        }
        let channel = connect(addr).await?;
        let client = ChunkServerClient::new(channel);
        self.clients
            .write()
            .await
            .insert(addr.to_string(), client.clone());
        debug!("connected to chunkserver peer {}", addr);
        Ok(client)
    }

    /// Drop the cached channel so the next call reconnects.
    async fn forget(&self, addr: &str) {
        self.clients.write().await.remove(addr);
    }
}

impl Default for TonicPeers {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerChannel for TonicPeers {
    async fn write_block(
        &self,
        addr: &str,
        request: WriteBlockRequest,
    ) -> RpcResult<WriteBlockResponse> {
        let mut client = self.get_or_connect(addr).await?;
        let call = client.write_block(request);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => {
                self.forget(addr).await;
                Err(status.into())
            }
            Err(_) => {
                self.forget(addr).await;
                Err(RpcError::transport(
                    tonic::Code::DeadlineExceeded as i32,
                    format!("write_block to {addr} timed out"),
                ))
            }
        }
    }

    async fn read_block(
        &self,
        addr: &str,
        request: ReadBlockRequest,
    ) -> RpcResult<ReadBlockResponse> {
        let mut client = self.get_or_connect(addr).await?;
        let call = client.read_block(request);
        match tokio::time::timeout(Duration::from_secs(15), call).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => {
                self.forget(addr).await;
                Err(status.into())
            }
            Err(_) => {
                self.forget(addr).await;
                Err(RpcError::transport(
                    tonic::Code::DeadlineExceeded as i32,
                    format!("read_block from {addr} timed out"),
                ))
            }
        }
    }
}

/// Nameserver client with reconnect-on-failure and bounded retries.
pub struct TonicNameServer {
    addr: String,
    client: Mutex<Option<NameServerClient<Channel>>>,
}

impl TonicNameServer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> RpcResult<NameServerClient<Channel>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let channel = connect(&self.addr).await?;
        let client = NameServerClient::new(channel);
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn drop_client(&self) {
        *self.client.lock().await = None;
    }

    async fn call<Req, Resp, F, Fut>(
        &self,
        request: Req,
        timeout: Duration,
        retries: usize,
        f: F,
    ) -> RpcResult<Resp>
    where
        Req: Clone + Send,
        F: Fn(NameServerClient<Channel>, Req) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = std::result::Result<tonic::Response<Resp>, tonic::Status>>
            + Send,
    {
        let mut last = RpcError::transport(tonic::Code::Unavailable as i32, "no attempt made");
        for attempt in 0..retries.max(1) {
            match self.client().await {
                Ok(client) => {
                    match tokio::time::timeout(timeout, f(client, request.clone())).await {
                        Ok(Ok(resp)) => return Ok(resp.into_inner()),
                        Ok(Err(status)) => {
                            self.drop_client().await;
                            last = status.into();
                        }
                        Err(_) => {
                            self.drop_client().await;
                            last = RpcError::transport(
                                tonic::Code::DeadlineExceeded as i32,
                                format!("nameserver call timed out ({})", self.addr),
                            );
                        }
                    }
                }
                Err(e) => last = e,
            }
            if attempt + 1 < retries.max(1) {
                warn!("nameserver call attempt {} failed: {}", attempt + 1, last);
            }
        }
        Err(last)
    }
}

#[async_trait]
impl NameServerApi for TonicNameServer {
    async fn heart_beat(&self, request: HeartBeatRequest) -> RpcResult<HeartBeatResponse> {
        self.call(request, Duration::from_secs(15), 1, |mut c, req| async move {
            c.heart_beat(req).await
        })
        .await
    }

    async fn block_report(&self, request: BlockReportRequest) -> RpcResult<BlockReportResponse> {
        self.call(request, Duration::from_secs(20), 3, |mut c, req| async move {
            c.block_report(req).await
        })
        .await
    }

    async fn pull_block_report(
        &self,
        request: PullBlockReportRequest,
    ) -> RpcResult<PullBlockReportResponse> {
        self.call(request, Duration::from_secs(15), 3, |mut c, req| async move {
            c.pull_block_report(req).await
        })
        .await
    }
}
