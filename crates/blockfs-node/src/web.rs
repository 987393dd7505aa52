//! HTTP status page
//!
//! A minimal dashboard: counter snapshots in Prometheus text format under
//! `/metrics`, and a `/health` probe. Not part of the data path.

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;

use crate::counters::Counters;
use crate::manager::BlockManager;

pub struct StatusState {
    pub counters: Arc<Counters>,
    pub manager: Arc<BlockManager>,
    pub start_time: Instant,
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<StatusState>>,
) -> impl IntoResponse {
    let mut output = String::with_capacity(4 * 1024);
    let c = &state.counters;

    writeln!(output, "# HELP blockfs_uptime_seconds Chunkserver uptime").unwrap();
    writeln!(output, "# TYPE blockfs_uptime_seconds counter").unwrap();
    writeln!(
        output,
        "blockfs_uptime_seconds {}",
        state.start_time.elapsed().as_secs()
    )
    .unwrap();

    let gauges = [
        ("blockfs_blocks", c.blocks.get()),
        ("blockfs_writing_blocks", c.writing_blocks.get()),
        ("blockfs_block_buffers", c.block_buffers.get()),
        ("blockfs_writing_bytes", c.writing_bytes.get()),
        ("blockfs_data_size_bytes", c.data_size.get()),
        ("blockfs_disk_quota_bytes", state.manager.disk_quota()),
        (
            "blockfs_namespace_version",
            state.manager.namespace_version(),
        ),
    ];
    for (name, value) in gauges {
        writeln!(output, "# TYPE {name} gauge").unwrap();
        writeln!(output, "{name} {value}").unwrap();
    }

    let totals = [
        ("blockfs_find_ops_total", c.find_ops.get()),
        ("blockfs_read_ops_total", c.read_ops.get()),
        ("blockfs_write_ops_total", c.write_ops.get()),
        ("blockfs_write_bytes_total", c.write_bytes.get()),
        ("blockfs_refused_writes_total", c.refuse_ops.get()),
        ("blockfs_buffers_new_total", c.buffers_new.get()),
        ("blockfs_buffers_delete_total", c.buffers_delete.get()),
        ("blockfs_rpc_total", c.rpc_count.get()),
        ("blockfs_rpc_delay_us_total", c.rpc_delay.get()),
        ("blockfs_rpc_delay_all_us_total", c.rpc_delay_all.get()),
    ];
    for (name, value) in totals {
        writeln!(output, "# TYPE {name} counter").unwrap();
        writeln!(output, "{name} {value}").unwrap();
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Serve the status page until the process exits.
pub async fn serve_status_page(port: u16, state: Arc<StatusState>) -> std::io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    info!("starting status page on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(std::io::Error::other)
}
