//! Periodic status push to the directory.
//!
//! One long-lived connection, opened lazily and reopened after any failure.
//! A failed send degrades the node without interrupting chunk service; the
//! next successful send recovers it. Heartbeats are fire-and-forget: the
//! directory does not reply.

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use dfs_lib::{send_frame, NETWORK_TIMEOUT_MS};

use crate::node::NodeShared;

pub(crate) async fn run_heartbeat_loop(shared: Arc<NodeShared>, cancel: CancellationToken) {
    let directory_addr = format!(
        "{}:{}",
        shared.config.directory_ip, shared.config.directory_port
    );
    let mut interval =
        tokio::time::interval(Duration::from_millis(shared.config.heartbeat_interval_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut conn: Option<TcpStream> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let message = shared.heartbeat_message();

        if conn.is_none() {
            conn = match connect(&directory_addr).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    debug!(
                        "node {}: heartbeat connect to {} failed: {}",
                        shared.config.server_id, directory_addr, e
                    );
                    shared.mark_directory_unreachable();
                    continue;
                }
            };
        }

        let stream = match conn.as_mut() {
            Some(stream) => stream,
            None => continue,
        };
        match send_frame(stream, &message.to_frame()).await {
            Ok(()) => {
                debug!(
                    "node {}: heartbeat sent, {} chunks, {} bytes used",
                    shared.config.server_id,
                    message.healthy_chunks.len(),
                    message.used_capacity
                );
                shared.mark_directory_reachable();
            }
            Err(e) => {
                warn!(
                    "node {}: heartbeat send failed: {}",
                    shared.config.server_id, e
                );
                conn = None;
                shared.mark_directory_unreachable();
            }
        }
    }
}

async fn connect(addr: &str) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(
        Duration::from_millis(NETWORK_TIMEOUT_MS),
        TcpStream::connect(addr),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    }
}
