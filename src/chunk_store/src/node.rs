//! The storage node server: accepts framed connections, serves chunk
//! requests against the local table, pushes heartbeats to the directory.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use dfs_lib::{
    current_unix_ts, recv_frame, send_frame, AckResponse, ChunkServerStatus, DeleteChunkRequest,
    DfsError, DfsResult, Frame, HeartbeatMessage, MessageType, ReadChunkRequest,
    ReadChunkResponse, ReplicateRequest, WireStatus, WriteChunkRequest, WriteChunkResponse,
    HEARTBEAT_INTERVAL_SEC, MAX_CONCURRENT_CLIENTS, MAX_FRAME_IO_BYTES, NETWORK_TIMEOUT_MS,
};

use crate::heartbeat::run_heartbeat_loop;
use crate::store::ChunkStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub server_id: String,
    pub ip: String,
    pub port: u16,
    #[serde(alias = "metadata_ip")]
    pub directory_ip: String,
    #[serde(alias = "metadata_port")]
    pub directory_port: u16,
    pub max_capacity: u64,
    pub heartbeat_interval_ms: u64,
    pub max_clients: usize,
    pub storage_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: "cs-001".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 9001,
            directory_ip: "127.0.0.1".to_string(),
            directory_port: 9000,
            max_capacity: 1024 * 1024 * 1024,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_SEC * 1000,
            max_clients: MAX_CONCURRENT_CLIENTS,
            storage_dir: None,
        }
    }
}

/// Lifecycle of the node. Client frames are only served in `Running` and
/// `Degraded`; `Degraded` means the directory is unreachable while chunk
/// service continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Init,
    Listening,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

impl NodeState {
    pub fn is_serving(&self) -> bool {
        matches!(self, NodeState::Running | NodeState::Degraded)
    }
}

pub(crate) struct NodeShared {
    pub(crate) config: NodeConfig,
    pub(crate) store: ChunkStore,
    pub(crate) state: Mutex<NodeState>,
    pub(crate) replication_queue: AtomicU32,
}

impl NodeShared {
    pub(crate) fn state(&self) -> NodeState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: NodeState) {
        *self.state.lock().unwrap() = next;
    }

    /// Heartbeat failed: a running node degrades, everything else stays put.
    pub(crate) fn mark_directory_unreachable(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == NodeState::Running {
            warn!(
                "node {}: directory unreachable, entering degraded service",
                self.config.server_id
            );
            *state = NodeState::Degraded;
        }
    }

    /// Heartbeat delivered: a degraded node recovers.
    pub(crate) fn mark_directory_reachable(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == NodeState::Degraded {
            info!("node {}: directory reachable again", self.config.server_id);
            *state = NodeState::Running;
        }
    }

    /// Snapshot taken under the chunk lock; membership and capacity are
    /// mutually consistent.
    pub(crate) fn heartbeat_message(&self) -> HeartbeatMessage {
        let snap = self.store.snapshot();
        HeartbeatMessage {
            server_id: self.config.server_id.clone(),
            timestamp: current_unix_ts(),
            healthy_chunks: snap.healthy_chunks,
            total_capacity: snap.total_capacity,
            used_capacity: snap.used_capacity,
            replication_queue_length: self.replication_queue.load(Ordering::SeqCst),
        }
    }
}

pub struct ChunkNode {
    shared: Arc<NodeShared>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ChunkNode {
    pub fn new(config: NodeConfig) -> DfsResult<Self> {
        let store = match &config.storage_dir {
            Some(dir) => ChunkStore::open(config.max_capacity, dir.clone())?,
            None => ChunkStore::new(config.max_capacity),
        };
        Ok(Self {
            shared: Arc::new(NodeShared {
                config,
                store,
                state: Mutex::new(NodeState::Init),
                replication_queue: AtomicU32::new(0),
            }),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn state(&self) -> NodeState {
        self.shared.state()
    }

    pub fn store(&self) -> &ChunkStore {
        &self.shared.store
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn status(&self) -> ChunkServerStatus {
        let snap = self.shared.store.snapshot();
        ChunkServerStatus {
            server_id: self.shared.config.server_id.clone(),
            ip: self.shared.config.ip.clone(),
            port: self.shared.config.port,
            total_capacity: snap.total_capacity,
            used_capacity: snap.used_capacity,
            healthy_chunks: snap.healthy_chunks,
            replication_queue_length: self.shared.replication_queue.load(Ordering::SeqCst),
            last_heartbeat: current_unix_ts(),
            is_healthy: self.state().is_serving(),
        }
    }

    /// Binds the listener and starts the accept and heartbeat tasks.
    /// Returns the bound address (relevant when the configured port is 0).
    pub async fn start(&self) -> DfsResult<SocketAddr> {
        let bind_addr = format!("{}:{}", self.shared.config.ip, self.shared.config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| DfsError::IoError(format!("bind {} failed: {}", bind_addr, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| DfsError::IoError(e.to_string()))?;
        *self.local_addr.lock().unwrap() = Some(addr);
        self.shared.set_state(NodeState::Listening);

        // Must be serving before the accept loop takes its first connection.
        self.shared.set_state(NodeState::Running);

        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();
        self.tracker
            .spawn(run_accept_loop(shared, listener, cancel, tracker));

        self.tracker.spawn(run_heartbeat_loop(
            self.shared.clone(),
            self.cancel.clone(),
        ));

        info!(
            "node {}: serving on {}",
            self.shared.config.server_id, addr
        );
        Ok(addr)
    }

    /// Pushes a locally held chunk to another storage node, the same way an
    /// OP_REPLICATE push command does.
    pub async fn replicate_chunk(
        &self,
        chunk_id: u64,
        target_ip: &str,
        target_port: u16,
    ) -> DfsResult<()> {
        push_chunk(&self.shared, chunk_id, target_ip, target_port).await
    }

    /// Graceful shutdown: stop accepting, let in-flight handlers finish
    /// (each bounded by the network timeout), then join every task.
    pub async fn stop(&self) {
        self.shared.set_state(NodeState::Stopping);
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.shared.set_state(NodeState::Stopped);
        info!("node {}: stopped", self.shared.config.server_id);
    }
}

async fn run_accept_loop(
    shared: Arc<NodeShared>,
    listener: TcpListener,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let clients = Arc::new(Semaphore::new(shared.config.max_clients));
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = clients.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("node {}: connection from {}", shared.config.server_id, peer);
                let shared = shared.clone();
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    let _permit = permit;
                    handle_connection(shared, stream, peer, cancel).await;
                });
            }
            Err(e) => {
                warn!("node {}: accept failed: {}", shared.config.server_id, e);
            }
        }
    }
}

async fn handle_connection(
    shared: Arc<NodeShared>,
    mut stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    loop {
        if !shared.state().is_serving() {
            break;
        }
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = recv_frame(&mut stream) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(DfsError::InvalidFrame(reason)) => {
                // Hard protocol violation: no reply, drop the connection.
                warn!("node {}: invalid frame from {}: {}", shared.config.server_id, peer, reason);
                break;
            }
            Err(e) => {
                debug!("node {}: connection {} closed: {}", shared.config.server_id, peer, e);
                break;
            }
        };

        let reply = dispatch_frame(&shared, frame).await;
        if let Err(e) = send_frame(&mut stream, &reply).await {
            debug!("node {}: reply to {} failed: {}", shared.config.server_id, peer, e);
            break;
        }
    }
}

/// Maps one request frame to one response frame. Handler failures are
/// reported in the response body; they never tear down the process.
async fn dispatch_frame(shared: &Arc<NodeShared>, frame: Frame) -> Frame {
    match frame.message_type {
        MessageType::Read => match ReadChunkRequest::decode(&frame.payload) {
            Ok(req) => handle_read(shared, req),
            Err(e) => AckResponse::failure(&e).to_frame(),
        },
        MessageType::Write => match WriteChunkRequest::decode(&frame.payload) {
            Ok(req) => handle_write(shared, req),
            Err(e) => AckResponse::failure(&e).to_frame(),
        },
        MessageType::Delete => match DeleteChunkRequest::decode(&frame.payload) {
            Ok(req) => {
                shared.store.delete(req.chunk_id);
                AckResponse::ok().to_frame()
            }
            Err(e) => AckResponse::failure(&e).to_frame(),
        },
        MessageType::Replicate => match ReplicateRequest::decode(&frame.payload) {
            Ok(req) => handle_replicate(shared, req).await,
            Err(e) => AckResponse::failure(&e).to_frame(),
        },
        other => {
            let err = DfsError::InvalidParam(format!(
                "operation {:?} not served by storage node",
                other
            ));
            AckResponse::failure(&err).to_frame()
        }
    }
}

fn handle_read(shared: &Arc<NodeShared>, req: ReadChunkRequest) -> Frame {
    // Clamp so the response body always fits the frame payload bound.
    let length = (req.length as u64).min(MAX_FRAME_IO_BYTES);
    match shared.store.read(req.chunk_id, req.offset as u64, length) {
        Ok(data) => ReadChunkResponse {
            chunk_id: req.chunk_id,
            offset: req.offset,
            length: data.len() as u32,
            data,
            status: WireStatus::Ok,
        }
        .to_frame(),
        Err(e) => {
            debug!("read chunk {} failed: {}", req.chunk_id, e);
            ReadChunkResponse {
                chunk_id: req.chunk_id,
                offset: req.offset,
                length: 0,
                data: Vec::new(),
                status: WireStatus::failure(&e),
            }
            .to_frame()
        }
    }
}

fn handle_write(shared: &Arc<NodeShared>, req: WriteChunkRequest) -> Frame {
    match shared.store.write(req.chunk_id, req.offset as u64, &req.data) {
        Ok(_) => WriteChunkResponse {
            chunk_id: req.chunk_id,
            status: WireStatus::Ok,
        }
        .to_frame(),
        Err(e) => {
            debug!("write chunk {} failed: {}", req.chunk_id, e);
            WriteChunkResponse {
                chunk_id: req.chunk_id,
                status: WireStatus::failure(&e),
            }
            .to_frame()
        }
    }
}

async fn handle_replicate(shared: &Arc<NodeShared>, req: ReplicateRequest) -> Frame {
    match req {
        ReplicateRequest::Push {
            chunk_id,
            target_ip,
            target_port,
        } => {
            let result = push_chunk(shared, chunk_id, &target_ip, target_port).await;
            match result {
                Ok(()) => AckResponse::ok().to_frame(),
                Err(e) => {
                    warn!(
                        "replicate chunk {} to {}:{} failed: {}",
                        chunk_id, target_ip, target_port, e
                    );
                    AckResponse::failure(&e).to_frame()
                }
            }
        }
        ReplicateRequest::Install { chunk_id, data } => {
            // Incoming copy lands through the normal write path.
            match shared.store.write(chunk_id, 0, &data) {
                Ok(_) => AckResponse::ok().to_frame(),
                Err(e) => AckResponse::failure(&e).to_frame(),
            }
        }
    }
}

/// Delivers a local chunk to `target` as ordinary writes, first piece at
/// offset 0, so the receiver's version/checksum bookkeeping applies as for
/// any other writer. The queue counter covers the whole transfer and is
/// what heartbeats report.
async fn push_chunk(
    shared: &Arc<NodeShared>,
    chunk_id: u64,
    target_ip: &str,
    target_port: u16,
) -> DfsResult<()> {
    shared.replication_queue.fetch_add(1, Ordering::SeqCst);
    let result = push_chunk_inner(shared, chunk_id, target_ip, target_port).await;
    shared.replication_queue.fetch_sub(1, Ordering::SeqCst);
    result
}

async fn push_chunk_inner(
    shared: &Arc<NodeShared>,
    chunk_id: u64,
    target_ip: &str,
    target_port: u16,
) -> DfsResult<()> {
    let data = shared.store.read_all(chunk_id)?;
    let addr = format!("{}:{}", target_ip, target_port);
    let mut stream = tokio::time::timeout(
        Duration::from_millis(NETWORK_TIMEOUT_MS),
        TcpStream::connect(&addr),
    )
    .await
    .map_err(|_| DfsError::Timeout(format!("connect {} timed out", addr)))?
    .map_err(|e| DfsError::IoError(format!("connect {} failed: {}", addr, e)))?;

    let mut offset = 0u64;
    // An empty chunk still pushes one (empty) write to create the object.
    loop {
        let end = (offset + MAX_FRAME_IO_BYTES).min(data.len() as u64);
        let req = WriteChunkRequest {
            chunk_id,
            offset: offset as u32,
            data: data[offset as usize..end as usize].to_vec(),
            version_hint: 0,
            client_id: shared.config.server_id.clone(),
        };
        send_frame(&mut stream, &req.to_frame()).await?;
        let reply = recv_frame(&mut stream).await?;
        let resp = WriteChunkResponse::decode(&reply.payload)?;
        resp.status.into_result()?;
        offset = end;
        if offset >= data.len() as u64 {
            break;
        }
    }
    Ok(())
}
