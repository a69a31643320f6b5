//! The file-descriptor-style client surface.
//!
//! Every call translates into directory queries (cache-first) plus framed
//! RPCs to storage nodes. The open-file table and the metadata cache have
//! their own locks; handle state is snapshotted out before any network I/O
//! and the offset advance re-locks afterwards, so no lock is ever held
//! across the wire.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use dfs_lib::{
    current_unix_ts, AckResponse, ChunkHandle, ChunkLocation, DfsError, DfsResult,
    FileCreateRequest, FileDeleteRequest, FileMetadata, Frame, MessageType, MetadataQueryRequest,
    MetadataQueryResponse, MkdirRequest, ReadChunkRequest, ReadChunkResponse, WriteChunkRequest,
    WriteChunkResponse, DEFAULT_CONNECTION_POOL_SIZE, DEFAULT_FILE_PERMISSIONS,
    METADATA_CACHE_TTL_SEC, RETRY_ATTEMPTS, RETRY_BACKOFF_MS,
};

use crate::conn_pool::ConnectionPool;
use crate::directory::DirectoryChannel;
use crate::meta_cache::MetadataCache;
use crate::span::chunk_spans;

/// Low bit of the `open` flags marks the handle writable; the remaining
/// bits are reserved.
pub const OPEN_FLAG_WRITE: u32 = 0x01;

/// Deterministic replica choice: the first replica listed. Failover walks
/// the remaining replicas in order, so for a given replica list the access
/// pattern is always the same.
pub fn select_nearest_replica(replicas: &[ChunkLocation]) -> Option<&ChunkLocation> {
    replicas.first()
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub directory_ip: String,
    pub directory_port: u16,
    pub client_id: String,
    pub metadata_cache_ttl: Duration,
    pub pool_size: usize,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl ClientConfig {
    pub fn new(directory_ip: &str, directory_port: u16) -> Self {
        Self {
            directory_ip: directory_ip.to_string(),
            directory_port,
            client_id: format!("client-{}", std::process::id()),
            metadata_cache_ttl: Duration::from_secs(METADATA_CACHE_TTL_SEC),
            pool_size: DEFAULT_CONNECTION_POOL_SIZE,
            retry_attempts: RETRY_ATTEMPTS,
            retry_backoff: Duration::from_millis(RETRY_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Clone)]
struct OpenFileHandle {
    path: String,
    file_id: u64,
    current_offset: u64,
    chunks: Vec<ChunkHandle>,
    writable: bool,
    open_time: u64,
}

struct OpenFileTable {
    next_fd: i32,
    files: HashMap<i32, OpenFileHandle>,
}

pub struct DfsClient {
    config: ClientConfig,
    directory: DirectoryChannel,
    cache: MetadataCache,
    pool: ConnectionPool,
    files: Mutex<OpenFileTable>,
}

impl DfsClient {
    pub fn new(directory_ip: &str, directory_port: u16) -> Self {
        Self::with_config(ClientConfig::new(directory_ip, directory_port))
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let directory = DirectoryChannel::new(
            &config.directory_ip,
            config.directory_port,
            config.retry_attempts,
            config.retry_backoff,
        );
        let cache = MetadataCache::new(config.metadata_cache_ttl);
        let pool = ConnectionPool::new(config.pool_size);
        Self {
            config,
            directory,
            cache,
            pool,
            files: Mutex::new(OpenFileTable {
                next_fd: 1,
                files: HashMap::new(),
            }),
        }
    }

    // ---- namespace operations ----------------------------------------

    /// Creates a regular file; returns the file id the directory assigned.
    pub async fn create_file(&self, path: &str, permissions: Option<u32>) -> DfsResult<u64> {
        let request = FileCreateRequest {
            path: path.to_string(),
            permissions: permissions.unwrap_or(DEFAULT_FILE_PERMISSIONS),
        };
        let ack = self.directory_ack(&request.to_frame()).await?;
        self.cache.invalidate(path);
        Ok(ack.file_id)
    }

    pub async fn delete_file(&self, path: &str) -> DfsResult<()> {
        let request = FileDeleteRequest {
            path: path.to_string(),
        };
        self.directory_ack(&request.to_frame()).await?;
        self.cache.invalidate(path);
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> DfsResult<()> {
        let request = MkdirRequest {
            path: path.to_string(),
        };
        self.directory_ack(&request.to_frame()).await?;
        self.cache.invalidate(path);
        Ok(())
    }

    pub async fn get_file_info(&self, path: &str) -> DfsResult<FileMetadata> {
        self.query_metadata(path).await
    }

    // ---- fd operations ------------------------------------------------

    /// Opens `path` and returns a descriptor (>= 1). The chunk list is
    /// snapshotted from the metadata in force at open time.
    pub async fn open(&self, path: &str, flags: u32) -> DfsResult<i32> {
        let metadata = self.query_metadata(path).await?;

        let mut table = self.files.lock().unwrap();
        let fd = table.next_fd;
        table.next_fd += 1;
        table.files.insert(
            fd,
            OpenFileHandle {
                path: path.to_string(),
                file_id: metadata.file_id,
                current_offset: 0,
                chunks: metadata.chunks,
                writable: flags & OPEN_FLAG_WRITE != 0,
                open_time: current_unix_ts(),
            },
        );
        debug!("open {} -> fd {} (file_id {})", path, fd, metadata.file_id);
        Ok(fd)
    }

    pub async fn close(&self, fd: i32) -> DfsResult<()> {
        let mut table = self.files.lock().unwrap();
        let handle = table
            .files
            .remove(&fd)
            .ok_or_else(|| DfsError::ClosedHandle(format!("fd {}", fd)))?;
        debug!(
            "close fd {} ({}, file_id {}, open {}s)",
            fd,
            handle.path,
            handle.file_id,
            current_unix_ts().saturating_sub(handle.open_time)
        );
        Ok(())
    }

    /// Reads into `buf` starting at the handle's current offset, advancing
    /// it by the bytes actually returned. Short reads are normal: end of
    /// chunk data, end of the chunk list, or a failure after some bytes
    /// already arrived all cut the scan short.
    pub async fn read(&self, fd: i32, buf: &mut [u8]) -> DfsResult<usize> {
        let handle = self.snapshot_handle(fd)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut filled = 0usize;
        let mut first_error: Option<DfsError> = None;

        for span in chunk_spans(handle.current_offset, buf.len() as u64) {
            let Some(chunk) = handle.chunks.get(span.chunk_index) else {
                break; // past the end of the file's chunk list
            };
            if span.offset_in_chunk >= chunk.size {
                break; // nothing stored at this offset yet
            }

            let request = ReadChunkRequest {
                chunk_id: chunk.chunk_id,
                offset: span.offset_in_chunk as u32,
                length: span.len as u32,
                version: chunk.version,
                client_id: self.config.client_id.clone(),
            };
            match self.read_chunk(&handle.path, &chunk.replicas, request).await {
                Ok(data) => {
                    let take = data.len().min(buf.len() - filled);
                    buf[filled..filled + take].copy_from_slice(&data[..take]);
                    filled += take;
                    if (take as u64) < span.len {
                        break; // short read at end of chunk data
                    }
                }
                Err(e) => {
                    warn!(
                        "read fd {} chunk {} failed: {}",
                        fd, chunk.chunk_id, e
                    );
                    first_error = Some(e);
                    break;
                }
            }
        }

        match (filled, first_error) {
            (0, Some(e)) => Err(e),
            (n, _) => {
                self.advance_offset(fd, n as u64);
                Ok(n)
            }
        }
    }

    /// Writes `data` at the handle's current offset, advancing it by the
    /// bytes accepted. Requires a writable descriptor.
    pub async fn write(&self, fd: i32, data: &[u8]) -> DfsResult<usize> {
        let handle = self.snapshot_handle(fd)?;
        if !handle.writable {
            return Err(DfsError::InvalidParam(format!(
                "fd {} is not open for writing",
                fd
            )));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        let mut first_error: Option<DfsError> = None;

        for span in chunk_spans(handle.current_offset, data.len() as u64) {
            let Some(chunk) = handle.chunks.get(span.chunk_index) else {
                first_error = Some(DfsError::NotFound(format!(
                    "{}: no chunk allocated at index {}",
                    handle.path, span.chunk_index
                )));
                break;
            };

            let request = WriteChunkRequest {
                chunk_id: chunk.chunk_id,
                offset: span.offset_in_chunk as u32,
                data: data[written..written + span.len as usize].to_vec(),
                version_hint: chunk.version,
                client_id: self.config.client_id.clone(),
            };
            match self
                .write_chunk(&handle.path, &chunk.replicas, request)
                .await
            {
                Ok(()) => written += span.len as usize,
                Err(e) => {
                    warn!("write fd {} chunk {} failed: {}", fd, chunk.chunk_id, e);
                    first_error = Some(e);
                    break;
                }
            }
        }

        match (written, first_error) {
            (0, Some(e)) => Err(e),
            (n, _) => {
                self.advance_offset(fd, n as u64);
                Ok(n)
            }
        }
    }

    // ---- internals -----------------------------------------------------

    fn snapshot_handle(&self, fd: i32) -> DfsResult<OpenFileHandle> {
        let table = self.files.lock().unwrap();
        table
            .files
            .get(&fd)
            .cloned()
            .ok_or_else(|| DfsError::ClosedHandle(format!("fd {}", fd)))
    }

    fn advance_offset(&self, fd: i32, by: u64) {
        let mut table = self.files.lock().unwrap();
        if let Some(handle) = table.files.get_mut(&fd) {
            handle.current_offset += by;
        }
    }

    async fn query_metadata(&self, path: &str) -> DfsResult<FileMetadata> {
        if let Some(metadata) = self.cache.get(path) {
            debug!("metadata cache hit for {}", path);
            return Ok(metadata);
        }

        let request = MetadataQueryRequest {
            path: path.to_string(),
            client_id: self.config.client_id.clone(),
            operation: MessageType::MetadataQuery as u16,
        };
        let reply = self.directory.call(&request.to_frame()).await?;
        let response = MetadataQueryResponse::decode(&reply.payload)?;
        response.status.into_result()?;
        let metadata = response
            .metadata
            .ok_or_else(|| DfsError::NotFound(format!("no metadata for {}", path)))?;

        self.cache.put(path, metadata.clone());
        Ok(metadata)
    }

    async fn directory_ack(&self, request: &Frame) -> DfsResult<AckResponse> {
        let reply = self.directory.call(request).await?;
        if reply.message_type != MessageType::Ack {
            return Err(DfsError::DecodeError(format!(
                "expected ack, got {:?}",
                reply.message_type
            )));
        }
        let ack = AckResponse::decode(&reply.payload)?;
        ack.status.clone().into_result()?;
        Ok(ack)
    }

    /// First reachable replica wins; on failure the next replica in order is
    /// tried, with doubling backoff between attempts. A `NotFound` outcome
    /// invalidates the cached metadata for the path before it is surfaced.
    async fn read_chunk(
        &self,
        path: &str,
        replicas: &[ChunkLocation],
        request: ReadChunkRequest,
    ) -> DfsResult<Vec<u8>> {
        let frame = request.to_frame();
        let reply = self.replica_rpc(path, replicas, &frame).await?;
        let response = ReadChunkResponse::decode(&reply.payload)?;
        match response.status.into_result() {
            Ok(()) => Ok(response.data),
            Err(e) => Err(self.map_chunk_error(path, e)),
        }
    }

    async fn write_chunk(
        &self,
        path: &str,
        replicas: &[ChunkLocation],
        request: WriteChunkRequest,
    ) -> DfsResult<()> {
        let frame = request.to_frame();
        let reply = self.replica_rpc(path, replicas, &frame).await?;
        let response = WriteChunkResponse::decode(&reply.payload)?;
        match response.status.into_result() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.map_chunk_error(path, e)),
        }
    }

    fn map_chunk_error(&self, path: &str, err: DfsError) -> DfsError {
        if err.is_not_found() {
            self.cache.invalidate(path);
        }
        err
    }

    /// One request/response exchange with replica failover. Transport
    /// failures walk the replica list in order, sleeping the doubling
    /// backoff between attempts; exhaustion becomes `AllReplicasFailed`.
    /// Sockets that saw an I/O error are discarded, healthy ones return to
    /// the pool.
    async fn replica_rpc(
        &self,
        path: &str,
        replicas: &[ChunkLocation],
        frame: &Frame,
    ) -> DfsResult<Frame> {
        if replicas.is_empty() {
            return Err(DfsError::NotFound(format!(
                "{}: chunk has no replicas",
                path
            )));
        }

        let mut delay = self.config.retry_backoff;
        let mut last_error = DfsError::Internal("no attempt made".to_string());

        for attempt in 0..self.config.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            let replica = if attempt == 0 {
                match select_nearest_replica(replicas) {
                    Some(replica) => replica,
                    None => break,
                }
            } else {
                &replicas[attempt as usize % replicas.len()]
            };

            let mut conn = match self.pool.acquire(&replica.ip, replica.port).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("replica {} unreachable: {}", replica.endpoint(), e);
                    last_error = e;
                    continue;
                }
            };

            let exchange = async {
                dfs_lib::send_frame(&mut *conn, frame).await?;
                dfs_lib::recv_frame(&mut *conn).await
            }
            .await;
            match exchange {
                Ok(reply) => {
                    drop(conn); // healthy socket goes back to the pool
                    return Ok(reply);
                }
                Err(e) => {
                    debug!("replica {} failed: {}", replica.endpoint(), e);
                    conn.discard();
                    last_error = e;
                }
            }
        }

        Err(DfsError::AllReplicasFailed(format!(
            "{} attempts exhausted, last: {}",
            self.config.retry_attempts, last_error
        )))
    }
}
