use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};

use chunk_store::{ChunkNode, NodeConfig};
use dfs_lib::{
    current_unix_ts, recv_frame, send_frame, AckResponse, ChunkHandle, ChunkLocation, DfsError,
    ErrorCode, FileCreateRequest, FileDeleteRequest, FileMetadata, MessageType,
    MetadataQueryRequest, MetadataQueryResponse, MkdirRequest, WireStatus,
};

use crate::{ClientConfig, DfsClient, OPEN_FLAG_WRITE};

/// In-test directory endpoint: serves scripted metadata records and counts
/// how often each operation is asked for.
struct ScriptedDirectory {
    addr: SocketAddr,
    records: Arc<Mutex<HashMap<String, FileMetadata>>>,
    metadata_queries: Arc<AtomicUsize>,
}

impl ScriptedDirectory {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let records: Arc<Mutex<HashMap<String, FileMetadata>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let metadata_queries = Arc::new(AtomicUsize::new(0));
        let next_file_id = Arc::new(AtomicU64::new(1000));

        let records_srv = records.clone();
        let queries_srv = metadata_queries.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let records = records_srv.clone();
                let queries = queries_srv.clone();
                let next_file_id = next_file_id.clone();
                tokio::spawn(serve_directory_conn(stream, records, queries, next_file_id));
            }
        });

        Self {
            addr,
            records,
            metadata_queries,
        }
    }

    fn put_record(&self, metadata: FileMetadata) {
        self.records
            .lock()
            .unwrap()
            .insert(metadata.path.clone(), metadata);
    }

    fn query_count(&self) -> usize {
        self.metadata_queries.load(Ordering::SeqCst)
    }
}

async fn serve_directory_conn(
    mut stream: TcpStream,
    records: Arc<Mutex<HashMap<String, FileMetadata>>>,
    queries: Arc<AtomicUsize>,
    next_file_id: Arc<AtomicU64>,
) {
    while let Ok(frame) = recv_frame(&mut stream).await {
        let reply = match frame.message_type {
            MessageType::MetadataQuery => {
                let req = MetadataQueryRequest::decode(&frame.payload).unwrap();
                queries.fetch_add(1, Ordering::SeqCst);
                let record = records.lock().unwrap().get(&req.path).cloned();
                match record {
                    Some(metadata) => MetadataQueryResponse {
                        path: req.path,
                        metadata: Some(metadata),
                        status: WireStatus::Ok,
                    }
                    .to_frame(),
                    None => MetadataQueryResponse {
                        path: req.path.clone(),
                        metadata: None,
                        status: WireStatus::Err {
                            code: ErrorCode::NotFound,
                            message: format!("not found: {}", req.path),
                        },
                    }
                    .to_frame(),
                }
            }
            MessageType::FileCreate => {
                let req = FileCreateRequest::decode(&frame.payload).unwrap();
                let file_id = next_file_id.fetch_add(1, Ordering::SeqCst);
                records.lock().unwrap().insert(
                    req.path.clone(),
                    FileMetadata {
                        path: req.path,
                        file_id,
                        permissions: req.permissions,
                        creation_time: current_unix_ts(),
                        modification_time: current_unix_ts(),
                        file_size: 0,
                        chunks: Vec::new(),
                        replication_factor: 3,
                        owner: "test".to_string(),
                        is_directory: false,
                    },
                );
                AckResponse {
                    status: WireStatus::Ok,
                    file_id,
                }
                .to_frame()
            }
            MessageType::FileDelete => {
                let req = FileDeleteRequest::decode(&frame.payload).unwrap();
                records.lock().unwrap().remove(&req.path);
                AckResponse::ok().to_frame()
            }
            MessageType::Mkdir => {
                let req = MkdirRequest::decode(&frame.payload).unwrap();
                records.lock().unwrap().insert(
                    req.path.clone(),
                    FileMetadata {
                        path: req.path,
                        file_id: next_file_id.fetch_add(1, Ordering::SeqCst),
                        permissions: 0o755,
                        creation_time: current_unix_ts(),
                        modification_time: current_unix_ts(),
                        file_size: 0,
                        chunks: Vec::new(),
                        replication_factor: 3,
                        owner: "test".to_string(),
                        is_directory: true,
                    },
                );
                AckResponse::ok().to_frame()
            }
            MessageType::Heartbeat => continue, // unsolicited, no reply
            _ => AckResponse::failure(&DfsError::InvalidParam("unexpected op".to_string()))
                .to_frame(),
        };
        if send_frame(&mut stream, &reply).await.is_err() {
            break;
        }
    }
}

async fn start_chunk_node() -> (Arc<ChunkNode>, SocketAddr) {
    let config = NodeConfig {
        port: 0,
        directory_port: 1,
        heartbeat_interval_ms: 60_000,
        ..NodeConfig::default()
    };
    let node = Arc::new(ChunkNode::new(config).unwrap());
    let addr = node.start().await.unwrap();
    (node, addr)
}

fn replica_for(addr: SocketAddr) -> ChunkLocation {
    ChunkLocation {
        server_id: "cs-test".to_string(),
        ip: addr.ip().to_string(),
        port: addr.port(),
        generation: 1,
    }
}

fn file_record(path: &str, chunks: Vec<ChunkHandle>) -> FileMetadata {
    let file_size = chunks.iter().map(|c| c.size).sum();
    FileMetadata {
        path: path.to_string(),
        file_id: 7,
        permissions: 0o644,
        creation_time: current_unix_ts(),
        modification_time: current_unix_ts(),
        file_size,
        chunks,
        replication_factor: 3,
        owner: "test".to_string(),
        is_directory: false,
    }
}

fn chunk_handle(chunk_id: u64, size: u64, replicas: Vec<ChunkLocation>) -> ChunkHandle {
    ChunkHandle {
        chunk_id,
        replicas,
        version: 1,
        creation_time: current_unix_ts(),
        size,
    }
}

fn client_for(directory: &ScriptedDirectory) -> DfsClient {
    DfsClient::new(&directory.addr.ip().to_string(), directory.addr.port())
}

#[tokio::test]
async fn test_metadata_cache_avoids_repeat_queries() {
    let directory = ScriptedDirectory::start().await;
    directory.put_record(file_record("/x", Vec::new()));
    let client = client_for(&directory);

    let first = client.get_file_info("/x").await.unwrap();
    assert_eq!(directory.query_count(), 1);

    // Within the TTL the directory must not be consulted again.
    let second = client.get_file_info("/x").await.unwrap();
    assert_eq!(directory.query_count(), 1);
    assert_eq!(first, second);

    // Deletion invalidates the entry; the next query goes back out.
    client.delete_file("/x").await.unwrap();
    let err = client.get_file_info("/x").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(directory.query_count(), 2);
}

#[tokio::test]
async fn test_metadata_cache_ttl_expires() {
    let directory = ScriptedDirectory::start().await;
    directory.put_record(file_record("/y", Vec::new()));

    let mut config = ClientConfig::new(&directory.addr.ip().to_string(), directory.addr.port());
    config.metadata_cache_ttl = Duration::from_millis(50);
    let client = DfsClient::with_config(config);

    client.get_file_info("/y").await.unwrap();
    assert_eq!(directory.query_count(), 1);
    tokio::time::sleep(Duration::from_millis(80)).await;
    client.get_file_info("/y").await.unwrap();
    assert_eq!(directory.query_count(), 2);
}

#[tokio::test]
async fn test_create_mkdir_delete_round_trip() {
    let directory = ScriptedDirectory::start().await;
    let client = client_for(&directory);

    let file_id = client.create_file("/new.bin", None).await.unwrap();
    assert!(file_id >= 1000);

    client.mkdir("/dir").await.unwrap();
    let info = client.get_file_info("/dir").await.unwrap();
    assert!(info.is_directory);
    assert!(info.chunks.is_empty());

    client.delete_file("/new.bin").await.unwrap();
    assert!(client.get_file_info("/new.bin").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_open_write_read_through_node() {
    let directory = ScriptedDirectory::start().await;
    let (node, node_addr) = start_chunk_node().await;

    let payload = b"hello chunk fabric";
    directory.put_record(file_record(
        "/data/file.bin",
        vec![chunk_handle(
            42,
            payload.len() as u64,
            vec![replica_for(node_addr)],
        )],
    ));

    let client = client_for(&directory);

    let wfd = client.open("/data/file.bin", OPEN_FLAG_WRITE).await.unwrap();
    assert!(wfd >= 1);
    let written = client.write(wfd, payload).await.unwrap();
    assert_eq!(written, payload.len());
    client.close(wfd).await.unwrap();

    let rfd = client.open("/data/file.bin", 0).await.unwrap();
    let mut buf = vec![0u8; 64];
    let n = client.read(rfd, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], payload);

    // Offset advanced past the data: the next read reports end of file.
    let n = client.read(rfd, &mut buf).await.unwrap();
    assert_eq!(n, 0);
    client.close(rfd).await.unwrap();

    node.stop().await;
}

#[tokio::test]
async fn test_read_advances_offset_incrementally() {
    let directory = ScriptedDirectory::start().await;
    let (node, node_addr) = start_chunk_node().await;
    node.store().write(9, 0, b"abcdefgh").unwrap();

    directory.put_record(file_record(
        "/seq",
        vec![chunk_handle(9, 8, vec![replica_for(node_addr)])],
    ));

    let client = client_for(&directory);
    let fd = client.open("/seq", 0).await.unwrap();

    let mut buf = [0u8; 3];
    assert_eq!(client.read(fd, &mut buf).await.unwrap(), 3);
    assert_eq!(&buf, b"abc");
    assert_eq!(client.read(fd, &mut buf).await.unwrap(), 3);
    assert_eq!(&buf, b"def");
    // Short read at end of data.
    assert_eq!(client.read(fd, &mut buf).await.unwrap(), 2);
    assert_eq!(&buf[..2], b"gh");

    node.stop().await;
}

#[tokio::test]
async fn test_replica_failover_after_backoff() {
    let directory = ScriptedDirectory::start().await;
    let (node, node_addr) = start_chunk_node().await;
    node.store().write(42, 0, b"ABCDE").unwrap();

    // A port with nothing behind it: bind, note the address, drop.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    directory.put_record(file_record(
        "/ha",
        vec![chunk_handle(
            42,
            5,
            vec![replica_for(dead_addr), replica_for(node_addr)],
        )],
    ));

    let client = client_for(&directory);
    let fd = client.open("/ha", 0).await.unwrap();

    let started = Instant::now();
    let mut buf = [0u8; 8];
    let n = client.read(fd, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ABCDE");
    // One failed attempt means at least one full backoff was slept.
    assert!(started.elapsed() >= Duration::from_millis(100));

    node.stop().await;
}

#[tokio::test]
async fn test_all_replicas_failed() {
    let directory = ScriptedDirectory::start().await;

    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    directory.put_record(file_record(
        "/down",
        vec![chunk_handle(1, 4, vec![replica_for(dead_addr)])],
    ));

    let mut config = ClientConfig::new(&directory.addr.ip().to_string(), directory.addr.port());
    config.retry_backoff = Duration::from_millis(10);
    let client = DfsClient::with_config(config);

    let fd = client.open("/down", 0).await.unwrap();
    let mut buf = [0u8; 4];
    let err = client.read(fd, &mut buf).await.unwrap_err();
    assert!(matches!(err, DfsError::AllReplicasFailed(_)));
}

#[tokio::test]
async fn test_chunk_not_found_invalidates_cache() {
    let directory = ScriptedDirectory::start().await;
    let (node, node_addr) = start_chunk_node().await;

    // Metadata promises a chunk the node does not hold.
    directory.put_record(file_record(
        "/stale",
        vec![chunk_handle(404, 6, vec![replica_for(node_addr)])],
    ));

    let client = client_for(&directory);
    let fd = client.open("/stale", 0).await.unwrap();
    assert_eq!(directory.query_count(), 1);

    let mut buf = [0u8; 4];
    let err = client.read(fd, &mut buf).await.unwrap_err();
    assert!(err.is_not_found());

    // The stale record was dropped: the next lookup queries again.
    client.get_file_info("/stale").await.unwrap();
    assert_eq!(directory.query_count(), 2);

    node.stop().await;
}

#[tokio::test]
async fn test_write_requires_writable_fd() {
    let directory = ScriptedDirectory::start().await;
    directory.put_record(file_record("/ro", vec![]));
    let client = client_for(&directory);

    let fd = client.open("/ro", 0).await.unwrap();
    let err = client.write(fd, b"nope").await.unwrap_err();
    assert!(matches!(err, DfsError::InvalidParam(_)));
}

#[tokio::test]
async fn test_write_without_allocated_chunks_fails() {
    let directory = ScriptedDirectory::start().await;
    directory.put_record(file_record("/empty", vec![]));
    let client = client_for(&directory);

    let fd = client.open("/empty", OPEN_FLAG_WRITE).await.unwrap();
    let err = client.write(fd, b"data").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_close_unknown_fd_fails() {
    let directory = ScriptedDirectory::start().await;
    let client = client_for(&directory);

    let err = client.close(99).await.unwrap_err();
    assert!(matches!(err, DfsError::ClosedHandle(_)));

    let mut buf = [0u8; 1];
    let err = client.read(99, &mut buf).await.unwrap_err();
    assert!(matches!(err, DfsError::ClosedHandle(_)));
    let err = client.write(99, b"x").await.unwrap_err();
    assert!(matches!(err, DfsError::ClosedHandle(_)));
}

#[tokio::test]
async fn test_fds_are_distinct_and_reusable_state() {
    let directory = ScriptedDirectory::start().await;
    directory.put_record(file_record("/a", vec![]));
    let client = client_for(&directory);

    let fd1 = client.open("/a", 0).await.unwrap();
    let fd2 = client.open("/a", 0).await.unwrap();
    assert_ne!(fd1, fd2);
    client.close(fd1).await.unwrap();
    // Closing twice reports the handle as gone.
    assert!(client.close(fd1).await.is_err());
    client.close(fd2).await.unwrap();
}

#[test]
fn test_select_nearest_replica_is_deterministic() {
    let replicas: Vec<ChunkLocation> = (0..3)
        .map(|i| ChunkLocation {
            server_id: format!("cs-{}", i),
            ip: format!("10.0.0.{}", i),
            port: 9000 + i as u16,
            generation: 1,
        })
        .collect();
    let first = crate::select_nearest_replica(&replicas).unwrap();
    assert_eq!(first.server_id, "cs-0");
    // Same input, same choice.
    assert_eq!(crate::select_nearest_replica(&replicas).unwrap(), first);
    assert!(crate::select_nearest_replica(&[]).is_none());
}

#[tokio::test]
async fn test_directory_unreachable_surfaces() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let mut config = ClientConfig::new(&dead_addr.ip().to_string(), dead_addr.port());
    config.retry_backoff = Duration::from_millis(10);
    let client = DfsClient::with_config(config);

    let err = client.create_file("/x", None).await.unwrap_err();
    assert!(matches!(err, DfsError::DirectoryUnreachable(_)));
}
