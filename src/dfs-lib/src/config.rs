//! Protocol and fabric-wide constants.

pub const CHUNK_SIZE_MB: u64 = 64;
pub const CHUNK_SIZE_BYTES: u64 = CHUNK_SIZE_MB * 1024 * 1024;

pub const REPLICATION_FACTOR: u32 = 3;
pub const MINIMUM_REPLICAS: u32 = 2;

pub const HEARTBEAT_INTERVAL_SEC: u64 = 3;
pub const HEARTBEAT_TIMEOUT_SEC: u64 = 60;

pub const METADATA_CACHE_TTL_SEC: u64 = 300;

pub const MAX_CONCURRENT_CLIENTS: usize = 1000;
pub const NETWORK_TIMEOUT_MS: u64 = 5000;

pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BACKOFF_MS: u64 = 100;

pub const PROTOCOL_MAGIC: u32 = 0xDEAD_BEEF;
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest data blob a single read or write RPC may carry. The frame payload
/// is capped at `CHUNK_SIZE_BYTES`, so the data field must leave headroom
/// for the fixed request/response fields around it; the remainder of a
/// full-chunk transfer surfaces as a short read or short write.
pub const MAX_FRAME_IO_BYTES: u64 = CHUNK_SIZE_BYTES - 512;

pub const DEFAULT_CONNECTION_POOL_SIZE: usize = 20;
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;
