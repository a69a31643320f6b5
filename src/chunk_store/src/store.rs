//! The chunk table: the node-local, authoritative copy of every chunk this
//! server holds.
//!
//! One mutex protects both the chunk map and the capacity counter; capacity
//! accounting is inseparable from membership, so every mutation commits both
//! under the same guard. The lock is held for in-memory splicing and the
//! local disk commit, never across network I/O.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dfs_lib::{current_unix_ts, DfsError, DfsResult, CHUNK_SIZE_BYTES};

const CHUNK_FILE_EXT: &str = "chunk";
const META_FILE_EXT: &str = "meta";
const TMP_FILE_EXT: &str = "tmp";

#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk_id: u64,
    pub data: Vec<u8>,
    pub version: u32,
    pub size: u64,
    pub creation_time: u64,
    pub last_access: u64,
    pub checksum: u32,
}

/// Sidecar record persisted next to each chunk file, so version and checksum
/// survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkMetaRecord {
    chunk_id: u64,
    version: u32,
    checksum: u32,
    creation_time: u64,
    last_access: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub chunk_id: u64,
    pub version: u32,
    pub size: u64,
}

/// Point-in-time view of the table used for heartbeats and status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub healthy_chunks: Vec<u64>,
    pub used_capacity: u64,
    pub total_capacity: u64,
}

struct StoreInner {
    chunks: HashMap<u64, StoredChunk>,
    used_capacity: u64,
}

pub struct ChunkStore {
    max_capacity: u64,
    storage_dir: Option<PathBuf>,
    inner: Mutex<StoreInner>,
}

impl ChunkStore {
    /// Volatile store: chunks live in memory only.
    pub fn new(max_capacity: u64) -> Self {
        Self {
            max_capacity,
            storage_dir: None,
            inner: Mutex::new(StoreInner {
                chunks: HashMap::new(),
                used_capacity: 0,
            }),
        }
    }

    /// Disk-backed store: one `<id>.chunk` file plus `<id>.meta` sidecar per
    /// chunk. Existing chunks are reloaded; entries whose bytes no longer
    /// match their recorded checksum are skipped.
    pub fn open(max_capacity: u64, storage_dir: PathBuf) -> DfsResult<Self> {
        fs::create_dir_all(&storage_dir)
            .map_err(|e| DfsError::IoError(format!("create storage dir failed: {}", e)))?;

        let mut chunks = HashMap::new();
        let mut used_capacity = 0u64;

        let entries = fs::read_dir(&storage_dir)
            .map_err(|e| DfsError::IoError(format!("read storage dir failed: {}", e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| DfsError::IoError(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_FILE_EXT) {
                continue;
            }
            match Self::load_chunk(&path) {
                Ok(chunk) => {
                    used_capacity += chunk.size;
                    chunks.insert(chunk.chunk_id, chunk);
                }
                Err(e) => {
                    warn!(
                        "ChunkStore: skipping {}: {}",
                        path.to_string_lossy(),
                        e
                    );
                }
            }
        }

        info!(
            "ChunkStore: loaded {} chunks, {} bytes used from {}",
            chunks.len(),
            used_capacity,
            storage_dir.to_string_lossy()
        );

        Ok(Self {
            max_capacity,
            storage_dir: Some(storage_dir),
            inner: Mutex::new(StoreInner {
                chunks,
                used_capacity,
            }),
        })
    }

    fn load_chunk(chunk_path: &Path) -> DfsResult<StoredChunk> {
        let stem = chunk_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DfsError::Internal("chunk file has no stem".to_string()))?;
        let chunk_id: u64 = stem
            .parse()
            .map_err(|_| DfsError::DecodeError(format!("bad chunk file name: {}", stem)))?;

        let data = fs::read(chunk_path)
            .map_err(|e| DfsError::IoError(format!("read chunk file failed: {}", e)))?;
        let meta_path = chunk_path.with_extension(META_FILE_EXT);
        let meta_raw = fs::read_to_string(&meta_path)
            .map_err(|e| DfsError::IoError(format!("read chunk meta failed: {}", e)))?;
        let meta: ChunkMetaRecord = serde_json::from_str(&meta_raw)
            .map_err(|e| DfsError::DecodeError(format!("parse chunk meta failed: {}", e)))?;

        if meta.chunk_id != chunk_id {
            return Err(DfsError::DecodeError(format!(
                "meta chunk_id {} does not match file name {}",
                meta.chunk_id, chunk_id
            )));
        }
        let checksum = crc32fast::hash(&data);
        if checksum != meta.checksum {
            return Err(DfsError::DecodeError(format!(
                "chunk {} checksum mismatch: stored {:#010x}, computed {:#010x}",
                chunk_id, meta.checksum, checksum
            )));
        }

        Ok(StoredChunk {
            chunk_id,
            size: data.len() as u64,
            data,
            version: meta.version,
            creation_time: meta.creation_time,
            last_access: meta.last_access,
            checksum,
        })
    }

    fn chunk_path(dir: &Path, chunk_id: u64) -> PathBuf {
        dir.join(format!("{}.{}", chunk_id, CHUNK_FILE_EXT))
    }

    fn meta_path(dir: &Path, chunk_id: u64) -> PathBuf {
        dir.join(format!("{}.{}", chunk_id, META_FILE_EXT))
    }

    fn persist_chunk(dir: &Path, chunk: &StoredChunk) -> DfsResult<()> {
        let final_path = Self::chunk_path(dir, chunk.chunk_id);
        let tmp_path = final_path.with_extension(TMP_FILE_EXT);
        fs::write(&tmp_path, &chunk.data)
            .map_err(|e| DfsError::IoError(format!("write chunk file failed: {}", e)))?;
        fs::rename(&tmp_path, &final_path)
            .map_err(|e| DfsError::IoError(format!("commit chunk file failed: {}", e)))?;

        let meta = ChunkMetaRecord {
            chunk_id: chunk.chunk_id,
            version: chunk.version,
            checksum: chunk.checksum,
            creation_time: chunk.creation_time,
            last_access: chunk.last_access,
        };
        let meta_raw =
            serde_json::to_string(&meta).map_err(|e| DfsError::Internal(e.to_string()))?;
        let meta_final = Self::meta_path(dir, chunk.chunk_id);
        let meta_tmp = meta_final.with_extension(TMP_FILE_EXT);
        fs::write(&meta_tmp, meta_raw)
            .map_err(|e| DfsError::IoError(format!("write chunk meta failed: {}", e)))?;
        fs::rename(&meta_tmp, &meta_final)
            .map_err(|e| DfsError::IoError(format!("commit chunk meta failed: {}", e)))?;
        Ok(())
    }

    fn remove_chunk_files(dir: &Path, chunk_id: u64) {
        for path in [Self::chunk_path(dir, chunk_id), Self::meta_path(dir, chunk_id)] {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "ChunkStore: remove {} failed: {}",
                        path.to_string_lossy(),
                        e
                    );
                }
            }
        }
    }

    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    pub fn used_capacity(&self) -> u64 {
        self.inner.lock().unwrap().used_capacity
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }

    /// Writes `data` at `offset` within the chunk, creating it on first
    /// write. New chunks must start at offset 0; updates grow the buffer
    /// zero-filled, splice the bytes in, bump the version and recompute the
    /// content checksum. Capacity accounting commits with the mutation.
    pub fn write(&self, chunk_id: u64, offset: u64, data: &[u8]) -> DfsResult<WriteOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let now = current_unix_ts();

        let outcome = match inner.chunks.get(&chunk_id) {
            None => {
                if inner.used_capacity + data.len() as u64 > self.max_capacity {
                    return Err(DfsError::OutOfCapacity(format!(
                        "chunk {}: {} used + {} new exceeds {} max",
                        chunk_id,
                        inner.used_capacity,
                        data.len(),
                        self.max_capacity
                    )));
                }
                if offset != 0 {
                    return Err(DfsError::BadOffset(format!(
                        "first write to chunk {} at offset {}",
                        chunk_id, offset
                    )));
                }
                if data.len() as u64 > CHUNK_SIZE_BYTES {
                    return Err(DfsError::InvalidParam(format!(
                        "chunk {} write of {} bytes exceeds chunk size limit",
                        chunk_id,
                        data.len()
                    )));
                }
                let chunk = StoredChunk {
                    chunk_id,
                    data: data.to_vec(),
                    version: 1,
                    size: data.len() as u64,
                    creation_time: now,
                    last_access: now,
                    checksum: crc32fast::hash(data),
                };
                inner.used_capacity += chunk.size;
                let outcome = WriteOutcome {
                    chunk_id,
                    version: chunk.version,
                    size: chunk.size,
                };
                inner.chunks.insert(chunk_id, chunk);
                outcome
            }
            Some(existing) => {
                let current_size = existing.size;
                let new_size = (offset + data.len() as u64).max(current_size);
                if new_size > CHUNK_SIZE_BYTES {
                    return Err(DfsError::InvalidParam(format!(
                        "chunk {} would grow to {} bytes, past the chunk size limit",
                        chunk_id, new_size
                    )));
                }
                if inner.used_capacity - current_size + new_size > self.max_capacity {
                    return Err(DfsError::OutOfCapacity(format!(
                        "chunk {}: growing {} -> {} exceeds {} max",
                        chunk_id, current_size, new_size, self.max_capacity
                    )));
                }

                inner.used_capacity -= current_size;
                let chunk = inner.chunks.get_mut(&chunk_id).unwrap();
                chunk.data.resize(new_size as usize, 0);
                chunk.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);
                chunk.size = new_size;
                chunk.version += 1;
                chunk.last_access = now;
                chunk.checksum = crc32fast::hash(&chunk.data);
                let outcome = WriteOutcome {
                    chunk_id,
                    version: chunk.version,
                    size: chunk.size,
                };
                inner.used_capacity += new_size;
                outcome
            }
        };

        if let Some(dir) = &self.storage_dir {
            let chunk = inner.chunks.get(&chunk_id).unwrap();
            Self::persist_chunk(dir, chunk)?;
        }

        debug!(
            "ChunkStore: wrote chunk {} v{} size {}",
            outcome.chunk_id, outcome.version, outcome.size
        );
        Ok(outcome)
    }

    /// Copies out `[offset, min(offset + length, size))`. Reads past the
    /// current size fail; reads that run into the end of the chunk come back
    /// short.
    pub fn read(&self, chunk_id: u64, offset: u64, length: u64) -> DfsResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let chunk = inner
            .chunks
            .get_mut(&chunk_id)
            .ok_or_else(|| DfsError::NotFound(format!("chunk {}", chunk_id)))?;
        if offset >= chunk.size {
            return Err(DfsError::OutOfRange(format!(
                "chunk {}: offset {} past size {}",
                chunk_id, offset, chunk.size
            )));
        }
        let end = (offset + length).min(chunk.size);
        chunk.last_access = current_unix_ts();
        Ok(chunk.data[offset as usize..end as usize].to_vec())
    }

    /// Copies out the whole chunk, for replication pushes.
    pub fn read_all(&self, chunk_id: u64) -> DfsResult<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let chunk = inner
            .chunks
            .get(&chunk_id)
            .ok_or_else(|| DfsError::NotFound(format!("chunk {}", chunk_id)))?;
        Ok(chunk.data.clone())
    }

    /// Removes the chunk if present; deleting an absent chunk is a no-op.
    /// Returns whether anything was removed.
    pub fn delete(&self, chunk_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.chunks.remove(&chunk_id) {
            Some(chunk) => {
                inner.used_capacity -= chunk.size;
                if let Some(dir) = &self.storage_dir {
                    Self::remove_chunk_files(dir, chunk_id);
                }
                debug!("ChunkStore: deleted chunk {}", chunk_id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, chunk_id: u64) -> bool {
        self.inner.lock().unwrap().chunks.contains_key(&chunk_id)
    }

    /// Version and size of a chunk, if held.
    pub fn chunk_info(&self, chunk_id: u64) -> Option<(u32, u64, u32)> {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .get(&chunk_id)
            .map(|c| (c.version, c.size, c.checksum))
    }

    /// Consistent snapshot for heartbeats: membership and capacity are read
    /// under the same guard. Chunk ids come back sorted so repeated
    /// snapshots of the same state compare equal.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.lock().unwrap();
        let mut healthy_chunks: Vec<u64> = inner.chunks.keys().copied().collect();
        healthy_chunks.sort_unstable();
        StoreSnapshot {
            healthy_chunks,
            used_capacity: inner.used_capacity,
            total_capacity: self.max_capacity,
        }
    }
}
