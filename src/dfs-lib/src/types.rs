//! Fabric data model. These are value types that flow over the wire between
//! clients, storage nodes and the directory; they are never shared by
//! reference across processes.

use serde::{Deserialize, Serialize};

use crate::{DfsResult, WireReader, WireWriter};

/// Addressing triple of one replica of a chunk. The generation number is a
/// monotonic tag the directory uses to tell fresh replicas from stale ones
/// after failure recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub server_id: String,
    pub ip: String,
    pub port: u16,
    pub generation: u64,
}

impl ChunkLocation {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub(crate) fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.server_id);
        w.put_str(&self.ip);
        w.put_u16(self.port);
        w.put_u64(self.generation);
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> DfsResult<Self> {
        Ok(Self {
            server_id: r.get_str()?,
            ip: r.get_str()?,
            port: r.get_u16()?,
            generation: r.get_u64()?,
        })
    }
}

/// A logical chunk: identity, where its replicas live, and how it has
/// evolved. `version >= 1` once any write has succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHandle {
    pub chunk_id: u64,
    pub replicas: Vec<ChunkLocation>,
    pub version: u32,
    pub creation_time: u64,
    pub size: u64,
}

impl ChunkHandle {
    pub(crate) fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.chunk_id);
        w.put_u32(self.replicas.len() as u32);
        for replica in &self.replicas {
            replica.encode(w);
        }
        w.put_u32(self.version);
        w.put_u64(self.creation_time);
        w.put_u64(self.size);
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> DfsResult<Self> {
        let chunk_id = r.get_u64()?;
        let replica_count = r.get_u32()? as usize;
        let mut replicas = Vec::with_capacity(replica_count.min(64));
        for _ in 0..replica_count {
            replicas.push(ChunkLocation::decode(r)?);
        }
        Ok(Self {
            chunk_id,
            replicas,
            version: r.get_u32()?,
            creation_time: r.get_u64()?,
            size: r.get_u64()?,
        })
    }
}

/// Directory record for one path. For a regular file the chunk sizes sum to
/// `file_size`; for a directory the chunk list is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub file_id: u64,
    pub permissions: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub file_size: u64,
    pub chunks: Vec<ChunkHandle>,
    pub replication_factor: u32,
    pub owner: String,
    pub is_directory: bool,
}

impl FileMetadata {
    pub(crate) fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.path);
        w.put_u64(self.file_id);
        w.put_u32(self.permissions);
        w.put_u64(self.creation_time);
        w.put_u64(self.modification_time);
        w.put_u64(self.file_size);
        w.put_u32(self.chunks.len() as u32);
        for chunk in &self.chunks {
            chunk.encode(w);
        }
        w.put_u32(self.replication_factor);
        w.put_str(&self.owner);
        w.put_bool(self.is_directory);
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> DfsResult<Self> {
        let path = r.get_str()?;
        let file_id = r.get_u64()?;
        let permissions = r.get_u32()?;
        let creation_time = r.get_u64()?;
        let modification_time = r.get_u64()?;
        let file_size = r.get_u64()?;
        let chunk_count = r.get_u32()? as usize;
        let mut chunks = Vec::with_capacity(chunk_count.min(1024));
        for _ in 0..chunk_count {
            chunks.push(ChunkHandle::decode(r)?);
        }
        Ok(Self {
            path,
            file_id,
            permissions,
            creation_time,
            modification_time,
            file_size,
            chunks,
            replication_factor: r.get_u32()?,
            owner: r.get_str()?,
            is_directory: r.get_bool()?,
        })
    }
}

/// Health snapshot of a storage node, as reported by heartbeats and exposed
/// locally for inspection. `used_capacity` always equals the sum of the
/// stored chunk sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkServerStatus {
    pub server_id: String,
    pub ip: String,
    pub port: u16,
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub healthy_chunks: Vec<u64>,
    pub replication_queue_length: u32,
    pub last_heartbeat: u64,
    pub is_healthy: bool,
}
