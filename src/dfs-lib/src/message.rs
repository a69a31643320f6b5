//! Typed request/response bodies.
//!
//! Each message owns its payload encoding; a response travels under the same
//! message code as the request that caused it, generic acknowledgments under
//! `OP_ACK`. `encode` and `decode` are exact inverses for every type.

use bytes::Bytes;

use crate::{
    DfsError, DfsResult, ErrorCode, FileMetadata, Frame, MessageType, WireReader, WireWriter,
};

/// Outcome carried inside response bodies. Failures keep a stable code so
/// the peer can map them back onto error kinds without string matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireStatus {
    Ok,
    Err { code: ErrorCode, message: String },
}

impl WireStatus {
    pub fn failure(err: &DfsError) -> Self {
        WireStatus::Err {
            code: ErrorCode::from(err),
            message: err.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, WireStatus::Ok)
    }

    /// Converts a failed status back into the error it reported.
    pub fn into_result(self) -> DfsResult<()> {
        match self {
            WireStatus::Ok => Ok(()),
            WireStatus::Err { code, message } => Err(code.into_error(message)),
        }
    }

    fn encode(&self, w: &mut WireWriter) {
        match self {
            WireStatus::Ok => w.put_bool(true),
            WireStatus::Err { code, message } => {
                w.put_bool(false);
                w.put_u16(*code as u16);
                w.put_str(message);
            }
        }
    }

    fn decode(r: &mut WireReader<'_>) -> DfsResult<Self> {
        if r.get_bool()? {
            return Ok(WireStatus::Ok);
        }
        let raw_code = r.get_u16()?;
        let code = ErrorCode::from_u16(raw_code)
            .ok_or_else(|| DfsError::DecodeError(format!("unknown error code {}", raw_code)))?;
        Ok(WireStatus::Err {
            code,
            message: r.get_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunkRequest {
    pub chunk_id: u64,
    pub offset: u32,
    pub length: u32,
    pub version: u32,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunkResponse {
    pub chunk_id: u64,
    pub offset: u32,
    pub length: u32,
    pub data: Vec<u8>,
    pub status: WireStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunkRequest {
    pub chunk_id: u64,
    pub offset: u32,
    pub data: Vec<u8>,
    pub version_hint: u32,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunkResponse {
    pub chunk_id: u64,
    pub status: WireStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteChunkRequest {
    pub chunk_id: u64,
}

/// Replication travels in two wire forms: a push command naming the target
/// endpoint that should receive a copy, and an install form carrying the raw
/// bytes, applied through the normal write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicateRequest {
    Push {
        chunk_id: u64,
        target_ip: String,
        target_port: u16,
    },
    Install {
        chunk_id: u64,
        data: Vec<u8>,
    },
}

const REPLICATE_MODE_PUSH: u8 = 0;
const REPLICATE_MODE_INSTALL: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatMessage {
    pub server_id: String,
    pub timestamp: u64,
    pub healthy_chunks: Vec<u64>,
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub replication_queue_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataQueryRequest {
    pub path: String,
    pub client_id: String,
    pub operation: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataQueryResponse {
    pub path: String,
    pub metadata: Option<FileMetadata>,
    pub status: WireStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCreateRequest {
    pub path: String,
    pub permissions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDeleteRequest {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkdirRequest {
    pub path: String,
}

/// Generic acknowledgment. `file_id` is meaningful for OP_FILE_CREATE acks
/// and zero everywhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResponse {
    pub status: WireStatus,
    pub file_id: u64,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self {
            status: WireStatus::Ok,
            file_id: 0,
        }
    }

    pub fn failure(err: &DfsError) -> Self {
        Self {
            status: WireStatus::failure(err),
            file_id: 0,
        }
    }
}

impl ReadChunkRequest {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_u64(self.chunk_id);
        w.put_u32(self.offset);
        w.put_u32(self.length);
        w.put_u32(self.version);
        w.put_str(&self.client_id);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            chunk_id: r.get_u64()?,
            offset: r.get_u32()?,
            length: r.get_u32()?,
            version: r.get_u32()?,
            client_id: r.get_str()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Read, self.encode())
    }
}

impl ReadChunkResponse {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::with_capacity(32 + self.data.len());
        w.put_u64(self.chunk_id);
        w.put_u32(self.offset);
        w.put_u32(self.length);
        w.put_bytes(&self.data);
        self.status.encode(&mut w);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            chunk_id: r.get_u64()?,
            offset: r.get_u32()?,
            length: r.get_u32()?,
            data: r.get_bytes()?,
            status: WireStatus::decode(&mut r)?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Read, self.encode())
    }
}

impl WriteChunkRequest {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::with_capacity(32 + self.data.len());
        w.put_u64(self.chunk_id);
        w.put_u32(self.offset);
        w.put_bytes(&self.data);
        w.put_u32(self.version_hint);
        w.put_str(&self.client_id);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            chunk_id: r.get_u64()?,
            offset: r.get_u32()?,
            data: r.get_bytes()?,
            version_hint: r.get_u32()?,
            client_id: r.get_str()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Write, self.encode())
    }
}

impl WriteChunkResponse {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_u64(self.chunk_id);
        self.status.encode(&mut w);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            chunk_id: r.get_u64()?,
            status: WireStatus::decode(&mut r)?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Write, self.encode())
    }
}

impl DeleteChunkRequest {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_u64(self.chunk_id);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            chunk_id: r.get_u64()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Delete, self.encode())
    }
}

impl ReplicateRequest {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        match self {
            ReplicateRequest::Push {
                chunk_id,
                target_ip,
                target_port,
            } => {
                w.put_u8(REPLICATE_MODE_PUSH);
                w.put_u64(*chunk_id);
                w.put_str(target_ip);
                w.put_u16(*target_port);
            }
            ReplicateRequest::Install { chunk_id, data } => {
                w.put_u8(REPLICATE_MODE_INSTALL);
                w.put_u64(*chunk_id);
                w.put_bytes(data);
            }
        }
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let mode = r.get_u8()?;
        let msg = match mode {
            REPLICATE_MODE_PUSH => ReplicateRequest::Push {
                chunk_id: r.get_u64()?,
                target_ip: r.get_str()?,
                target_port: r.get_u16()?,
            },
            REPLICATE_MODE_INSTALL => ReplicateRequest::Install {
                chunk_id: r.get_u64()?,
                data: r.get_bytes()?,
            },
            other => {
                return Err(DfsError::DecodeError(format!(
                    "unknown replicate mode {}",
                    other
                )))
            }
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Replicate, self.encode())
    }
}

impl HeartbeatMessage {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_str(&self.server_id);
        w.put_u64(self.timestamp);
        w.put_u64_list(&self.healthy_chunks);
        w.put_u64(self.total_capacity);
        w.put_u64(self.used_capacity);
        w.put_u32(self.replication_queue_length);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            server_id: r.get_str()?,
            timestamp: r.get_u64()?,
            healthy_chunks: r.get_u64_list()?,
            total_capacity: r.get_u64()?,
            used_capacity: r.get_u64()?,
            replication_queue_length: r.get_u32()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Heartbeat, self.encode())
    }
}

impl MetadataQueryRequest {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_str(&self.path);
        w.put_str(&self.client_id);
        w.put_u16(self.operation);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            path: r.get_str()?,
            client_id: r.get_str()?,
            operation: r.get_u16()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::MetadataQuery, self.encode())
    }
}

impl MetadataQueryResponse {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_str(&self.path);
        match &self.metadata {
            Some(metadata) => {
                w.put_bool(true);
                metadata.encode(&mut w);
            }
            None => w.put_bool(false),
        }
        self.status.encode(&mut w);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let path = r.get_str()?;
        let metadata = if r.get_bool()? {
            Some(FileMetadata::decode(&mut r)?)
        } else {
            None
        };
        let msg = Self {
            path,
            metadata,
            status: WireStatus::decode(&mut r)?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::MetadataQuery, self.encode())
    }
}

impl FileCreateRequest {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_str(&self.path);
        w.put_u32(self.permissions);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            path: r.get_str()?,
            permissions: r.get_u32()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::FileCreate, self.encode())
    }
}

impl FileDeleteRequest {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_str(&self.path);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            path: r.get_str()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::FileDelete, self.encode())
    }
}

impl MkdirRequest {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_str(&self.path);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            path: r.get_str()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Mkdir, self.encode())
    }
}

impl AckResponse {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        self.status.encode(&mut w);
        w.put_u64(self.file_id);
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> DfsResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            status: WireStatus::decode(&mut r)?,
            file_id: r.get_u64()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Ack, self.encode())
    }
}
