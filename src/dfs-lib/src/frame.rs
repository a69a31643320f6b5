//! Framed wire envelope.
//!
//! Every message travels as a fixed 16-byte little-endian header followed by
//! a checksum-protected payload:
//!
//! | offset | size | field        |
//! |--------|------|--------------|
//! | 0      | 4    | magic        |
//! | 4      | 2    | version      |
//! | 6      | 2    | message_type |
//! | 8      | 4    | payload_size |
//! | 12     | 4    | checksum     |
//! | 16     | N    | payload      |
//!
//! Decode verifies, in order: magic, version, payload_size bound, CRC32 of
//! the payload. Any failure is a hard `InvalidFrame`; the caller drops the
//! connection without replying.

use bytes::Bytes;
use log::warn;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    DfsError, DfsResult, WireReader, WireWriter, CHUNK_SIZE_BYTES, NETWORK_TIMEOUT_MS,
    PROTOCOL_MAGIC, PROTOCOL_VERSION,
};

pub const FRAME_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Read = 0x01,
    Write = 0x02,
    Delete = 0x03,
    Replicate = 0x04,
    Heartbeat = 0x05,
    MetadataQuery = 0x06,
    FileCreate = 0x07,
    FileDelete = 0x08,
    Mkdir = 0x09,
    Ack = 0xFF,
}

impl MessageType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x01 => Some(MessageType::Read),
            0x02 => Some(MessageType::Write),
            0x03 => Some(MessageType::Delete),
            0x04 => Some(MessageType::Replicate),
            0x05 => Some(MessageType::Heartbeat),
            0x06 => Some(MessageType::MetadataQuery),
            0x07 => Some(MessageType::FileCreate),
            0x08 => Some(MessageType::FileDelete),
            0x09 => Some(MessageType::Mkdir),
            0xFF => Some(MessageType::Ack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: Bytes) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        w.put_u32(PROTOCOL_MAGIC);
        w.put_u16(PROTOCOL_VERSION);
        w.put_u16(self.message_type as u16);
        w.put_u32(self.payload.len() as u32);
        w.put_u32(crc32fast::hash(&self.payload));
        let mut buf = w.into_bytes().to_vec();
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }

    /// Decodes a complete frame from a contiguous buffer. Socket paths use
    /// [`recv_frame`], which performs the same checks incrementally.
    pub fn decode(buf: &[u8]) -> DfsResult<Frame> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(DfsError::InvalidFrame(format!(
                "frame shorter than header: {} bytes",
                buf.len()
            )));
        }
        let header = FrameHeader::decode(&buf[..FRAME_HEADER_SIZE])?;
        let payload = &buf[FRAME_HEADER_SIZE..];
        if payload.len() != header.payload_size as usize {
            return Err(DfsError::InvalidFrame(format!(
                "payload length {} does not match declared size {}",
                payload.len(),
                header.payload_size
            )));
        }
        header.verify_payload(payload)?;
        Ok(Frame {
            message_type: header.message_type,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub payload_size: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Parses and verifies the 16-byte header: magic, version, size bound.
    /// The payload checksum is verified separately once the payload arrives.
    pub fn decode(buf: &[u8]) -> DfsResult<FrameHeader> {
        let mut r = WireReader::new(buf);
        let magic = r
            .get_u32()
            .map_err(|e| DfsError::InvalidFrame(e.to_string()))?;
        if magic != PROTOCOL_MAGIC {
            return Err(DfsError::InvalidFrame(format!(
                "bad magic: {:#010x}",
                magic
            )));
        }
        let version = r
            .get_u16()
            .map_err(|e| DfsError::InvalidFrame(e.to_string()))?;
        if version != PROTOCOL_VERSION {
            return Err(DfsError::InvalidFrame(format!(
                "unsupported protocol version: {}",
                version
            )));
        }
        let raw_type = r
            .get_u16()
            .map_err(|e| DfsError::InvalidFrame(e.to_string()))?;
        let message_type = MessageType::from_u16(raw_type)
            .ok_or_else(|| DfsError::InvalidFrame(format!("unknown message type {:#06x}", raw_type)))?;
        let payload_size = r
            .get_u32()
            .map_err(|e| DfsError::InvalidFrame(e.to_string()))?;
        if payload_size as u64 > CHUNK_SIZE_BYTES {
            return Err(DfsError::InvalidFrame(format!(
                "payload size {} exceeds limit {}",
                payload_size, CHUNK_SIZE_BYTES
            )));
        }
        let checksum = r
            .get_u32()
            .map_err(|e| DfsError::InvalidFrame(e.to_string()))?;
        Ok(FrameHeader {
            message_type,
            payload_size,
            checksum,
        })
    }

    pub fn verify_payload(&self, payload: &[u8]) -> DfsResult<()> {
        let actual = crc32fast::hash(payload);
        if actual != self.checksum {
            return Err(DfsError::InvalidFrame(format!(
                "checksum mismatch: header {:#010x}, payload {:#010x}",
                self.checksum, actual
            )));
        }
        Ok(())
    }
}

fn io_timeout() -> Duration {
    Duration::from_millis(NETWORK_TIMEOUT_MS)
}

/// Writes one frame, bounded by the network timeout.
pub async fn send_frame<S>(stream: &mut S, frame: &Frame) -> DfsResult<()>
where
    S: AsyncWrite + Unpin,
{
    let encoded = frame.encode();
    tokio::time::timeout(io_timeout(), stream.write_all(&encoded))
        .await
        .map_err(|_| DfsError::Timeout("send_frame timed out".to_string()))?
        .map_err(|e| DfsError::IoError(format!("send_frame failed: {}", e)))?;
    Ok(())
}

/// Reads one frame, verifying header then checksum. Returns `InvalidFrame`
/// on any verification failure; the caller must drop the connection without
/// attempting to parse further frames.
pub async fn recv_frame<S>(stream: &mut S) -> DfsResult<Frame>
where
    S: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    tokio::time::timeout(io_timeout(), stream.read_exact(&mut header_buf))
        .await
        .map_err(|_| DfsError::Timeout("recv_frame header timed out".to_string()))?
        .map_err(|e| DfsError::IoError(format!("recv_frame header failed: {}", e)))?;

    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_size as usize];
    tokio::time::timeout(io_timeout(), stream.read_exact(&mut payload))
        .await
        .map_err(|_| DfsError::Timeout("recv_frame payload timed out".to_string()))?
        .map_err(|e| DfsError::IoError(format!("recv_frame payload failed: {}", e)))?;

    if let Err(e) = header.verify_payload(&payload) {
        warn!("recv_frame: dropping corrupt frame: {}", e);
        return Err(e);
    }

    Ok(Frame {
        message_type: header.message_type,
        payload: Bytes::from(payload),
    })
}
