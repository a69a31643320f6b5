//! Field-by-field little-endian serialization helpers.
//!
//! Variable-length fields (strings, blobs, vectors) are length-prefixed with
//! a u32 count. Nothing here assumes platform struct layout; every field is
//! written and read explicitly.

use bytes::{BufMut, BytesMut};

use crate::{DfsError, DfsResult};

pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_u64_list(&mut self, v: &[u64]) {
        self.buf.put_u32_le(v.len() as u32);
        for item in v {
            self.buf.put_u64_le(*item);
        }
    }

    pub fn into_bytes(self) -> bytes::Bytes {
        self.buf.freeze()
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> DfsResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(DfsError::DecodeError(format!(
                "need {} bytes, {} remaining",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_u8(&mut self) -> DfsResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> DfsResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> DfsResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> DfsResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_bool(&mut self) -> DfsResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    fn get_len(&mut self) -> DfsResult<usize> {
        let len = self.get_u32()? as usize;
        if len > self.buf.len() {
            return Err(DfsError::DecodeError(format!(
                "length prefix {} exceeds {} remaining bytes",
                len,
                self.buf.len()
            )));
        }
        Ok(len)
    }

    pub fn get_bytes(&mut self) -> DfsResult<Vec<u8>> {
        let len = self.get_len()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_str(&mut self) -> DfsResult<String> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw).map_err(|e| DfsError::DecodeError(format!("invalid utf8: {}", e)))
    }

    pub fn get_u64_list(&mut self) -> DfsResult<Vec<u64>> {
        let count = self.get_u32()? as usize;
        if count.saturating_mul(8) > self.buf.len() {
            return Err(DfsError::DecodeError(format!(
                "u64 list count {} exceeds {} remaining bytes",
                count,
                self.buf.len()
            )));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.get_u64()?);
        }
        Ok(out)
    }

    /// Fails if any input bytes are left unconsumed.
    pub fn finish(self) -> DfsResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DfsError::DecodeError(format!(
                "{} trailing bytes after message body",
                self.buf.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut w = WireWriter::new();
        w.put_u8(0xAB);
        w.put_u16(0xBEEF);
        w.put_u32(0xDEAD_BEEF);
        w.put_u64(0x0123_4567_89AB_CDEF);
        w.put_bool(true);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 0xAB);
        assert_eq!(r.get_u16().unwrap(), 0xBEEF);
        assert_eq!(r.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.get_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert!(r.get_bool().unwrap());
        r.finish().unwrap();
    }

    #[test]
    fn test_little_endian_layout() {
        let mut w = WireWriter::new();
        w.put_u32(0xDEAD_BEEF);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..], &[0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_var_fields_round_trip() {
        let mut w = WireWriter::new();
        w.put_str("/data/a.bin");
        w.put_bytes(&[1, 2, 3]);
        w.put_u64_list(&[10, 20, 30]);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_str().unwrap(), "/data/a.bin");
        assert_eq!(r.get_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(r.get_u64_list().unwrap(), vec![10, 20, 30]);
        r.finish().unwrap();
    }

    #[test]
    fn test_truncated_input_rejected() {
        let mut w = WireWriter::new();
        w.put_u64(7);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes[..5]);
        assert!(matches!(r.get_u64(), Err(DfsError::DecodeError(_))));
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        // Length prefix claims far more bytes than the buffer holds.
        let mut w = WireWriter::new();
        w.put_u32(u32::MAX);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert!(matches!(r.get_bytes(), Err(DfsError::DecodeError(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut w = WireWriter::new();
        w.put_u8(1);
        w.put_u8(2);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        r.get_u8().unwrap();
        assert!(matches!(r.finish(), Err(DfsError::DecodeError(_))));
    }
}
