//! Splitting a byte range across chunk boundaries.

use dfs_lib::{CHUNK_SIZE_BYTES, MAX_FRAME_IO_BYTES};

/// One piece of a file-level byte range, addressed to a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub chunk_index: usize,
    pub offset_in_chunk: u64,
    pub len: u64,
}

/// Splits `[offset, offset + len)` on chunk boundaries, in order. Spans are
/// additionally capped at the per-RPC data limit, so each span maps to
/// exactly one request.
pub fn chunk_spans(offset: u64, len: u64) -> Vec<ChunkSpan> {
    chunk_spans_sized(offset, len, CHUNK_SIZE_BYTES, MAX_FRAME_IO_BYTES)
}

fn chunk_spans_sized(offset: u64, len: u64, chunk_size: u64, max_span: u64) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    let mut pos = offset;
    let end = offset + len;
    while pos < end {
        let chunk_index = (pos / chunk_size) as usize;
        let offset_in_chunk = pos % chunk_size;
        let to_chunk_end = chunk_size - offset_in_chunk;
        let span_len = (end - pos).min(to_chunk_end).min(max_span);
        spans.push(ChunkSpan {
            chunk_index,
            offset_in_chunk,
            len: span_len,
        });
        pos += span_len;
    }
    spans
}
