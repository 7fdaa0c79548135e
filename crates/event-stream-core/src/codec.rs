// File: src/codec.rs
//
// Large-payload codec for the wide-column substrate.
// Payloads over the configured threshold are optionally gzip-compressed
// and split into row-sized chunks; continuation chunks land in sibling
// rows next to the primary event row.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{StoreError, StoreResult};

/// Hard upper bound for a single binary chunk stored in one row
pub const MAX_PAYLOAD_CHUNK_SIZE_BYTES: usize = 60 * 1024;

/// Default payload size above which the codec kicks in
pub const DEFAULT_PAYLOAD_CHUNK_THRESHOLD_BYTES: usize = 60 * 1024;

/// Sentinel stored in the textual payload column when the payload
/// lives in the binary field instead
pub const PAYLOAD_SENTINEL: &str = "{}";

/// Gzip-compress a byte buffer
pub fn gzip_compress(data: &[u8]) -> StoreResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| StoreError::SerializationError {
            message: format!("gzip compression failed: {}", e),
        })?;
    encoder.finish().map_err(|e| StoreError::SerializationError {
        message: format!("gzip compression finalization failed: {}", e),
    })
}

/// Gzip-decompress a byte buffer. Failures surface as corrupt payload:
/// a truncated or mangled buffer means data loss, not a caller bug.
pub fn gzip_decompress(data: &[u8]) -> StoreResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| StoreError::CorruptPayload {
            message: format!("gzip decompression failed: {}", e),
        })?;
    Ok(decompressed)
}

/// Split a buffer into chunks of at most `max_chunk_size` bytes
pub fn split_chunks(data: &[u8], max_chunk_size: usize) -> Vec<Vec<u8>> {
    data.chunks(max_chunk_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// How an event payload is laid out on the table substrate
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadEncoding {
    /// Payload stays in the textual column unchanged
    Inline { payload: String },
    /// Payload fits a single binary field on the primary row
    Binary { data: Vec<u8>, compressed: bool },
    /// Chunk 0 goes on the primary row, chunks 1..N-1 into sibling rows
    Chunked {
        chunks: Vec<Vec<u8>>,
        compressed: bool,
    },
}

impl PayloadEncoding {
    pub fn total_chunks(&self) -> usize {
        match self {
            PayloadEncoding::Inline { .. } | PayloadEncoding::Binary { .. } => 1,
            PayloadEncoding::Chunked { chunks, .. } => chunks.len(),
        }
    }
}

/// Encoder/decoder applying the chunking policy from settings
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    pub chunking_enabled: bool,
    pub compression_enabled: bool,
    pub threshold_bytes: usize,
    pub max_chunk_size_bytes: usize,
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self {
            chunking_enabled: true,
            compression_enabled: true,
            threshold_bytes: DEFAULT_PAYLOAD_CHUNK_THRESHOLD_BYTES,
            max_chunk_size_bytes: MAX_PAYLOAD_CHUNK_SIZE_BYTES,
        }
    }
}

impl PayloadCodec {
    /// Encode a serialized payload for row storage
    pub fn encode(&self, payload: &str) -> StoreResult<PayloadEncoding> {
        if !self.chunking_enabled || payload.len() <= self.threshold_bytes {
            return Ok(PayloadEncoding::Inline {
                payload: payload.to_string(),
            });
        }

        let (bytes, compressed) = if self.compression_enabled {
            (gzip_compress(payload.as_bytes())?, true)
        } else {
            (payload.as_bytes().to_vec(), false)
        };

        if bytes.len() <= self.max_chunk_size_bytes {
            Ok(PayloadEncoding::Binary {
                data: bytes,
                compressed,
            })
        } else {
            Ok(PayloadEncoding::Chunked {
                chunks: split_chunks(&bytes, self.max_chunk_size_bytes),
                compressed,
            })
        }
    }

    /// Decode a single binary buffer back to the payload text
    pub fn decode(&self, data: &[u8], compressed: bool) -> StoreResult<String> {
        let bytes = if compressed {
            gzip_decompress(data)?
        } else {
            data.to_vec()
        };
        String::from_utf8(bytes).map_err(|e| StoreError::CorruptPayload {
            message: format!("payload is not valid UTF-8: {}", e),
        })
    }

    /// Reassemble continuation chunks in index order and decode
    pub fn reassemble(&self, chunks: &[Vec<u8>], compressed: bool) -> StoreResult<String> {
        let mut combined = Vec::with_capacity(chunks.iter().map(|c| c.len()).sum());
        for chunk in chunks {
            combined.extend_from_slice(chunk);
        }
        self.decode(&combined, compressed)
    }
}
