//! XEP-0138 `zlib` stream compression.
//!
//! Both directions are a single zlib stream for the lifetime of the session.
//! Every outbound write ends with a sync flush so the server can decode it
//! without waiting for more data.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{NegotiationError, SecurityLayerCondition};

pub const ZLIB_METHOD: &str = "zlib";

const CHUNK: usize = 4096;

fn layer_err(detail: impl Into<String>) -> NegotiationError {
    NegotiationError::security_layer(SecurityLayerCondition::Compression, detail)
}

pub struct ZlibLayer {
    compress: Compress,
    decompress: Decompress,
}

impl ZlibLayer {
    pub fn new() -> Self {
        Self {
            compress: Compress::new(Compression::default(), true),
            decompress: Decompress::new(true),
        }
    }

    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, NegotiationError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let start = self.compress.total_in();
        let mut out = Vec::with_capacity(data.len() / 2 + CHUNK);
        loop {
            let consumed = (self.compress.total_in() - start) as usize;
            if out.len() == out.capacity() {
                out.reserve(CHUNK);
            }
            self.compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| layer_err(e.to_string()))?;
            let consumed = (self.compress.total_in() - start) as usize;
            // Spare output space after a sync flush means the flush completed.
            if consumed == data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }

    pub fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, NegotiationError> {
        let start = self.decompress.total_in();
        let mut out = Vec::with_capacity(data.len() * 4 + CHUNK);
        loop {
            let consumed_before = (self.decompress.total_in() - start) as usize;
            let produced_before = out.len();
            if out.len() == out.capacity() {
                out.reserve(CHUNK);
            }
            let status = self
                .decompress
                .decompress_vec(&data[consumed_before..], &mut out, FlushDecompress::Sync)
                .map_err(|e| layer_err(e.to_string()))?;
            let consumed = (self.decompress.total_in() - start) as usize;
            match status {
                Status::StreamEnd => {
                    return Err(layer_err("peer ended the compressed stream"));
                }
                Status::Ok | Status::BufError => {
                    let stalled = consumed == consumed_before && out.len() == produced_before;
                    if (consumed == data.len() && out.len() < out.capacity()) || stalled {
                        return Ok(out);
                    }
                }
            }
        }
    }
}

impl Default for ZlibLayer {
    fn default() -> Self {
        Self::new()
    }
}
