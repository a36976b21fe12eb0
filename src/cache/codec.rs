//! Threshold-gated gzip compression for cached payloads.

use crate::{Error, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 10 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    threshold: usize,
    level: Compression,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl Codec {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            level: Compression::fast(),
        }
    }

    /// Compression level 0-9.
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Compress payloads at or above the threshold.
    ///
    /// Returns the input untouched (`compressed = false`) when it is below the
    /// threshold or when gzip would not make it smaller.
    pub fn maybe_compress(&self, data: Bytes) -> (Bytes, bool) {
        if data.len() < self.threshold {
            return (data, false);
        }
        match self.gzip(&data) {
            Ok(packed) if packed.len() < data.len() => (Bytes::from(packed), true),
            Ok(_) => (data, false),
            Err(e) => {
                tracing::warn!(error = %e, size = data.len(), "compression failed, storing raw");
                (data, false)
            }
        }
    }

    /// Inflate `data`, which must expand to exactly `expected_len` bytes.
    /// Output is capped one byte past that, so a bad record cannot balloon.
    pub fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Bytes> {
        let mut out = Vec::with_capacity(expected_len.min(data.len().saturating_mul(8)));
        GzDecoder::new(data)
            .take((expected_len as u64).saturating_add(1))
            .read_to_end(&mut out)
            .map_err(|e| Error::codec(format!("gzip decode failed: {}", e)))?;
        if out.len() != expected_len {
            return Err(Error::codec(format!(
                "decoded size mismatch: expected {} bytes, got {}{}",
                expected_len,
                out.len(),
                if out.len() > expected_len { " or more" } else { "" }
            )));
        }
        Ok(Bytes::from(out))
    }

    fn gzip(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder.write_all(data)?;
        encoder.finish()
    }
}
