//! Payload Compression
//!
//! LZ4 compression with automatic fallback to the uncompressed payload.
//!
//! # Example
//!
//! ```
//! use tiercache::cache::compression::{CompressionAlgorithm, CompressionManager};
//!
//! let manager = CompressionManager::new();
//! let data = b"Hello, this is test data that should compress well!".repeat(40);
//! let outcome = manager.compress(&data);
//!
//! let decompressed = manager.decompress(&outcome.data, outcome.algorithm).unwrap();
//! assert_eq!(decompressed.as_ref(), data.as_slice());
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is
    #[default]
    None,
    /// LZ4 block format with prepended size
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Compression settings
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Payloads smaller than this are stored uncompressed
    pub min_size_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: 1024,
            level: 3,
        }
    }
}

/// Codec implementation
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 codec
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }
}

/// Result of a compression attempt
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub data: Bytes,
    pub algorithm: CompressionAlgorithm,
    /// The codec failed and the payload was stored uncompressed
    pub fell_back: bool,
}

impl CompressionOutcome {
    fn plain(data: &[u8], fell_back: bool) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
            algorithm: CompressionAlgorithm::None,
            fell_back,
        }
    }
}

/// Compression with fallback
pub struct CompressionManager {
    config: CompressionConfig,
    codec: Box<dyn Compressor>,
}

impl CompressionManager {
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            codec: Box::new(Lz4Compressor::with_level(config.level)),
            config,
        }
    }

    /// Use a custom codec
    pub fn with_codec(config: CompressionConfig, codec: Box<dyn Compressor>) -> Self {
        Self { config, codec }
    }

    /// Compress, falling back to the original bytes when the payload is small,
    /// does not shrink, or the codec fails.
    pub fn compress(&self, data: &[u8]) -> CompressionOutcome {
        if (data.len() as u64) < self.config.min_size_bytes {
            return CompressionOutcome::plain(data, false);
        }

        match self.codec.compress(data) {
            Ok(compressed) if compressed.len() < data.len() => CompressionOutcome {
                data: Bytes::from(compressed),
                algorithm: self.codec.algorithm(),
                fell_back: false,
            },
            Ok(_) => CompressionOutcome::plain(data, false),
            Err(e) => {
                tracing::warn!(error = %e, size = data.len(), "Compression failed, storing uncompressed");
                CompressionOutcome::plain(data, true)
            }
        }
    }

    pub fn decompress(&self, data: &Bytes, algorithm: CompressionAlgorithm) -> Result<Bytes> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.clone()),
            CompressionAlgorithm::Lz4 => Ok(Bytes::from(self.codec.decompress(data)?)),
        }
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}
