//! Compressor plugins for object data streams.
//!
//! The streams only consume this interface; `lz4` is the built-in plugin
//! and the registry default. Chunked output is part of the contract so
//! plugins may compress large buffers in independent blocks.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Error, Result};

pub trait Compressor: Send + Sync {
    /// Registry and wire name of this compressor.
    fn name(&self) -> &str;

    /// Compress `data` into one or more chunks. A result at least as large
    /// as the input marks the stream incompressible.
    fn compress(&self, data: &[u8]) -> Vec<Bytes>;

    /// Reassemble `uncompressed_size` bytes from `chunks`.
    fn decompress(&self, chunks: &[Bytes], uncompressed_size: usize) -> Result<Vec<u8>>;
}

/// LZ4 block compression.
pub struct Lz4;

impl Compressor for Lz4 {
    fn name(&self) -> &str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Vec<Bytes> {
        vec![Bytes::from(lz4_flex::block::compress(data))]
    }

    fn decompress(&self, chunks: &[Bytes], uncompressed_size: usize) -> Result<Vec<u8>> {
        let joined: Vec<u8> = match chunks {
            [single] => {
                return lz4_flex::block::decompress(single, uncompressed_size)
                    .map_err(Error::Decompress)
            }
            many => many.iter().flat_map(|c| c.iter().copied()).collect(),
        };
        lz4_flex::block::decompress(&joined, uncompressed_size).map_err(Error::Decompress)
    }
}

/// Compressors known to a node, looked up by wire name.
#[derive(Clone)]
pub struct CompressorRegistry {
    by_name: HashMap<String, Arc<dyn Compressor>>,
    default: Option<String>,
}

impl CompressorRegistry {
    /// A registry with the built-in `lz4` plugin as default.
    pub fn builtin() -> CompressorRegistry {
        let mut registry = CompressorRegistry::empty();
        registry.register(Arc::new(Lz4));
        registry.default = Some("lz4".to_string());
        registry
    }

    /// A registry without any compressor; streams go uncompressed.
    pub fn empty() -> CompressorRegistry {
        CompressorRegistry {
            by_name: HashMap::new(),
            default: None,
        }
    }

    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        self.by_name
            .insert(compressor.name().to_string(), compressor);
    }

    /// Select the default compressor for outgoing streams, if any.
    pub fn default_compressor(&self) -> Option<Arc<dyn Compressor>> {
        self.default.as_ref().and_then(|name| self.by_name.get(name)).cloned()
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Compressor>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCompressor(name.to_string()))
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        CompressorRegistry::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_round_trip() {
        let data: Vec<u8> = std::iter::repeat(b"collage ".as_slice())
            .take(500)
            .flatten()
            .copied()
            .collect();

        let chunks = Lz4.compress(&data);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert!(total < data.len());

        let restored = Lz4.decompress(&chunks, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn unknown_compressor_is_an_error() {
        let registry = CompressorRegistry::builtin();
        assert!(registry.lookup("lz4").is_ok());
        assert!(matches!(
            registry.lookup("zlib"),
            Err(Error::UnknownCompressor(_))
        ));
    }
}
