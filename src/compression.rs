//! Gzip wrapping for chunk files, shard data and minishard indices

use crate::error::{PrecomputedError, Result};
use flate2::read::{GzDecoder, GzEncoder, ZlibDecoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Byte-level encodings allowed for sharded data and minishard indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    /// Bytes stored as-is
    #[default]
    Raw,
    /// Each payload is an independent gzip member
    Gzip,
}

impl DataEncoding {
    /// Encode one payload at the given level
    pub fn encode(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        get_compressor(*self).compress(data, level)
    }

    /// Decode one payload
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        get_compressor(*self).decompress(data)
    }
}

impl fmt::Display for DataEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataEncoding::Raw => f.write_str("raw"),
            DataEncoding::Gzip => f.write_str("gzip"),
        }
    }
}

/// Deflate effort, 0 (store) to 9; written datasets default to 9
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    /// Clamp `level` into 0..=9
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn max() -> Self {
        Self(9)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::max()
    }
}

impl TryFrom<u8> for CompressionLevel {
    type Error = PrecomputedError;

    fn try_from(level: u8) -> Result<Self> {
        if level > 9 {
            return Err(PrecomputedError::Config(format!(
                "compression level {} is outside 0..=9",
                level
            )));
        }
        Ok(Self(level))
    }
}

impl From<CompressionLevel> for u8 {
    fn from(level: CompressionLevel) -> u8 {
        level.0
    }
}

/// One of the byte encodings of [`DataEncoding`]
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    /// Errors on corrupt input are [`PrecomputedError::Data`]
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn encoding(&self) -> DataEncoding;
}

/// `raw`: bytes pass through
#[derive(Debug, Default)]
pub struct RawCompressor;

impl Compressor for RawCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn encoding(&self) -> DataEncoding {
        DataEncoding::Raw
    }
}

/// `gzip`: one gzip member per payload
///
/// Decompression also accepts bare zlib streams, which older writers
/// produced for the `gzip` sharded encodings.
#[derive(Debug, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let mut member = Vec::with_capacity(data.len() / 2 + 32);
        GzEncoder::new(data, FlateCompression::new(level.value() as u32)).read_to_end(&mut member)?;
        Ok(member)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 4);
        let outcome = if is_gzip(data) {
            GzDecoder::new(data).read_to_end(&mut out)
        } else {
            ZlibDecoder::new(data).read_to_end(&mut out)
        };
        outcome.map_err(|e| PrecomputedError::Data(format!("invalid gzip payload: {}", e)))?;
        Ok(out)
    }

    fn encoding(&self) -> DataEncoding {
        DataEncoding::Gzip
    }
}

pub fn get_compressor(encoding: DataEncoding) -> Box<dyn Compressor> {
    match encoding {
        DataEncoding::Raw => Box::new(RawCompressor),
        DataEncoding::Gzip => Box::new(GzipCompressor),
    }
}

/// True if `data` starts with the gzip member header
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    /// A raw uint16 chunk with long runs, as background-heavy images have
    fn chunk_bytes() -> Vec<u8> {
        (0..4096u16).flat_map(|i| (i / 512).to_le_bytes()).collect()
    }

    #[test]
    fn test_raw_is_identity() {
        let data = chunk_bytes();
        assert_eq!(DataEncoding::Raw.encode(&data, CompressionLevel::max()).unwrap(), data);
        assert_eq!(RawCompressor.encoding(), DataEncoding::Raw);
    }

    #[test]
    fn test_gzip_member() {
        let data = chunk_bytes();
        let member = DataEncoding::Gzip.encode(&data, CompressionLevel::new(6)).unwrap();
        assert!(is_gzip(&member));
        assert!(member.len() < data.len() / 10);
        assert_eq!(DataEncoding::Gzip.decode(&member).unwrap(), data);

        // level 0 stores, but still as a gzip member
        let stored = DataEncoding::Gzip.encode(&data, CompressionLevel::new(0)).unwrap();
        assert!(is_gzip(&stored) && stored.len() > data.len());
    }

    #[test]
    fn test_gzip_accepts_zlib_stream() {
        let mut encoder = ZlibEncoder::new(Vec::new(), FlateCompression::default());
        encoder.write_all(b"minishard index").unwrap();
        let zlib = encoder.finish().unwrap();
        assert_eq!(DataEncoding::Gzip.decode(&zlib).unwrap(), b"minishard index");
    }

    #[test]
    fn test_corrupt_gzip_is_data_error() {
        let err = DataEncoding::Gzip.decode(&[0x1f, 0x8b, 0, 1, 2]).unwrap_err();
        assert!(matches!(err, PrecomputedError::Data(_)));
    }

    #[test]
    fn test_level_and_encoding_names() {
        assert_eq!(CompressionLevel::new(12).value(), 9);
        let level: CompressionLevel = serde_json::from_str("4").unwrap();
        assert_eq!(level.value(), 4);
        assert!(serde_json::from_str::<CompressionLevel>("10").is_err());

        let enc: DataEncoding = serde_json::from_str("\"gzip\"").unwrap();
        assert_eq!(enc, DataEncoding::Gzip);
        assert_eq!(DataEncoding::Raw.to_string(), "raw");
    }
}
