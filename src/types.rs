//! Core data types for precomputed volumes

use crate::error::{PrecomputedError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Voxel data types supported by the precomputed format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 8-bit integer
    Uint8,
    /// Unsigned 16-bit integer
    Uint16,
    /// Unsigned 32-bit integer
    Uint32,
    /// Unsigned 64-bit integer
    Uint64,
    /// 32-bit floating point
    Float32,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Uint8 => 1,
            DataType::Uint16 => 2,
            DataType::Uint32 | DataType::Float32 => 4,
            DataType::Uint64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }

    /// Name used in the `info` document
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Uint8 => "uint8",
            DataType::Uint16 => "uint16",
            DataType::Uint32 => "uint32",
            DataType::Uint64 => "uint64",
            DataType::Float32 => "float32",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = PrecomputedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uint8" => Ok(DataType::Uint8),
            "uint16" => Ok(DataType::Uint16),
            "uint32" => Ok(DataType::Uint32),
            "uint64" => Ok(DataType::Uint64),
            "float32" => Ok(DataType::Float32),
            other => Err(PrecomputedError::Config(format!(
                "invalid data_type {:?} (should be one of uint8, uint16, uint32, uint64, float32)",
                other
            ))),
        }
    }
}

/// Kind of volume stored in the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    /// Continuous intensities
    Image,
    /// Discrete labels
    Segmentation,
}

/// Chunk encodings declared per scale level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Little-endian voxel dump
    Raw,
    /// Single-plane lossy image
    Jpeg,
    /// Lossless label codec
    CompressedSegmentation,
}

impl Encoding {
    /// True when decoding does not reproduce the input exactly
    pub fn is_lossy(&self) -> bool {
        matches!(self, Encoding::Jpeg)
    }

    /// True when an outer gzip wrapper would be wasted effort
    pub fn already_compressed(&self) -> bool {
        matches!(self, Encoding::Jpeg)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Raw => "raw",
            Encoding::Jpeg => "jpeg",
            Encoding::CompressedSegmentation => "compressed_segmentation",
        };
        f.write_str(name)
    }
}

/// Plane along which a chunk is flattened into 2D images for lossy encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JpegPlane {
    /// One image row per (z, y), X along the row
    #[default]
    Xy,
    /// One image row per z, (y, x) along the row
    Xz,
    /// One image row per (z, x), Y along the row
    Yz,
}
