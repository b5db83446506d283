//! The dataset-wide `info` document

use crate::error::{PrecomputedError, Result};
use crate::layout::ScaleLevel;
use crate::sharding::ShardingSpec;
use crate::types::{DataType, Encoding, VolumeType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Storage key of the metadata document
pub const INFO_KEY: &str = "info";

/// One entry of `scales` in the `info` document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleInfo {
    pub key: String,
    pub size: [u64; 3],
    pub resolution: [f64; 3],
    #[serde(default)]
    pub voxel_offset: [u64; 3],
    /// Candidate chunk sizes; the first one is used for writing
    pub chunk_sizes: Vec<[u64; 3]>,
    pub encoding: Encoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_segmentation_block_size: Option<[u64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingSpec>,
    /// Keys this crate does not interpret, kept verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl From<&ScaleLevel> for ScaleInfo {
    fn from(level: &ScaleLevel) -> Self {
        Self {
            key: level.key.clone(),
            size: level.size,
            resolution: level.resolution,
            voxel_offset: level.voxel_offset,
            chunk_sizes: vec![level.chunk_size],
            encoding: level.encoding,
            compressed_segmentation_block_size: match level.encoding {
                Encoding::CompressedSegmentation => level.compressed_segmentation_block_size,
                _ => None,
            },
            sharding: level.sharding.clone(),
            extra: BTreeMap::new(),
        }
    }
}

impl TryFrom<&ScaleInfo> for ScaleLevel {
    type Error = PrecomputedError;

    fn try_from(scale: &ScaleInfo) -> Result<Self> {
        let chunk_size = scale.chunk_sizes.first().copied().ok_or_else(|| {
            PrecomputedError::Config(format!("scale {} has no chunk_sizes", scale.key))
        })?;
        Ok(ScaleLevel {
            key: scale.key.clone(),
            size: scale.size,
            resolution: scale.resolution,
            voxel_offset: scale.voxel_offset,
            encoding: scale.encoding,
            chunk_size,
            compressed_segmentation_block_size: scale.compressed_segmentation_block_size,
            sharding: scale.sharding.clone(),
        })
    }
}

/// Complete metadata of a precomputed volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    pub data_type: DataType,
    pub num_channels: usize,
    pub scales: Vec<ScaleInfo>,
    /// Keys such as `mesh` that are not interpreted here
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Info {
    /// Create metadata without any scale
    pub fn new(volume_type: VolumeType, data_type: DataType, num_channels: usize) -> Self {
        Self {
            volume_type,
            data_type,
            num_channels,
            scales: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Append a scale
    pub fn with_scale(mut self, level: &ScaleLevel) -> Self {
        self.scales.push(ScaleInfo::from(level));
        self
    }

    /// Set an uninterpreted top-level key
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Replace all scales
    pub fn set_levels(&mut self, levels: &[ScaleLevel]) {
        self.scales = levels.iter().map(ScaleInfo::from).collect();
    }

    /// Parse an `info` document
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Compact JSON with sorted keys
    pub fn to_json_vec(&self) -> Result<Vec<u8>> {
        // Value objects are BTreeMaps, so keys come out sorted
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_vec(&value)?)
    }

    /// Scale entry by key
    pub fn scale(&self, key: &str) -> Result<&ScaleInfo> {
        self.scales
            .iter()
            .find(|s| s.key == key)
            .ok_or_else(|| PrecomputedError::NotFound(format!("scale {:?} not in info", key)))
    }

    /// Geometry of one scale
    pub fn level(&self, key: &str) -> Result<ScaleLevel> {
        ScaleLevel::try_from(self.scale(key)?)
    }

    /// Geometry of every scale, in document order
    pub fn levels(&self) -> Result<Vec<ScaleLevel>> {
        self.scales.iter().map(ScaleLevel::try_from).collect()
    }

    /// True if any scale is sharded
    pub fn is_sharded(&self) -> bool {
        self.scales.iter().any(|s| s.sharding.is_some())
    }

    /// Check the whole document before any chunk is touched
    pub fn validate(&self) -> Result<()> {
        if self.num_channels == 0 {
            return Err(PrecomputedError::Config("num_channels must be >= 1".into()));
        }
        if self.scales.is_empty() {
            return Err(PrecomputedError::Config("info has no scales".into()));
        }
        let mut keys = HashSet::new();
        for scale in &self.scales {
            if !keys.insert(scale.key.as_str()) {
                return Err(PrecomputedError::Config(format!(
                    "duplicate scale key {:?}",
                    scale.key
                )));
            }
            let level = ScaleLevel::try_from(scale)?;
            level.validate()?;
            self.check_encoding(&level)?;
        }
        Ok(())
    }

    fn check_encoding(&self, level: &ScaleLevel) -> Result<()> {
        match level.encoding {
            Encoding::Raw => Ok(()),
            Encoding::Jpeg => {
                if self.volume_type == VolumeType::Segmentation {
                    return Err(PrecomputedError::Config(format!(
                        "scale {}: jpeg is lossy and cannot store segmentation labels",
                        level.key
                    )));
                }
                if self.data_type != DataType::Uint8 || !matches!(self.num_channels, 1 | 3) {
                    return Err(PrecomputedError::Config(format!(
                        "scale {}: jpeg needs uint8 data with 1 or 3 channels, got {} with {}",
                        level.key, self.data_type, self.num_channels
                    )));
                }
                Ok(())
            }
            Encoding::CompressedSegmentation => {
                if !matches!(self.data_type, DataType::Uint32 | DataType::Uint64) {
                    return Err(PrecomputedError::Config(format!(
                        "scale {}: compressed_segmentation needs uint32 or uint64 data, got {}",
                        level.key, self.data_type
                    )));
                }
                Ok(())
            }
        }
    }

    /// Number of scales
    pub fn num_scales(&self) -> usize {
        self.scales.len()
    }
}
