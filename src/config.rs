//! Conversion, storage and pyramid options
//!
//! Every option struct is an immutable value handed to the component that
//! needs it; nothing here is global.

use crate::compression::{CompressionLevel, DataEncoding};
use crate::downscaling::DownscalingMethod;
use crate::error::{PrecomputedError, Result};
use crate::layout::ChunkKeyLayout;
use crate::sharding::{ChunkAddressor, ShardHash, ShardingSpec};
use crate::types::JpegPlane;
use serde::{Deserialize, Serialize};

/// Default in-memory budget for the payloads of one sharded level
pub const DEFAULT_SHARD_MEMORY_BUDGET: u64 = 512 * 1024 * 1024;

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Options that control how voxel data is converted into chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    pub downscaling_method: DownscalingMethod,
    /// Value of voxels beyond the volume edge for `average`; `None` leaves them out
    pub outside_value: Option<f64>,
    /// JPEG quality, 1 to 100
    pub jpeg_quality: u8,
    pub jpeg_plane: JpegPlane,
    /// Chunks encoded in flight
    pub concurrency: usize,
    /// Payload bytes kept in memory per sharded level before spilling to disk
    pub shard_memory_budget: u64,
    /// Replace existing chunk and shard files
    pub overwrite: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            downscaling_method: DownscalingMethod::Auto,
            outside_value: None,
            jpeg_quality: 95,
            jpeg_plane: JpegPlane::Xy,
            concurrency: default_concurrency(),
            shard_memory_budget: DEFAULT_SHARD_MEMORY_BUDGET,
            overwrite: false,
        }
    }
}

impl ConversionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON document; missing fields take their defaults
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let options: Self = serde_json::from_slice(bytes)?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_downscaling_method(mut self, method: DownscalingMethod) -> Self {
        self.downscaling_method = method;
        self
    }

    pub fn with_outside_value(mut self, value: Option<f64>) -> Self {
        self.outside_value = value;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    pub fn with_jpeg_plane(mut self, plane: JpegPlane) -> Self {
        self.jpeg_plane = plane;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_shard_memory_budget(mut self, bytes: u64) -> Self {
        self.shard_memory_budget = bytes;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(PrecomputedError::Config("concurrency must be >= 1".into()));
        }
        if self.jpeg_quality > 100 {
            return Err(PrecomputedError::Config(format!(
                "jpeg_quality {} must be between 1 and 100",
                self.jpeg_quality
            )));
        }
        if let Some(value) = self.outside_value {
            if !value.is_finite() {
                return Err(PrecomputedError::Config(format!(
                    "outside_value {} must be finite",
                    value
                )));
            }
        }
        Ok(())
    }
}

/// Options of storage accessors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessorOptions {
    /// Store chunks as `{key}/{x0}-{x1}_{y0}-{y1}_{z0}-{z1}` instead of nested directories
    pub flat: bool,
    /// Gzip chunk files that are not already compressed, stored as `<key>.gz`
    pub gzip: bool,
    pub compression_level: CompressionLevel,
}

impl Default for AccessorOptions {
    fn default() -> Self {
        Self {
            flat: false,
            gzip: true,
            compression_level: CompressionLevel::max(),
        }
    }
}

impl AccessorOptions {
    pub fn with_flat(mut self, flat: bool) -> Self {
        self.flat = flat;
        self
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn with_compression_level(mut self, level: CompressionLevel) -> Self {
        self.compression_level = level;
        self
    }

    pub fn key_layout(&self) -> ChunkKeyLayout {
        if self.flat {
            ChunkKeyLayout::Flat
        } else {
            ChunkKeyLayout::Subdirectories
        }
    }
}

/// How generated levels are sharded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum ShardingPolicy {
    /// The same parameters for every level
    Fixed(ShardingSpec),
    /// Bits derived from each level's chunk grid
    ///
    /// `preshift_bits` and `minishard_bits` are capped by the chunk id width;
    /// the remaining id bits select the shard.
    Auto {
        preshift_bits: u32,
        minishard_bits: u32,
        #[serde(default)]
        hash: ShardHash,
        #[serde(default)]
        minishard_index_encoding: DataEncoding,
        #[serde(default)]
        data_encoding: DataEncoding,
    },
}

impl Default for ShardingPolicy {
    fn default() -> Self {
        ShardingPolicy::Auto {
            preshift_bits: 3,
            minishard_bits: 6,
            hash: ShardHash::Identity,
            minishard_index_encoding: DataEncoding::Gzip,
            data_encoding: DataEncoding::Raw,
        }
    }
}

impl ShardingPolicy {
    /// Sharding parameters for a level with the given chunk grid
    pub fn spec_for_grid(&self, grid_shape: [u64; 3]) -> Result<ShardingSpec> {
        let spec = match self {
            ShardingPolicy::Fixed(spec) => spec.clone(),
            ShardingPolicy::Auto {
                preshift_bits,
                minishard_bits,
                hash,
                minishard_index_encoding,
                data_encoding,
            } => {
                let id_bits: u32 = ChunkAddressor::new(grid_shape)?.bits().iter().sum();
                let preshift = (*preshift_bits).min(id_bits);
                let minishard = (*minishard_bits).min(id_bits - preshift);
                let shard = id_bits - preshift - minishard;
                ShardingSpec::new(shard, minishard)
                    .with_preshift_bits(preshift)
                    .with_hash(*hash)
                    .with_minishard_index_encoding(*minishard_index_encoding)
                    .with_data_encoding(*data_encoding)
            }
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Options of the dyadic pyramid planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidOptions {
    /// Voxels along each axis of an isotropic chunk, a power of two
    pub target_chunk_size: u64,
    /// Maximum number of levels, base included
    pub max_scales: Option<usize>,
    /// Stop once a level fits in a single chunk
    pub stop_at_single_chunk: bool,
    pub sharding: Option<ShardingPolicy>,
}

impl Default for PyramidOptions {
    fn default() -> Self {
        Self {
            target_chunk_size: 64,
            max_scales: None,
            stop_at_single_chunk: false,
            sharding: None,
        }
    }
}

impl PyramidOptions {
    pub fn with_target_chunk_size(mut self, size: u64) -> Self {
        self.target_chunk_size = size;
        self
    }

    pub fn with_max_scales(mut self, max_scales: usize) -> Self {
        self.max_scales = Some(max_scales);
        self
    }

    pub fn with_stop_at_single_chunk(mut self, stop: bool) -> Self {
        self.stop_at_single_chunk = stop;
        self
    }

    pub fn with_sharding(mut self, policy: ShardingPolicy) -> Self {
        self.sharding = Some(policy);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.target_chunk_size.is_power_of_two() {
            return Err(PrecomputedError::Config(format!(
                "target_chunk_size {} must be a power of two",
                self.target_chunk_size
            )));
        }
        if self.max_scales == Some(0) {
            return Err(PrecomputedError::Config("max_scales must be >= 1".into()));
        }
        Ok(())
    }
}
