//! Scale level geometry - how a level is divided into chunks

use crate::error::{PrecomputedError, Result};
use crate::sharding::ShardingSpec;
use crate::types::{DataType, Encoding};
use crate::utils::ceil_div;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default sub-block size of the compressed segmentation codec
pub const DEFAULT_SEGMENTATION_BLOCK_SIZE: [u64; 3] = [8, 8, 8];

/// Axis-aligned box in voxel space, `min` inclusive and `max` exclusive, `[x, y, z]` order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: [u64; 3],
    pub max: [u64; 3],
}

impl BoundingBox {
    pub fn new(min: [u64; 3], max: [u64; 3]) -> Self {
        Self { min, max }
    }

    /// Box starting at the origin
    pub fn from_size(size: [u64; 3]) -> Self {
        Self::new([0; 3], size)
    }

    /// Extent along each axis
    pub fn size(&self) -> [u64; 3] {
        [
            self.max[0].saturating_sub(self.min[0]),
            self.max[1].saturating_sub(self.min[1]),
            self.max[2].saturating_sub(self.min[2]),
        ]
    }

    /// Extent as `usize`, for indexing in-memory blocks
    pub fn shape(&self) -> [usize; 3] {
        let size = self.size();
        [size[0] as usize, size[1] as usize, size[2] as usize]
    }

    /// Number of voxels enclosed
    pub fn num_voxels(&self) -> u64 {
        self.size().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.num_voxels() == 0
    }

    /// Overlap of two boxes (possibly empty)
    pub fn intersect(&self, other: &BoundingBox) -> BoundingBox {
        let mut min = [0; 3];
        let mut max = [0; 3];
        for axis in 0..3 {
            min[axis] = self.min[axis].max(other.min[axis]);
            max[axis] = self.max[axis].min(other.max[axis]).max(min[axis]);
        }
        BoundingBox { min, max }
    }

    /// True if `other` lies entirely inside this box
    pub fn contains(&self, other: &BoundingBox) -> bool {
        (0..3).all(|axis| self.min[axis] <= other.min[axis] && other.max[axis] <= self.max[axis])
    }

    /// Position of `other.min` relative to this box's origin
    pub fn offset_of(&self, other: &BoundingBox) -> [usize; 3] {
        [
            (other.min[0] - self.min[0]) as usize,
            (other.min[1] - self.min[1]) as usize,
            (other.min[2] - self.min[2]) as usize,
        ]
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}_{}-{}_{}-{}",
            self.min[0], self.max[0], self.min[1], self.max[1], self.min[2], self.max[2]
        )
    }
}

/// One chunk of a scale level: its grid index and clipped voxel bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkCoordinate {
    /// Grid index `(gx, gy, gz)`
    pub grid: [u64; 3],
    /// Voxel bounds relative to the level origin, clipped to the level size
    pub bounds: BoundingBox,
}

/// How non-sharded chunk keys are laid out under a scale directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKeyLayout {
    /// `{key}/{x0}-{x1}_{y0}-{y1}_{z0}-{z1}`, what the viewer requests directly
    Flat,
    /// `{key}/{x0}-{x1}/{y0}-{y1}/{z0}-{z1}`, bounds directory fan-out
    #[default]
    Subdirectories,
}

/// Geometry and encoding of one resolution of the pyramid
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleLevel {
    /// Identifier, also the directory name of the level
    pub key: String,
    /// Size in voxels
    pub size: [u64; 3],
    /// Voxel size in nanometres
    pub resolution: [f64; 3],
    /// Position of the first voxel
    pub voxel_offset: [u64; 3],
    /// Chunk encoding
    pub encoding: Encoding,
    /// Chunk size in voxels (edge chunks are clipped)
    pub chunk_size: [u64; 3],
    /// Sub-block size for the compressed segmentation codec
    pub compressed_segmentation_block_size: Option<[u64; 3]>,
    /// Present when the level is stored in sharded containers
    pub sharding: Option<ShardingSpec>,
}

impl ScaleLevel {
    /// Create a non-sharded raw level with a zero voxel offset
    pub fn new(
        key: impl Into<String>,
        size: [u64; 3],
        resolution: [f64; 3],
        chunk_size: [u64; 3],
    ) -> Self {
        Self {
            key: key.into(),
            size,
            resolution,
            voxel_offset: [0; 3],
            encoding: Encoding::Raw,
            chunk_size,
            compressed_segmentation_block_size: None,
            sharding: None,
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        if encoding == Encoding::CompressedSegmentation
            && self.compressed_segmentation_block_size.is_none()
        {
            self.compressed_segmentation_block_size = Some(DEFAULT_SEGMENTATION_BLOCK_SIZE);
        }
        self
    }

    pub fn with_voxel_offset(mut self, voxel_offset: [u64; 3]) -> Self {
        self.voxel_offset = voxel_offset;
        self
    }

    pub fn with_segmentation_block_size(mut self, block_size: [u64; 3]) -> Self {
        self.compressed_segmentation_block_size = Some(block_size);
        self
    }

    pub fn with_sharding(mut self, sharding: ShardingSpec) -> Self {
        self.sharding = Some(sharding);
        self
    }

    /// Check geometry, encoding parameters and sharding bit budgets
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(PrecomputedError::Config("scale key must not be empty".into()));
        }
        if self.size.iter().any(|&s| s == 0) {
            return Err(PrecomputedError::Config(format!(
                "scale {}: size {:?} must be positive along every axis",
                self.key, self.size
            )));
        }
        if self.chunk_size.iter().any(|&c| c == 0) {
            return Err(PrecomputedError::Config(format!(
                "scale {}: chunk size {:?} must be >= 1 along every axis",
                self.key, self.chunk_size
            )));
        }
        if self.resolution.iter().any(|r| !(r.is_finite() && *r > 0.0)) {
            return Err(PrecomputedError::Config(format!(
                "scale {}: resolution {:?} must be finite and positive",
                self.key, self.resolution
            )));
        }
        if self.encoding == Encoding::CompressedSegmentation {
            match self.compressed_segmentation_block_size {
                Some(block) if block.iter().all(|&b| b >= 1) => {}
                Some(block) => {
                    return Err(PrecomputedError::Config(format!(
                        "scale {}: compressed_segmentation_block_size {:?} must be >= 1",
                        self.key, block
                    )))
                }
                None => {
                    return Err(PrecomputedError::Config(format!(
                        "scale {}: encoding is compressed_segmentation but \
                         compressed_segmentation_block_size is missing",
                        self.key
                    )))
                }
            }
        }
        if let Some(sharding) = &self.sharding {
            sharding.validate()?;
            crate::sharding::ChunkAddressor::new(self.grid_shape())?;
        }
        Ok(())
    }

    /// Number of chunks along each axis
    pub fn grid_shape(&self) -> [u64; 3] {
        [
            ceil_div(self.size[0], self.chunk_size[0]),
            ceil_div(self.size[1], self.chunk_size[1]),
            ceil_div(self.size[2], self.chunk_size[2]),
        ]
    }

    /// Total number of chunks
    pub fn num_chunks(&self) -> u64 {
        self.grid_shape().iter().product()
    }

    pub fn is_sharded(&self) -> bool {
        self.sharding.is_some()
    }

    /// Whole level as a bounding box
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::from_size(self.size)
    }

    /// Chunk at a grid index
    pub fn chunk(&self, grid: [u64; 3]) -> Result<ChunkCoordinate> {
        let shape = self.grid_shape();
        if (0..3).any(|axis| grid[axis] >= shape[axis]) {
            return Err(PrecomputedError::OutOfBounds(format!(
                "chunk {:?} outside the {:?} grid of scale {}",
                grid, shape, self.key
            )));
        }
        let mut min = [0; 3];
        let mut max = [0; 3];
        for axis in 0..3 {
            min[axis] = grid[axis] * self.chunk_size[axis];
            max[axis] = (min[axis] + self.chunk_size[axis]).min(self.size[axis]);
        }
        Ok(ChunkCoordinate {
            grid,
            bounds: BoundingBox::new(min, max),
        })
    }

    /// Convert a linear chunk index (X fastest) into a grid index
    pub fn chunk_index_to_grid(&self, index: u64) -> [u64; 3] {
        let [gx, gy, _] = self.grid_shape();
        [index % gx, (index / gx) % gy, index / (gx * gy)]
    }

    /// Convert a grid index into a linear chunk index (X fastest)
    pub fn grid_to_chunk_index(&self, grid: [u64; 3]) -> u64 {
        let [gx, gy, _] = self.grid_shape();
        grid[0] + gx * (grid[1] + gy * grid[2])
    }

    /// All chunks of the level, X fastest
    pub fn chunks(&self) -> impl Iterator<Item = ChunkCoordinate> + '_ {
        (0..self.num_chunks()).filter_map(move |i| self.chunk(self.chunk_index_to_grid(i)).ok())
    }

    /// Chunks whose bounds intersect `region`
    pub fn chunks_overlapping(&self, region: &BoundingBox) -> Vec<ChunkCoordinate> {
        let clipped = region.intersect(&self.bounds());
        if clipped.is_empty() {
            return Vec::new();
        }
        let mut lo = [0; 3];
        let mut hi = [0; 3];
        for axis in 0..3 {
            lo[axis] = clipped.min[axis] / self.chunk_size[axis];
            hi[axis] = (clipped.max[axis] - 1) / self.chunk_size[axis];
        }
        let mut chunks = Vec::new();
        for gz in lo[2]..=hi[2] {
            for gy in lo[1]..=hi[1] {
                for gx in lo[0]..=hi[0] {
                    if let Ok(chunk) = self.chunk([gx, gy, gz]) {
                        chunks.push(chunk);
                    }
                }
            }
        }
        chunks
    }

    /// Find the chunk whose bounds are exactly `bounds`
    pub fn chunk_for_bounds(&self, bounds: &BoundingBox) -> Option<ChunkCoordinate> {
        let mut grid = [0; 3];
        for axis in 0..3 {
            if bounds.min[axis] % self.chunk_size[axis] != 0 {
                return None;
            }
            grid[axis] = bounds.min[axis] / self.chunk_size[axis];
        }
        self.chunk(grid).ok().filter(|chunk| chunk.bounds == *bounds)
    }

    /// Storage key of a non-sharded chunk; coordinates include `voxel_offset`
    pub fn chunk_key(&self, chunk: &ChunkCoordinate, layout: ChunkKeyLayout) -> String {
        let b = &chunk.bounds;
        let o = &self.voxel_offset;
        let (x0, x1) = (b.min[0] + o[0], b.max[0] + o[0]);
        let (y0, y1) = (b.min[1] + o[1], b.max[1] + o[1]);
        let (z0, z1) = (b.min[2] + o[2], b.max[2] + o[2]);
        match layout {
            ChunkKeyLayout::Flat => {
                format!("{}/{}-{}_{}-{}_{}-{}", self.key, x0, x1, y0, y1, z0, z1)
            }
            ChunkKeyLayout::Subdirectories => {
                format!("{}/{}-{}/{}-{}/{}-{}", self.key, x0, x1, y0, y1, z0, z1)
            }
        }
    }

    /// Uncompressed size in bytes of a full chunk
    pub fn chunk_size_bytes(&self, data_type: DataType, num_channels: usize) -> u64 {
        self.chunk_size.iter().product::<u64>()
            * data_type.size_in_bytes() as u64
            * num_channels as u64
    }

    /// Uncompressed size in bytes of the whole level
    pub fn total_size_bytes(&self, data_type: DataType, num_channels: usize) -> u64 {
        self.size.iter().product::<u64>() * data_type.size_in_bytes() as u64 * num_channels as u64
    }

    /// Check if voxel coordinates are within the level
    pub fn is_in_bounds(&self, coords: [u64; 3]) -> bool {
        (0..3).all(|axis| coords[axis] < self.size[axis])
    }

    /// One-line description of the level
    pub fn summary(&self) -> String {
        let [gx, gy, gz] = self.grid_shape();
        format!(
            "scale {}: {} x {} x {} voxels at {:?} nm, {} chunks of {:?} ({}){}",
            self.key,
            self.size[0],
            self.size[1],
            self.size[2],
            self.resolution,
            gx * gy * gz,
            self.chunk_size,
            self.encoding,
            if self.is_sharded() { ", sharded" } else { "" }
        )
    }
}
