//! Chunk-level access to a precomputed dataset - main API for reading/writing chunks

use crate::block::VoxelBlock;
use crate::config::ConversionOptions;
use crate::encoding::{get_encoder, ChunkEncoder};
use crate::error::{PrecomputedError, Result};
use crate::io::{Accessor, WriteOptions};
use crate::layout::{BoundingBox, ChunkCoordinate, ChunkKeyLayout, ScaleLevel};
use crate::metadata::{Info, INFO_KEY};
use crate::sharding::{ChunkAddressor, ShardReader};
use crate::stats::PyramidStats;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Main interface for reading and writing the chunks of a dataset
pub struct PrecomputedIo {
    /// Dataset metadata
    info: Arc<RwLock<Info>>,

    /// Storage for metadata, chunks and shards
    accessor: Arc<dyn Accessor>,

    options: ConversionOptions,

    /// One reader per sharded scale, keeping its minishard index cache
    shard_readers: RwLock<HashMap<String, Arc<ShardReader>>>,
}

impl PrecomputedIo {
    /// Open an existing dataset
    pub async fn open(accessor: Arc<dyn Accessor>, options: ConversionOptions) -> Result<Self> {
        options.validate()?;
        let info_bytes = accessor.read(INFO_KEY).await?;
        let info = Info::from_json_slice(&info_bytes)?;
        info.validate()?;
        Ok(Self::with_info(accessor, info, options))
    }

    /// Create a new dataset, writing its `info` document
    pub async fn create(accessor: Arc<dyn Accessor>, info: Info, options: ConversionOptions) -> Result<Self> {
        options.validate()?;
        info.validate()?;
        options.downscaling_method.resolve(info.volume_type)?;
        accessor
            .write(INFO_KEY, &info.to_json_vec()?, WriteOptions::new(false, options.overwrite))
            .await?;
        Ok(Self::with_info(accessor, info, options))
    }

    fn with_info(accessor: Arc<dyn Accessor>, info: Info, options: ConversionOptions) -> Self {
        Self {
            info: Arc::new(RwLock::new(info)),
            accessor,
            options,
            shard_readers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the dataset metadata
    pub fn info(&self) -> Info {
        self.info.read().clone()
    }

    /// Replace the metadata, e.g. after planning new scales
    pub async fn update_info(&self, info: Info) -> Result<()> {
        info.validate()?;
        self.accessor
            .write(INFO_KEY, &info.to_json_vec()?, WriteOptions::new(false, true))
            .await?;
        *self.info.write() = info;
        self.shard_readers.write().clear();
        Ok(())
    }

    pub fn accessor(&self) -> &Arc<dyn Accessor> {
        &self.accessor
    }

    pub fn options(&self) -> &ConversionOptions {
        &self.options
    }

    /// Geometry of a scale
    pub fn level(&self, key: &str) -> Result<ScaleLevel> {
        self.info.read().level(key)
    }

    /// Encoder of a scale
    pub fn encoder(&self, level: &ScaleLevel) -> Result<ChunkEncoder> {
        get_encoder(&self.info.read(), level, &self.options)
    }

    /// Check that `bounds` are exactly one chunk of scale `key`
    pub fn validate_chunk_coords(&self, key: &str, bounds: &BoundingBox) -> Result<(ScaleLevel, ChunkCoordinate)> {
        let level = self.level(key)?;
        match level.chunk_for_bounds(bounds) {
            Some(chunk) => Ok((level, chunk)),
            None => Err(PrecomputedError::OutOfBounds(format!(
                "{} is not a chunk of scale {} (size {:?}, chunks {:?})",
                bounds, key, level.size, level.chunk_size
            ))),
        }
    }

    fn shard_reader(&self, level: &ScaleLevel) -> Result<Arc<ShardReader>> {
        if let Some(reader) = self.shard_readers.read().get(&level.key) {
            return Ok(reader.clone());
        }
        let spec = level.sharding.clone().ok_or_else(|| {
            PrecomputedError::Config(format!("scale {} is not sharded", level.key))
        })?;
        let reader = Arc::new(ShardReader::new(self.accessor.clone(), level.key.clone(), spec));
        self.shard_readers
            .write()
            .insert(level.key.clone(), reader.clone());
        Ok(reader)
    }

    async fn fetch_chunk(&self, level: &ScaleLevel, chunk: &ChunkCoordinate) -> Result<Vec<u8>> {
        if level.is_sharded() {
            let chunk_id = ChunkAddressor::new(level.grid_shape())?.chunk_id(chunk.grid)?;
            return self
                .shard_reader(level)?
                .read_chunk(chunk_id)
                .await?
                .ok_or_else(|| {
                    PrecomputedError::NotFound(format!(
                        "chunk {} (id {}) of scale {}",
                        chunk.bounds, chunk_id, level.key
                    ))
                });
        }
        // the writer's layout first, then the other one
        let preferred = self.accessor.key_layout();
        let other = match preferred {
            ChunkKeyLayout::Flat => ChunkKeyLayout::Subdirectories,
            ChunkKeyLayout::Subdirectories => ChunkKeyLayout::Flat,
        };
        match self.accessor.read(&level.chunk_key(chunk, preferred)).await {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(err) if err.is_not_found() => {
                let bytes = self.accessor.read(&level.chunk_key(chunk, other)).await?;
                Ok(bytes.to_vec())
            }
            Err(err) => Err(err),
        }
    }

    async fn read_decoded(&self, level: &ScaleLevel, encoder: ChunkEncoder, chunk: ChunkCoordinate) -> Result<VoxelBlock> {
        let bytes = self.fetch_chunk(level, &chunk).await?;
        let size = chunk.bounds.shape();
        tokio::task::spawn_blocking(move || encoder.decode(&bytes, size)).await?
    }

    /// Read and decode one chunk
    pub async fn read_chunk(&self, key: &str, bounds: &BoundingBox) -> Result<VoxelBlock> {
        let (level, chunk) = self.validate_chunk_coords(key, bounds)?;
        let encoder = self.encoder(&level)?;
        self.read_decoded(&level, encoder, chunk).await
    }

    /// Encode and store one chunk of a non-sharded scale
    pub async fn write_chunk(&self, key: &str, block: &VoxelBlock, bounds: &BoundingBox) -> Result<()> {
        let (level, chunk) = self.validate_chunk_coords(key, bounds)?;
        if level.is_sharded() {
            return Err(PrecomputedError::Config(format!(
                "scale {} is sharded, its chunks are written through the shard assembler",
                key
            )));
        }
        let shape = chunk.bounds.shape();
        if block.size() != shape {
            return Err(PrecomputedError::Data(format!(
                "block of size {:?} does not fit chunk {} of size {:?}",
                block.size(),
                chunk.bounds,
                shape
            )));
        }
        let encoder = self.encoder(&level)?;
        let bytes = encoder.encode(block)?;
        let chunk_key = level.chunk_key(&chunk, self.accessor.key_layout());
        debug!(key = %chunk_key, bytes = bytes.len(), "writing chunk");
        self.accessor
            .write(
                &chunk_key,
                &bytes,
                WriteOptions::new(!encoder.already_compressed(), self.options.overwrite),
            )
            .await
    }

    /// Read an arbitrary region of scale `key` from the chunks overlapping it
    pub async fn read_region(&self, key: &str, region: &BoundingBox) -> Result<VoxelBlock> {
        let level = self.level(key)?;
        if region.is_empty() || !level.bounds().contains(region) {
            return Err(PrecomputedError::OutOfBounds(format!(
                "region {} is empty or outside scale {} of size {:?}",
                region, key, level.size
            )));
        }
        let (data_type, num_channels) = {
            let info = self.info.read();
            (info.data_type, info.num_channels)
        };
        let encoder = self.encoder(&level)?;
        let level_ref = &level;

        // Read all chunks concurrently
        let blocks: Vec<(ChunkCoordinate, VoxelBlock)> = stream::iter(level.chunks_overlapping(region))
            .map(|chunk| async move {
                let block = self.read_decoded(level_ref, encoder, chunk).await?;
                Ok::<_, PrecomputedError>((chunk, block))
            })
            .buffer_unordered(self.options.concurrency)
            .try_collect()
            .await?;

        let mut out = VoxelBlock::zeros(data_type, num_channels, region.shape());
        for (chunk, block) in blocks {
            let overlap = chunk.bounds.intersect(region);
            let part = block.subblock(chunk.bounds.offset_of(&overlap), overlap.shape())?;
            out.paste(region.offset_of(&overlap), &part)?;
        }
        Ok(out)
    }

    /// Get statistics about the pyramid
    pub fn stats(&self) -> Result<PyramidStats> {
        PyramidStats::from_info(&self.info.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessorOptions;
    use crate::io::FileSystemAccessor;
    use crate::types::{DataType, Encoding, VolumeType};
    use ndarray::Array4;
    use tempfile::TempDir;

    fn test_info() -> Info {
        let level = ScaleLevel::new("8nm", [10, 6, 4], [8.0; 3], [4, 4, 4]);
        Info::new(VolumeType::Image, DataType::Uint16, 1).with_scale(&level)
    }

    fn ramp(size: [usize; 3], origin: [usize; 3]) -> VoxelBlock {
        VoxelBlock::from_array(Array4::from_shape_fn((1, size[2], size[1], size[0]), |(_, z, y, x)| {
            ((x + origin[0]) + 100 * (y + origin[1]) + 1000 * (z + origin[2])) as u16
        }))
    }

    async fn create_io(dir: &TempDir, info: Info) -> PrecomputedIo {
        let accessor = Arc::new(FileSystemAccessor::new(dir.path(), AccessorOptions::default()));
        PrecomputedIo::create(accessor, info, ConversionOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_open_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let _io = create_io(&temp_dir, test_info()).await;

        let accessor = Arc::new(FileSystemAccessor::new(temp_dir.path(), AccessorOptions::default()));
        let io = PrecomputedIo::open(accessor, ConversionOptions::default()).await.unwrap();
        assert_eq!(io.info(), test_info());
        assert_eq!(io.stats().unwrap().levels[0].num_chunks, 6);
    }

    #[tokio::test]
    async fn test_chunk_write_read() {
        let temp_dir = TempDir::new().unwrap();
        let io = create_io(&temp_dir, test_info()).await;

        let bounds = BoundingBox::new([8, 4, 0], [10, 6, 4]);
        let block = ramp([2, 2, 4], [8, 4, 0]);
        io.write_chunk("8nm", &block, &bounds).await.unwrap();
        assert!(temp_dir.path().join("8nm/8-10/4-6/0-4.gz").exists());
        assert_eq!(io.read_chunk("8nm", &bounds).await.unwrap(), block);

        // not a chunk boundary
        let err = io.read_chunk("8nm", &BoundingBox::new([1, 0, 0], [5, 4, 4])).await.unwrap_err();
        assert!(matches!(err, PrecomputedError::OutOfBounds(_)));
        // missing chunk
        let err = io.read_chunk("8nm", &BoundingBox::new([0, 0, 0], [4, 4, 4])).await.unwrap_err();
        assert!(err.is_not_found());
        // wrong block size
        let err = io.write_chunk("8nm", &ramp([4, 4, 4], [0; 3]), &bounds).await.unwrap_err();
        assert!(matches!(err, PrecomputedError::Data(_)));
    }

    #[tokio::test]
    async fn test_flat_chunks_are_found() {
        let temp_dir = TempDir::new().unwrap();
        let flat = Arc::new(FileSystemAccessor::new(
            temp_dir.path(),
            AccessorOptions::default().with_flat(true).with_gzip(false),
        ));
        let io = PrecomputedIo::create(flat, test_info(), ConversionOptions::default())
            .await
            .unwrap();
        let bounds = BoundingBox::new([0, 0, 0], [4, 4, 4]);
        io.write_chunk("8nm", &ramp([4, 4, 4], [0; 3]), &bounds).await.unwrap();
        assert!(temp_dir.path().join("8nm/0-4_0-4_0-4").exists());

        let nested = Arc::new(FileSystemAccessor::new(temp_dir.path(), AccessorOptions::default()));
        let io = PrecomputedIo::open(nested, ConversionOptions::default()).await.unwrap();
        assert_eq!(io.read_chunk("8nm", &bounds).await.unwrap(), ramp([4, 4, 4], [0; 3]));
    }

    #[tokio::test]
    async fn test_read_region_across_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let io = create_io(&temp_dir, test_info()).await;
        let level = io.level("8nm").unwrap();
        for chunk in level.chunks() {
            let origin = chunk.bounds.min.map(|v| v as usize);
            io.write_chunk("8nm", &ramp(chunk.bounds.shape(), origin), &chunk.bounds)
                .await
                .unwrap();
        }
        let region = BoundingBox::new([3, 2, 1], [9, 6, 3]);
        let block = io.read_region("8nm", &region).await.unwrap();
        assert_eq!(block, ramp([6, 4, 2], [3, 2, 1]));

        assert!(matches!(
            io.read_region("8nm", &BoundingBox::new([0, 0, 0], [11, 1, 1])).await,
            Err(PrecomputedError::OutOfBounds(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_average_on_labels() {
        let temp_dir = TempDir::new().unwrap();
        let level = ScaleLevel::new("8nm", [8, 8, 8], [8.0; 3], [4, 4, 4]);
        let info = Info::new(VolumeType::Segmentation, DataType::Uint32, 1).with_scale(&level);
        let accessor = Arc::new(FileSystemAccessor::new(temp_dir.path(), AccessorOptions::default()));
        let options = ConversionOptions::default()
            .with_downscaling_method(crate::downscaling::DownscalingMethod::Average);
        let err = PrecomputedIo::create(accessor, info, options).await.err().unwrap();
        assert!(matches!(err, PrecomputedError::Config(_)));
        assert!(!temp_dir.path().join(INFO_KEY).exists());
    }

    #[tokio::test]
    async fn test_jpeg_chunks_open_with_default_plane() {
        let temp_dir = TempDir::new().unwrap();
        let level = ScaleLevel::new("8nm", [8, 8, 4], [8.0; 3], [8, 8, 4]).with_encoding(Encoding::Jpeg);
        let info = Info::new(VolumeType::Image, DataType::Uint8, 1).with_scale(&level);
        let accessor = Arc::new(FileSystemAccessor::new(temp_dir.path(), AccessorOptions::default()));
        let writer = PrecomputedIo::create(
            accessor.clone(),
            info,
            ConversionOptions::default().with_jpeg_plane(crate::types::JpegPlane::Xz),
        )
        .await
        .unwrap();
        let block = VoxelBlock::from_array(Array4::from_shape_fn((1, 4, 8, 8), |(_, z, y, x)| {
            (40 + 6 * x + 5 * y + 4 * z) as u8
        }));
        let bounds = BoundingBox::from_size([8, 8, 4]);
        writer.write_chunk("8nm", &block, &bounds).await.unwrap();

        let reader = PrecomputedIo::open(accessor, ConversionOptions::default()).await.unwrap();
        let decoded = reader.read_chunk("8nm", &bounds).await.unwrap();
        let max_error = decoded
            .as_array::<u8>()
            .unwrap()
            .iter()
            .zip(block.as_array::<u8>().unwrap().iter())
            .map(|(&a, &b)| (a as i32 - b as i32).abs())
            .max()
            .unwrap();
        assert!(max_error <= 20, "max error {}", max_error);
    }

    #[tokio::test]
    async fn test_segmentation_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let level = ScaleLevel::new("8nm", [8, 8, 8], [8.0; 3], [8, 8, 8])
            .with_encoding(Encoding::CompressedSegmentation)
            .with_segmentation_block_size([4, 4, 4]);
        let info = Info::new(VolumeType::Segmentation, DataType::Uint64, 1).with_scale(&level);
        let io = create_io(&temp_dir, info).await;
        let block = VoxelBlock::from_array(Array4::from_shape_fn((1, 8, 8, 8), |(_, z, _, x)| {
            if x < z { 1u64 << 50 } else { 7 }
        }));
        let bounds = BoundingBox::from_size([8, 8, 8]);
        io.write_chunk("8nm", &block, &bounds).await.unwrap();
        assert_eq!(io.read_chunk("8nm", &bounds).await.unwrap(), block);
    }
}
