//! Conversion of a volume into a multi-resolution pyramid
//!
//! The base level is cut out of a [`VolumeReader`]; every further level is
//! computed from the level before it, reading back only the parent region
//! each output chunk needs. Chunks are produced and encoded concurrently and
//! written either directly or through a [`ShardAssembler`].

use crate::access::PrecomputedIo;
use crate::block::VoxelBlock;
use crate::compression::CompressionLevel;
use crate::downscaling::{get_downscaler, Downscaler};
use crate::error::{PrecomputedError, Result};
use crate::io::WriteOptions;
use crate::layout::{BoundingBox, ChunkCoordinate, ScaleLevel};
use crate::shard_assembler::ShardAssembler;
use crate::sharding::ChunkAddressor;
use crate::types::DataType;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

/// Source of full-resolution voxels
///
/// Parsing of the source image format lives behind this trait.
pub trait VolumeReader: Send + Sync {
    fn data_type(&self) -> DataType;

    fn num_channels(&self) -> usize;

    /// Size in voxels, `[x, y, z]`
    fn size(&self) -> [u64; 3];

    /// Voxel to physical (nanometre) transform, as the top 3 rows of a 4x4 matrix
    fn affine(&self) -> [[f64; 4]; 3] {
        [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]]
    }

    /// Voxels of `region`, which lies inside the volume
    fn read_region(&self, region: &BoundingBox) -> Result<VoxelBlock>;
}

/// Volume held entirely in memory
#[derive(Debug, Clone)]
pub struct InMemoryVolume {
    block: VoxelBlock,
    affine: [[f64; 4]; 3],
}

impl InMemoryVolume {
    pub fn new(block: VoxelBlock) -> Self {
        Self {
            block,
            affine: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]],
        }
    }

    /// Diagonal transform with the given voxel size in nanometres
    pub fn with_resolution(mut self, resolution: [f64; 3]) -> Self {
        for (axis, row) in self.affine.iter_mut().enumerate() {
            row[axis] = resolution[axis];
        }
        self
    }

    pub fn with_affine(mut self, affine: [[f64; 4]; 3]) -> Self {
        self.affine = affine;
        self
    }
}

impl VolumeReader for InMemoryVolume {
    fn data_type(&self) -> DataType {
        self.block.data_type()
    }

    fn num_channels(&self) -> usize {
        self.block.num_channels()
    }

    fn size(&self) -> [u64; 3] {
        self.block.size().map(|s| s as u64)
    }

    fn affine(&self) -> [[f64; 4]; 3] {
        self.affine
    }

    fn read_region(&self, region: &BoundingBox) -> Result<VoxelBlock> {
        if !BoundingBox::from_size(self.size()).contains(region) {
            return Err(PrecomputedError::OutOfBounds(format!(
                "region {} outside volume of size {:?}",
                region,
                self.size()
            )));
        }
        self.block
            .subblock(region.min.map(|v| v as usize), region.shape())
    }
}

/// Voxel size encoded in an affine transform (length of each column)
pub fn affine_resolution(affine: &[[f64; 4]; 3]) -> [f64; 3] {
    let column = |j: usize| (0..3).map(|i| affine[i][j] * affine[i][j]).sum::<f64>().sqrt();
    [column(0), column(1), column(2)]
}

/// Outcome of converting one level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelReport {
    pub key: String,
    pub chunks: u64,
    /// Encoded bytes written (chunk payloads, or whole shard files)
    pub bytes: u64,
    /// Shard files published; zero for non-sharded levels
    pub shards: u64,
}

/// Run CPU-bound work off the async runtime
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

type ChunkSource = Arc<dyn Fn(ChunkCoordinate) -> BoxFuture<'static, Result<VoxelBlock>> + Send + Sync>;

/// Writes the levels of a dataset described by its `info`
pub struct PyramidConverter {
    io: Arc<PrecomputedIo>,
}

impl PyramidConverter {
    pub fn new(io: Arc<PrecomputedIo>) -> Self {
        Self { io }
    }

    pub fn io(&self) -> &Arc<PrecomputedIo> {
        &self.io
    }

    /// Check that every level can be encoded and derived from the one before it
    ///
    /// Runs before any chunk is written, so a bad configuration leaves no
    /// partial levels behind.
    pub fn validate_plan(&self) -> Result<()> {
        let info = self.io.info();
        let levels = info.levels()?;
        for level in &levels {
            self.io.encoder(level)?;
        }
        if levels.len() > 1 {
            let options = self.io.options();
            get_downscaler(options.downscaling_method, info.volume_type, options.outside_value)?;
        }
        for pair in levels.windows(2) {
            downscaling_factors(&pair[0], &pair[1])?;
        }
        Ok(())
    }

    /// Write the first scale from `reader`
    pub async fn write_base_level(&self, reader: Arc<dyn VolumeReader>) -> Result<LevelReport> {
        let info = self.io.info();
        let first = info
            .scales
            .first()
            .ok_or_else(|| PrecomputedError::Config("info has no scales".into()))?;
        let level = ScaleLevel::try_from(first)?;
        if reader.data_type() != info.data_type
            || reader.num_channels() != info.num_channels
            || reader.size() != level.size
        {
            return Err(PrecomputedError::Config(format!(
                "volume of {} x {} channel(s) and size {:?} does not match scale {} ({} x {}, {:?})",
                reader.data_type(),
                reader.num_channels(),
                reader.size(),
                level.key,
                info.data_type,
                info.num_channels,
                level.size
            )));
        }

        let source: ChunkSource = Arc::new(move |chunk: ChunkCoordinate| {
            let reader = reader.clone();
            run_blocking(move || reader.read_region(&chunk.bounds)).boxed()
        });
        self.convert_level(&level, source).await
    }

    /// Compute every scale after the first from the one before it
    pub async fn compute_scales(&self) -> Result<Vec<LevelReport>> {
        self.validate_plan()?;
        let levels = self.io.info().levels()?;
        let mut reports = Vec::with_capacity(levels.len().saturating_sub(1));
        for pair in levels.windows(2) {
            reports.push(self.downscale_level(&pair[0].key, &pair[1].key).await?);
        }
        Ok(reports)
    }

    /// Write the first scale, then all the others
    pub async fn convert(&self, reader: Arc<dyn VolumeReader>) -> Result<Vec<LevelReport>> {
        self.validate_plan()?;
        let mut reports = vec![self.write_base_level(reader).await?];
        reports.extend(self.compute_scales().await?);
        Ok(reports)
    }

    /// Compute scale `target_key` from the already written scale `source_key`
    pub async fn downscale_level(&self, source_key: &str, target_key: &str) -> Result<LevelReport> {
        let info = self.io.info();
        let source = info.level(source_key)?;
        let target = info.level(target_key)?;
        let factors = downscaling_factors(&source, &target)?;
        let options = self.io.options();
        let downscaler: Arc<dyn Downscaler> = Arc::from(get_downscaler(
            options.downscaling_method,
            info.volume_type,
            options.outside_value,
        )?);

        let io = self.io.clone();
        let source_key = source.key.clone();
        let source_size = source.size;
        let chunk_source: ChunkSource = Arc::new(move |chunk: ChunkCoordinate| {
            let io = io.clone();
            let downscaler = downscaler.clone();
            let source_key = source_key.clone();
            async move {
                let mut min = [0; 3];
                let mut max = [0; 3];
                for axis in 0..3 {
                    min[axis] = chunk.bounds.min[axis] * factors[axis] as u64;
                    max[axis] = (chunk.bounds.max[axis] * factors[axis] as u64).min(source_size[axis]);
                }
                let parent = io.read_region(&source_key, &BoundingBox::new(min, max)).await?;
                run_blocking(move || downscaler.downscale(&parent, factors)).await
            }
            .boxed()
        });
        self.convert_level(&target, chunk_source).await
    }

    async fn convert_level(&self, level: &ScaleLevel, source: ChunkSource) -> Result<LevelReport> {
        let span = info_span!("convert_level", key = %level.key);
        self.convert_level_inner(level, source).instrument(span).await
    }

    async fn convert_level_inner(&self, level: &ScaleLevel, source: ChunkSource) -> Result<LevelReport> {
        let encoder = self.io.encoder(level)?;
        let options = self.io.options().clone();
        let accessor = self.io.accessor().clone();
        let layout = accessor.key_layout();
        info!(chunks = level.num_chunks(), "{}", level.summary());

        let mut assembler = match &level.sharding {
            Some(spec) => Some((
                ChunkAddressor::new(level.grid_shape())?,
                ShardAssembler::new(accessor.clone(), level.key.clone(), spec.clone())
                    .with_memory_budget(options.shard_memory_budget)
                    .with_compression_level(CompressionLevel::default())
                    .with_concurrency(options.concurrency)
                    .with_overwrite(options.overwrite),
            )),
            None => None,
        };
        let sharded = assembler.is_some();

        let mut encoded = stream::iter(level.chunks())
            .map(|chunk| {
                let source = source.clone();
                let accessor = accessor.clone();
                let key = level.chunk_key(&chunk, layout);
                let write_options = WriteOptions::new(!encoder.already_compressed(), options.overwrite);
                async move {
                    let block = source(chunk).await?;
                    if block.size() != chunk.bounds.shape() {
                        return Err(PrecomputedError::Data(format!(
                            "produced block of size {:?} for chunk {}",
                            block.size(),
                            chunk.bounds
                        )));
                    }
                    let bytes = run_blocking(move || encoder.encode(&block)).await?;
                    if !sharded {
                        accessor.write(&key, &bytes, write_options).await?;
                    }
                    Ok::<_, PrecomputedError>((chunk, bytes))
                }
            })
            .buffer_unordered(options.concurrency);

        let mut report = LevelReport {
            key: level.key.clone(),
            ..Default::default()
        };
        while let Some(item) = encoded.next().await {
            let (chunk, bytes) = item?;
            report.chunks += 1;
            match assembler.as_mut() {
                Some((addressor, assembler)) => {
                    assembler.add_chunk(addressor.chunk_id(chunk.grid)?, &bytes)?
                }
                None => report.bytes += bytes.len() as u64,
            }
        }
        drop(encoded);

        if let Some((_, mut assembler)) = assembler {
            let shards = assembler.flush().await?;
            report.bytes = shards.bytes;
            report.shards = shards.shards;
        }
        info!(
            chunks = report.chunks,
            bytes = report.bytes,
            shards = report.shards,
            "level written"
        );
        Ok(report)
    }
}

/// Per-axis integer factor between two levels of the same pyramid
pub fn downscaling_factors(source: &ScaleLevel, target: &ScaleLevel) -> Result<[usize; 3]> {
    let mut factors = [1usize; 3];
    for axis in 0..3 {
        let ratio = target.resolution[axis] / source.resolution[axis];
        let factor = ratio.round();
        if !(factor >= 1.0 && (ratio - factor).abs() < 1e-6) {
            return Err(PrecomputedError::Config(format!(
                "scale {} is not an integer downscaling of {} along axis {} (ratio {})",
                target.key, source.key, axis, ratio
            )));
        }
        factors[axis] = factor as usize;
        let expected = source.size[axis].div_ceil(factors[axis] as u64);
        if target.size[axis] != expected {
            return Err(PrecomputedError::Config(format!(
                "scale {} has size {} along axis {}, expected {} from {}",
                target.key, target.size[axis], axis, expected, source.key
            )));
        }
    }
    Ok(factors)
}
