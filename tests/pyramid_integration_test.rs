//! End-to-end conversion tests on the local filesystem
//!
//! Each test builds a small synthetic volume, converts it into a pyramid
//! and checks the files and the decoded voxels of the result.

use ndarray::Array4;
use precomputed::{
    create_accessor, plan_pyramid, AccessorOptions, BoundingBox, ConversionOptions, DataType,
    Downscaler, DownscalingMethod, Encoding, FileSystemAccessor, InMemoryVolume, Info,
    JpegPlane,
    PrecomputedIo, PyramidConverter, PyramidOptions, ScaleLevel, ShardingPolicy, VolumeType,
    VoxelBlock,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Log through the test writer; `RUST_LOG=precomputed=debug` shows chunk traffic
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Plain, flat chunk files so that their bytes can be checked directly
fn plain_accessor(dir: &Path) -> Arc<FileSystemAccessor> {
    Arc::new(FileSystemAccessor::new(
        dir,
        AccessorOptions::default().with_flat(true).with_gzip(false),
    ))
}

/// Every file below `dir`, relative and sorted
fn files_under(dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path.strip_prefix(dir).unwrap().to_string_lossy().into_owned());
            }
        }
    }
    files.sort();
    files
}

#[tokio::test]
async fn test_average_one_level_matches_reference() -> anyhow::Result<()> {
    init_tracing();
    let temp_dir = TempDir::new()?;

    // v(x, y, z) = 8x + y, so every 2x2x2 mean is 16i + 2j + 4.5
    let volume = Array4::from_shape_fn((1, 16, 16, 16), |(_, _, y, x)| (8 * x + y) as u8);
    let info = Info::new(VolumeType::Image, DataType::Uint8, 1)
        .with_scale(&ScaleLevel::new("1nm", [16, 16, 16], [1.0; 3], [8, 8, 8]))
        .with_scale(&ScaleLevel::new("2nm", [8, 8, 8], [2.0; 3], [4, 4, 4]));
    let options = ConversionOptions::default().with_downscaling_method(DownscalingMethod::Average);
    let io = PrecomputedIo::create(plain_accessor(temp_dir.path()), info, options).await?;
    let converter = PyramidConverter::new(Arc::new(io));

    let reports = converter
        .convert(Arc::new(InMemoryVolume::new(VoxelBlock::from_array(volume))))
        .await?;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].chunks, 8);
    assert_eq!(reports[1].chunks, 8);
    assert_eq!(reports[1].bytes, 8 * 64);

    let level_1: Vec<String> = files_under(temp_dir.path())
        .into_iter()
        .filter(|f| f.starts_with("2nm"))
        .collect();
    assert_eq!(level_1.len(), 8);

    for gz in 0..2u64 {
        for gy in 0..2u64 {
            for gx in 0..2u64 {
                let name = format!(
                    "2nm/{}-{}_{}-{}_{}-{}",
                    4 * gx,
                    4 * gx + 4,
                    4 * gy,
                    4 * gy + 4,
                    4 * gz,
                    4 * gz + 4
                );
                let bytes = std::fs::read(temp_dir.path().join(&name))?;
                // X fastest, rounded half up
                let mut reference = Vec::with_capacity(64);
                for _z in 0..4u64 {
                    for j in 4 * gy..4 * gy + 4 {
                        for i in 4 * gx..4 * gx + 4 {
                            reference.push((16 * i + 2 * j + 5) as u8);
                        }
                    }
                }
                assert_eq!(bytes, reference, "chunk {}", name);
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_sharded_segmentation_pyramid() -> anyhow::Result<()> {
    init_tracing();
    let temp_dir = TempDir::new()?;
    let labels = Array4::from_shape_fn((1, 32, 32, 32), |(_, z, y, x)| {
        (1000 + x / 3 + 5 * (y / 5) + 25 * (z / 7)) as u32
    });
    let source = VoxelBlock::from_array(labels);

    let base = ScaleLevel::new("base", [32, 32, 32], [8.0; 3], [8, 8, 8])
        .with_encoding(Encoding::CompressedSegmentation);
    let info = Info::new(VolumeType::Segmentation, DataType::Uint32, 1).with_scale(&base);
    let pyramid_options = PyramidOptions::default()
        .with_target_chunk_size(8)
        .with_max_scales(3)
        .with_sharding(ShardingPolicy::default());
    let info = plan_pyramid(&info, &pyramid_options, DownscalingMethod::Majority)?;
    let keys: Vec<_> = info.scales.iter().map(|s| s.key.clone()).collect();
    assert_eq!(keys, vec!["8nm", "16nm", "32nm"]);
    assert!(info.scales.iter().all(|s| s.sharding.is_some()));

    let options = ConversionOptions::default()
        .with_downscaling_method(DownscalingMethod::Majority)
        .with_concurrency(3)
        .with_shard_memory_budget(2048);
    let accessor = create_accessor(temp_dir.path().to_str().unwrap(), AccessorOptions::default()).await?;
    let io = Arc::new(PrecomputedIo::create(accessor, info, options).await?);
    let converter = PyramidConverter::new(io.clone());
    let reports = converter.convert(Arc::new(InMemoryVolume::new(source.clone()))).await?;
    assert_eq!(
        reports.iter().map(|r| (r.chunks, r.shards)).collect::<Vec<_>>(),
        vec![(64, 1), (8, 1), (1, 1)]
    );

    // only info and one shard per level, no chunk files and no leftovers
    assert_eq!(
        files_under(temp_dir.path()),
        vec!["16nm/0.shard", "32nm/0.shard", "8nm/0.shard", "info"]
    );

    let base_back = io.read_region("8nm", &BoundingBox::from_size([32, 32, 32])).await?;
    assert_eq!(base_back, source);

    let majority = precomputed::downscaling::MajorityDownscaler;
    let expected = majority.downscale(&source, [2, 2, 2])?;
    let level_1 = io.read_region("16nm", &BoundingBox::from_size([16, 16, 16])).await?;
    assert_eq!(level_1, expected);

    let corner = io
        .read_chunk("32nm", &BoundingBox::from_size([8, 8, 8]))
        .await?;
    assert_eq!(corner, majority.downscale(&expected, [2, 2, 2])?);
    Ok(())
}

#[tokio::test]
async fn test_rerun_without_overwrite_keeps_published_output() -> anyhow::Result<()> {
    init_tracing();
    let temp_dir = TempDir::new()?;
    let base = ScaleLevel::new("4nm", [8, 8, 8], [4.0; 3], [4, 4, 4])
        .with_sharding(precomputed::ShardingSpec::new(0, 1));
    let info = Info::new(VolumeType::Image, DataType::Uint16, 1).with_scale(&base);
    let volume = Arc::new(InMemoryVolume::new(VoxelBlock::from_array(Array4::from_elem(
        (1, 8, 8, 8),
        7u16,
    ))));

    let accessor = plain_accessor(temp_dir.path());
    let io = PrecomputedIo::create(accessor.clone(), info, ConversionOptions::default()).await?;
    PyramidConverter::new(Arc::new(io)).write_base_level(volume.clone()).await?;
    let published = std::fs::read(temp_dir.path().join("4nm/0.shard"))?;

    let reopened = Arc::new(PrecomputedIo::open(accessor, ConversionOptions::default()).await?);
    let err = PyramidConverter::new(reopened.clone())
        .write_base_level(volume)
        .await
        .unwrap_err();
    assert!(matches!(err, precomputed::PrecomputedError::AlreadyExists(_)));
    assert_eq!(std::fs::read(temp_dir.path().join("4nm/0.shard"))?, published);
    assert_eq!(files_under(temp_dir.path()), vec!["4nm/0.shard", "info"]);

    let block = reopened.read_chunk("4nm", &BoundingBox::new([4, 4, 4], [8, 8, 8])).await?;
    assert!(block.as_array::<u16>().unwrap().iter().all(|&v| v == 7));
    Ok(())
}

#[tokio::test]
async fn test_jpeg_pyramid_and_stats() -> anyhow::Result<()> {
    init_tracing();
    let temp_dir = TempDir::new()?;
    let volume = Array4::from_shape_fn((1, 8, 16, 16), |(_, z, y, x)| (60 + 4 * x + 3 * y + 2 * z) as u8);
    let base = ScaleLevel::new("base", [16, 16, 8], [4.0, 4.0, 8.0], [16, 16, 8])
        .with_encoding(Encoding::Jpeg);
    let info = Info::new(VolumeType::Image, DataType::Uint8, 1).with_scale(&base);
    let info = plan_pyramid(
        &info,
        &PyramidOptions::default().with_target_chunk_size(8).with_max_scales(2),
        DownscalingMethod::Auto,
    )?;
    assert_eq!(info.scales[1].resolution, [8.0, 8.0, 8.0]);
    assert_eq!(info.scales[1].size, [8, 8, 8]);

    let io = Arc::new(
        PrecomputedIo::create(
            Arc::new(FileSystemAccessor::new(temp_dir.path(), AccessorOptions::default())),
            info,
            ConversionOptions::default()
                .with_jpeg_quality(95)
                .with_jpeg_plane(JpegPlane::Xz),
        )
        .await?,
    );
    let reports = PyramidConverter::new(io.clone())
        .convert(Arc::new(InMemoryVolume::new(VoxelBlock::from_array(volume.clone()))))
        .await?;
    assert_eq!(reports.len(), 2);

    // jpeg chunks are never gzipped
    assert!(files_under(temp_dir.path())
        .iter()
        .filter(|f| f.as_str() != "info")
        .all(|f| !f.ends_with(".gz")));

    let decoded = io.read_region("4nm", &BoundingBox::from_size([16, 16, 8])).await?;
    let max_error = decoded
        .as_array::<u8>()
        .unwrap()
        .iter()
        .zip(volume.iter())
        .map(|(&a, &b)| (a as i32 - b as i32).abs())
        .max()
        .unwrap();
    assert!(max_error <= 20, "max error {}", max_error);

    // a reader that does not know the plane still decodes xz chunks
    let reader = PrecomputedIo::open(
        Arc::new(FileSystemAccessor::new(temp_dir.path(), AccessorOptions::default())),
        ConversionOptions::default(),
    )
    .await?;
    assert_eq!(reader.read_region("4nm", &BoundingBox::from_size([16, 16, 8])).await?, decoded);

    let stats = io.stats()?;
    assert_eq!(stats.levels.len(), 2);
    assert_eq!(stats.levels[1].key, "8nm");
    assert_eq!(stats.levels[1].num_chunks, 1);
    Ok(())
}
