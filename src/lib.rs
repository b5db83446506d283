//! Precomputed - chunked multi-resolution volume storage
//!
//! A Rust implementation of the storage engine behind Neuroglancer
//! "precomputed" volumes: dyadic pyramid planning, downsampling, chunk
//! codecs and the `neuroglancer_uint64_sharded_v1` container format.
//!
//! # Features
//!
//! - Pyramid planning for isotropic and anisotropic volumes
//! - Average, majority and striding downsampling
//! - `raw`, `jpeg` and `compressed_segmentation` chunk encodings
//! - Sharded output built in two passes and published atomically
//! - Local filesystem backend, read-only HTTP backend (`http-client` feature)
//! - Async I/O throughout
//!
//! # Example
//!
//! ```rust,ignore
//! use precomputed::{
//!     create_accessor, plan_pyramid, AccessorOptions, ConversionOptions, InMemoryVolume,
//!     PrecomputedIo, PyramidConverter, PyramidOptions,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(info: precomputed::Info, volume: InMemoryVolume) -> precomputed::Result<()> {
//! let options = ConversionOptions::default();
//! let info = plan_pyramid(&info, &PyramidOptions::default(), options.downscaling_method)?;
//! let accessor = create_accessor("file:///data/precomputed", AccessorOptions::default()).await?;
//! let io = PrecomputedIo::create(accessor, info, options).await?;
//! let converter = PyramidConverter::new(Arc::new(io));
//! for report in converter.convert(Arc::new(volume)).await? {
//!     println!("{}: {} chunks", report.key, report.chunks);
//! }
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod block;
pub mod compressed_segmentation;
pub mod compression;
pub mod config;
pub mod downscaling;
pub mod encoding;
pub mod error;
#[cfg(feature = "http-client")]
pub mod http;
pub mod io;
pub mod jpeg;
pub mod layout;
pub mod metadata;
pub mod murmur;
pub mod pipeline;
pub mod pyramid;
pub mod shard_assembler;
pub mod sharding;
pub mod stats;
pub mod types;
pub mod utils;

// Re-exports
pub use access::PrecomputedIo;
pub use block::{Label, Sample, VoxelBlock};
pub use compression::{CompressionLevel, Compressor, DataEncoding};
pub use config::{AccessorOptions, ConversionOptions, PyramidOptions, ShardingPolicy};
pub use downscaling::{get_downscaler, Downscaler, DownscalingMethod};
pub use encoding::{get_encoder, ChunkEncoder};
pub use error::{PrecomputedError, Result};
pub use io::{create_accessor, Accessor, FileSystemAccessor, StorageBackend, WriteOptions};
pub use layout::{BoundingBox, ChunkCoordinate, ChunkKeyLayout, ScaleLevel};
pub use metadata::{Info, ScaleInfo};
pub use pipeline::{InMemoryVolume, LevelReport, PyramidConverter, VolumeReader};
pub use pyramid::{compute_dyadic_scales, plan_pyramid};
pub use shard_assembler::{AssemblerState, ShardAssembler, ShardReport};
pub use sharding::{ChunkAddressor, ShardHash, ShardReader, ShardingSpec};
pub use stats::PyramidStats;
pub use types::{DataType, Encoding, JpegPlane, VolumeType};

/// Version of the crate
pub const PRECOMPUTED_VERSION: &str = env!("CARGO_PKG_VERSION");
