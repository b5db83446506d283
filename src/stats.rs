//! Per-scale statistics of a pyramid

use crate::error::Result;
use crate::metadata::Info;
use crate::types::{DataType, Encoding};
use crate::utils::{format_bytes, readable_count};
use std::fmt;

/// Statistics of one scale
#[derive(Debug, Clone, PartialEq)]
pub struct LevelStats {
    pub key: String,
    pub size: [u64; 3],
    pub chunk_size: [u64; 3],
    pub grid_shape: [u64; 3],
    pub num_chunks: u64,
    pub encoding: Encoding,
    pub sharded: bool,
    /// Bytes of the decoded level
    pub uncompressed_size: u64,
}

impl LevelStats {
    pub fn summary(&self) -> String {
        format!(
            "{}: {}x{}x{} voxels, {} chunks of {}x{}x{} ({} per chunk), {}B uncompressed, {}{}",
            self.key,
            self.size[0],
            self.size[1],
            self.size[2],
            self.num_chunks,
            self.chunk_size[0],
            self.chunk_size[1],
            self.chunk_size[2],
            format_bytes(self.uncompressed_size / self.num_chunks.max(1)),
            readable_count(self.uncompressed_size),
            self.encoding,
            if self.sharded { ", sharded" } else { "" }
        )
    }
}

/// Statistics of every scale of a dataset
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidStats {
    pub data_type: DataType,
    pub num_channels: usize,
    pub levels: Vec<LevelStats>,
}

impl PyramidStats {
    pub fn from_info(info: &Info) -> Result<Self> {
        let levels = info
            .levels()?
            .into_iter()
            .map(|level| LevelStats {
                grid_shape: level.grid_shape(),
                num_chunks: level.num_chunks(),
                encoding: level.encoding,
                sharded: level.is_sharded(),
                uncompressed_size: level.total_size_bytes(info.data_type, info.num_channels),
                size: level.size,
                chunk_size: level.chunk_size,
                key: level.key,
            })
            .collect();
        Ok(Self {
            data_type: info.data_type,
            num_channels: info.num_channels,
            levels,
        })
    }

    pub fn total_chunks(&self) -> u64 {
        self.levels.iter().map(|l| l.num_chunks).sum()
    }

    pub fn total_uncompressed_size(&self) -> u64 {
        self.levels.iter().map(|l| l.uncompressed_size).sum()
    }
}

impl fmt::Display for PyramidStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} scales of {} x {} channel(s), {} chunks, {} uncompressed",
            self.levels.len(),
            self.data_type,
            self.num_channels,
            self.total_chunks(),
            format_bytes(self.total_uncompressed_size())
        )?;
        for level in &self.levels {
            writeln!(f, "  {}", level.summary())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ScaleLevel;
    use crate::sharding::ShardingSpec;
    use crate::types::VolumeType;

    #[test]
    fn test_pyramid_stats() {
        let info = Info::new(VolumeType::Image, DataType::Uint16, 2)
            .with_scale(&ScaleLevel::new("1um", [128, 128, 64], [1000.0; 3], [64, 64, 64]))
            .with_scale(
                &ScaleLevel::new("2um", [64, 64, 32], [2000.0; 3], [64, 64, 64])
                    .with_sharding(ShardingSpec::new(0, 0)),
            );
        let stats = PyramidStats::from_info(&info).unwrap();
        assert_eq!(stats.levels[0].grid_shape, [2, 2, 1]);
        assert_eq!(stats.levels[0].uncompressed_size, 128 * 128 * 64 * 2 * 2);
        assert_eq!(stats.total_chunks(), 5);
        assert!(stats.levels[1].sharded);

        let text = stats.to_string();
        assert!(text.starts_with("2 scales of uint16 x 2 channel(s), 5 chunks"));
        assert!(text.contains("2um: 64x64x32 voxels"));
        assert!(text.contains(", sharded"));
    }
}
