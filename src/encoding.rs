//! Chunk encoders
//!
//! The set of encodings is closed, so dispatch goes through [`ChunkEncoder`]
//! instead of trait objects. Every encoder turns a `(channel, z, y, x)`
//! block into the bytes of one chunk and back.

use crate::block::VoxelBlock;
use crate::compressed_segmentation::CompressedSegmentationCodec;
use crate::config::ConversionOptions;
use crate::error::{PrecomputedError, Result};
use crate::jpeg::JpegCodec;
use crate::layout::{ScaleLevel, DEFAULT_SEGMENTATION_BLOCK_SIZE};
use crate::metadata::Info;
use crate::types::{DataType, Encoding};

/// `raw` chunk codec: little-endian voxels, X fastest, channel slowest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCodec {
    pub data_type: DataType,
    pub num_channels: usize,
}

impl RawCodec {
    pub fn new(data_type: DataType, num_channels: usize) -> Self {
        Self {
            data_type,
            num_channels,
        }
    }

    pub fn encode(&self, block: &VoxelBlock) -> Result<Vec<u8>> {
        if block.data_type() != self.data_type || block.num_channels() != self.num_channels {
            return Err(PrecomputedError::Encoding(format!(
                "block of {} x {} channels does not match the declared {} x {} channels",
                block.data_type(),
                block.num_channels(),
                self.data_type,
                self.num_channels
            )));
        }
        Ok(block.to_le_bytes())
    }

    pub fn decode(&self, bytes: &[u8], size: [usize; 3]) -> Result<VoxelBlock> {
        VoxelBlock::from_le_bytes(self.data_type, self.num_channels, size, bytes)
    }
}

/// Encoder of one scale level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEncoder {
    Raw(RawCodec),
    Jpeg(JpegCodec),
    CompressedSegmentation(CompressedSegmentationCodec),
}

impl ChunkEncoder {
    /// Chunk bytes of `block`
    ///
    /// Fails with an encoding error when the block type or channel count
    /// does not fit the encoding.
    pub fn encode(&self, block: &VoxelBlock) -> Result<Vec<u8>> {
        match self {
            ChunkEncoder::Raw(codec) => codec.encode(block),
            ChunkEncoder::Jpeg(codec) => codec.encode(block),
            ChunkEncoder::CompressedSegmentation(codec) => codec.encode(block),
        }
    }

    /// Block of `size` (`[x, y, z]`) voxels stored in `bytes`
    ///
    /// Corrupt or wrongly sized input is a data error.
    pub fn decode(&self, bytes: &[u8], size: [usize; 3]) -> Result<VoxelBlock> {
        match self {
            ChunkEncoder::Raw(codec) => codec.decode(bytes, size),
            ChunkEncoder::Jpeg(codec) => codec.decode(bytes, size),
            ChunkEncoder::CompressedSegmentation(codec) => codec.decode(bytes, size),
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            ChunkEncoder::Raw(_) => Encoding::Raw,
            ChunkEncoder::Jpeg(_) => Encoding::Jpeg,
            ChunkEncoder::CompressedSegmentation(_) => Encoding::CompressedSegmentation,
        }
    }

    /// True when the storage layer should not gzip the chunk again
    pub fn already_compressed(&self) -> bool {
        self.encoding().already_compressed()
    }
}

/// Encoder for `level` of a dataset described by `info`
pub fn get_encoder(info: &Info, level: &ScaleLevel, options: &ConversionOptions) -> Result<ChunkEncoder> {
    match level.encoding {
        Encoding::Raw => Ok(ChunkEncoder::Raw(RawCodec::new(info.data_type, info.num_channels))),
        Encoding::Jpeg => JpegCodec::new(
            info.data_type,
            info.num_channels,
            options.jpeg_quality,
            options.jpeg_plane,
        )
        .map(ChunkEncoder::Jpeg),
        Encoding::CompressedSegmentation => {
            let block_size = level
                .compressed_segmentation_block_size
                .unwrap_or(DEFAULT_SEGMENTATION_BLOCK_SIZE)
                .map(|b| b as usize);
            CompressedSegmentationCodec::new(info.data_type, info.num_channels, block_size)
                .map(ChunkEncoder::CompressedSegmentation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VolumeType;
    use ndarray::Array4;

    fn level(encoding: Encoding) -> ScaleLevel {
        ScaleLevel::new("8nm", [16, 16, 16], [8.0; 3], [8, 8, 8]).with_encoding(encoding)
    }

    #[test]
    fn test_raw_bytes_are_little_endian_x_fastest() {
        let info = Info::new(VolumeType::Image, DataType::Uint16, 1);
        let encoder = get_encoder(&info, &level(Encoding::Raw), &ConversionOptions::default()).unwrap();
        let block = VoxelBlock::from_array(
            Array4::from_shape_vec((1, 1, 1, 3), vec![1u16, 0x0203, 0xFFFF]).unwrap(),
        );
        let bytes = encoder.encode(&block).unwrap();
        assert_eq!(bytes, vec![1, 0, 3, 2, 0xFF, 0xFF]);
        assert_eq!(encoder.decode(&bytes, [3, 1, 1]).unwrap(), block);
        assert!(matches!(
            encoder.decode(&bytes[1..], [3, 1, 1]),
            Err(PrecomputedError::Data(_))
        ));
    }

    #[test]
    fn test_raw_rejects_mismatched_blocks() {
        let info = Info::new(VolumeType::Image, DataType::Uint8, 2);
        let encoder = get_encoder(&info, &level(Encoding::Raw), &ConversionOptions::default()).unwrap();
        let block = VoxelBlock::zeros(DataType::Uint8, 1, [2, 2, 2]);
        assert!(matches!(encoder.encode(&block), Err(PrecomputedError::Encoding(_))));
    }

    #[test]
    fn test_encoder_selection() {
        let options = ConversionOptions::default().with_jpeg_quality(80);
        let gray = Info::new(VolumeType::Image, DataType::Uint8, 1);
        let encoder = get_encoder(&gray, &level(Encoding::Jpeg), &options).unwrap();
        assert!(encoder.already_compressed());
        match encoder {
            ChunkEncoder::Jpeg(codec) => assert_eq!(codec.quality, 80),
            other => panic!("unexpected encoder {:?}", other),
        }

        let labels = Info::new(VolumeType::Segmentation, DataType::Uint64, 1);
        let encoder = get_encoder(&labels, &level(Encoding::CompressedSegmentation), &options).unwrap();
        assert_eq!(encoder.encoding(), Encoding::CompressedSegmentation);
        assert!(!encoder.already_compressed());

        let floats = Info::new(VolumeType::Image, DataType::Float32, 1);
        assert!(matches!(
            get_encoder(&floats, &level(Encoding::Jpeg), &options),
            Err(PrecomputedError::Encoding(_))
        ));
    }

    #[test]
    fn test_segmentation_block_trip() {
        let labels = Info::new(VolumeType::Segmentation, DataType::Uint32, 1);
        let encoder = get_encoder(
            &labels,
            &level(Encoding::CompressedSegmentation),
            &ConversionOptions::default(),
        )
        .unwrap();
        let block = VoxelBlock::from_array(Array4::from_shape_fn((1, 5, 6, 7), |(_, z, y, x)| {
            (x / 3 + 10 * (y / 2) + 100 * z) as u32
        }));
        let bytes = encoder.encode(&block).unwrap();
        assert_eq!(encoder.decode(&bytes, [7, 6, 5]).unwrap(), block);
    }
}
