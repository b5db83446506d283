//! Lossless label codec (`compressed_segmentation`)
//!
//! Chunk layout, all little-endian `u32` words:
//!
//! - one word per channel: offset of the channel data, in words from the chunk start
//! - per channel, one 2-word header per block (X fastest): `lut_offset | bits << 24`
//!   and the offset of the packed indices, both in words from the channel start
//! - lookup tables and packed indices
//!
//! Indices use 0, 1, 2, 4, 8, 16 or 32 bits and are packed from the least
//! significant bit of each word, in X, Y, Z order over the full block.
//! Partial edge blocks are padded with their first lookup table entry.

use crate::block::{Label, VoxelBlock};
use crate::error::{PrecomputedError, Result};
use crate::types::{DataType, Encoding};
use ndarray::Array4;
use std::collections::HashMap;

const ENCODING_BITS: [u32; 7] = [0, 1, 2, 4, 8, 16, 32];

/// Smallest allowed bit width able to index `table_len` values
pub fn encoding_bits(table_len: usize) -> u32 {
    ENCODING_BITS
        .iter()
        .copied()
        .find(|&bits| bits == 32 || (1usize << bits) >= table_len)
        .unwrap_or(32)
}

fn grid_shape(size: [usize; 3], block_size: [usize; 3]) -> [usize; 3] {
    [
        size[0].div_ceil(block_size[0]),
        size[1].div_ceil(block_size[1]),
        size[2].div_ceil(block_size[2]),
    ]
}

fn check_block_size(block_size: [usize; 3]) -> Result<()> {
    if block_size.iter().any(|&b| b == 0) {
        return Err(PrecomputedError::Config(format!(
            "compressed_segmentation block size {:?} must be >= 1",
            block_size
        )));
    }
    Ok(())
}

fn write_word(buf: &mut [u8], word_index: usize, value: u32) {
    buf[word_index * 4..word_index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_word(buf: &[u8], word_index: usize) -> Result<u32> {
    let start = word_index * 4;
    buf.get(start..start + 4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .ok_or_else(|| {
            PrecomputedError::Data(format!(
                "compressed_segmentation data truncated: word {} past {} bytes",
                word_index,
                buf.len()
            ))
        })
}

fn pack_indices(indices: &[u32], bits: u32, out: &mut Vec<u8>) {
    if bits == 0 {
        return;
    }
    let per_word = (32 / bits) as usize;
    for group in indices.chunks(per_word) {
        let mut word = 0u32;
        for (i, &index) in group.iter().enumerate() {
            word |= index << (i as u32 * bits);
        }
        out.extend_from_slice(&word.to_le_bytes());
    }
}

fn encode_channel<T: Label>(
    array: &Array4<T>,
    channel: usize,
    block_size: [usize; 3],
) -> Result<Vec<u8>> {
    let (_, sz, sy, sx) = array.dim();
    let [gx, gy, gz] = grid_shape([sx, sy, sz], block_size);
    let [bx, by, bz] = block_size;
    let block_len = bx * by * bz;

    let mut buf = vec![0u8; gx * gy * gz * 8];
    let mut stored_tables: HashMap<Vec<u8>, u32> = HashMap::new();
    let mut table: Vec<T> = Vec::new();
    let mut positions: HashMap<T, u32> = HashMap::new();
    let mut indices: Vec<u32> = Vec::with_capacity(block_len);

    for z in 0..gz {
        for y in 0..gy {
            for x in 0..gx {
                let (x0, y0, z0) = (x * bx, y * by, z * bz);
                table.clear();
                positions.clear();
                indices.clear();
                let padding = array[[channel, z0, y0, x0]];
                for dz in 0..bz {
                    for dy in 0..by {
                        for dx in 0..bx {
                            let (zi, yi, xi) = (z0 + dz, y0 + dy, x0 + dx);
                            let value = if zi < sz && yi < sy && xi < sx {
                                array[[channel, zi, yi, xi]]
                            } else {
                                padding
                            };
                            let next = table.len() as u32;
                            let index = *positions.entry(value).or_insert_with(|| {
                                table.push(value);
                                next
                            });
                            indices.push(index);
                        }
                    }
                }

                let bits = encoding_bits(table.len());
                let mut table_bytes = Vec::with_capacity(table.len() * T::DATA_TYPE.size_in_bytes());
                for &value in &table {
                    value.extend_le(&mut table_bytes);
                }
                let table_offset = match stored_tables.get(&table_bytes) {
                    Some(&offset) => offset,
                    None => {
                        let offset = (buf.len() / 4) as u32;
                        buf.extend_from_slice(&table_bytes);
                        stored_tables.insert(table_bytes, offset);
                        offset
                    }
                };
                if table_offset > 0x00FF_FFFF {
                    return Err(PrecomputedError::Encoding(format!(
                        "lookup table offset {} does not fit in 24 bits, use smaller chunks",
                        table_offset
                    )));
                }
                let values_offset = (buf.len() / 4) as u32;
                pack_indices(&indices, bits, &mut buf);

                let header = 2 * (x + gx * (y + gy * z));
                write_word(&mut buf, header, table_offset | (bits << 24));
                write_word(&mut buf, header + 1, values_offset);
            }
        }
    }
    Ok(buf)
}

/// Encode a `(channel, z, y, x)` label array
pub fn encode<T: Label>(array: &Array4<T>, block_size: [usize; 3]) -> Result<Vec<u8>> {
    check_block_size(block_size)?;
    let num_channels = array.dim().0;
    let mut out = vec![0u8; 4 * num_channels];
    for channel in 0..num_channels {
        let offset = (out.len() / 4) as u32;
        write_word(&mut out, channel, offset);
        let encoded = encode_channel(array, channel, block_size)?;
        out.extend_from_slice(&encoded);
    }
    Ok(out)
}

fn decode_channel_into<T: Label>(
    out: &mut Array4<T>,
    channel: usize,
    buf: &[u8],
    block_size: [usize; 3],
) -> Result<()> {
    let (_, sz, sy, sx) = out.dim();
    let [gx, gy, gz] = grid_shape([sx, sy, sz], block_size);
    let [bx, by, bz] = block_size;
    let block_len = bx * by * bz;
    let item = T::DATA_TYPE.size_in_bytes();

    if buf.len() < gx * gy * gz * 8 {
        return Err(PrecomputedError::Data(format!(
            "compressed_segmentation channel {} too short for {} block headers",
            channel,
            gx * gy * gz
        )));
    }

    for z in 0..gz {
        for y in 0..gy {
            for x in 0..gx {
                let header = 2 * (x + gx * (y + gy * z));
                let word0 = read_word(buf, header)?;
                let table_start = 4 * (word0 & 0x00FF_FFFF) as usize;
                let bits = word0 >> 24;
                if !ENCODING_BITS.contains(&bits) {
                    return Err(PrecomputedError::Data(format!(
                        "invalid number of encoding bits ({}) in compressed_segmentation block",
                        bits
                    )));
                }
                let values_start = 4 * read_word(buf, header + 1)? as usize;
                if bits > 0 {
                    let per_word = (32 / bits) as usize;
                    let values_end = values_start + 4 * block_len.div_ceil(per_word);
                    if values_end > buf.len() {
                        return Err(PrecomputedError::Data(
                            "compressed_segmentation data too short for encoded values".into(),
                        ));
                    }
                }
                let lookup = |index: usize| -> Result<T> {
                    let start = table_start + index * item;
                    buf.get(start..start + item).map(T::from_le_slice).ok_or_else(|| {
                        PrecomputedError::Data(
                            "compressed_segmentation index out of the lookup table".into(),
                        )
                    })
                };

                let (x0, y0, z0) = (x * bx, y * by, z * bz);
                for dz in 0..bz.min(sz - z0) {
                    for dy in 0..by.min(sy - y0) {
                        for dx in 0..bx.min(sx - x0) {
                            let index = if bits == 0 {
                                0
                            } else {
                                let i = dx + bx * (dy + by * dz);
                                let per_word = (32 / bits) as usize;
                                let word = read_word(buf, values_start / 4 + i / per_word)?;
                                let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
                                ((word >> ((i % per_word) as u32 * bits)) & mask) as usize
                            };
                            out[[channel, z0 + dz, y0 + dy, x0 + dx]] = lookup(index)?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Decode a chunk of `size` (`[x, y, z]`) voxels
pub fn decode<T: Label>(
    bytes: &[u8],
    num_channels: usize,
    size: [usize; 3],
    block_size: [usize; 3],
) -> Result<Array4<T>> {
    check_block_size(block_size)?;
    let [gx, gy, gz] = grid_shape(size, block_size);
    if bytes.len() < num_channels * (4 + 8 * gx * gy * gz) {
        return Err(PrecomputedError::Data(format!(
            "compressed_segmentation chunk of {} bytes is too short",
            bytes.len()
        )));
    }
    let offsets = (0..num_channels)
        .map(|c| read_word(bytes, c).map(|w| 4 * w as usize))
        .collect::<Result<Vec<_>>>()?;
    let mut out = Array4::from_elem((num_channels, size[2], size[1], size[0]), T::default());
    for channel in 0..num_channels {
        let start = offsets[channel];
        let end = offsets.get(channel + 1).copied().unwrap_or(bytes.len());
        if start < 4 * num_channels || start > end || end > bytes.len() {
            return Err(PrecomputedError::Data(format!(
                "compressed_segmentation channel {} has invalid byte range {}..{}",
                channel, start, end
            )));
        }
        decode_channel_into(&mut out, channel, &bytes[start..end], block_size)?;
    }
    Ok(out)
}

/// `compressed_segmentation` chunk codec of one scale level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedSegmentationCodec {
    pub data_type: DataType,
    pub num_channels: usize,
    pub block_size: [usize; 3],
}

impl CompressedSegmentationCodec {
    pub fn new(data_type: DataType, num_channels: usize, block_size: [usize; 3]) -> Result<Self> {
        check_block_size(block_size)?;
        if !matches!(data_type, DataType::Uint32 | DataType::Uint64) {
            return Err(PrecomputedError::Encoding(format!(
                "compressed_segmentation needs uint32 or uint64 data, not {}",
                data_type
            )));
        }
        Ok(Self {
            data_type,
            num_channels,
            block_size,
        })
    }

    pub fn encode(&self, block: &VoxelBlock) -> Result<Vec<u8>> {
        if block.num_channels() != self.num_channels {
            return Err(PrecomputedError::Encoding(format!(
                "block has {} channels, the level declares {}",
                block.num_channels(),
                self.num_channels
            )));
        }
        match block {
            VoxelBlock::Uint32(arr) if self.data_type == DataType::Uint32 => {
                encode(arr, self.block_size)
            }
            VoxelBlock::Uint64(arr) if self.data_type == DataType::Uint64 => {
                encode(arr, self.block_size)
            }
            other => Err(PrecomputedError::Encoding(format!(
                "cannot encode a {} block as {} {}",
                other.data_type(),
                self.data_type,
                Encoding::CompressedSegmentation
            ))),
        }
    }

    pub fn decode(&self, bytes: &[u8], size: [usize; 3]) -> Result<VoxelBlock> {
        match self.data_type {
            DataType::Uint32 => {
                decode::<u32>(bytes, self.num_channels, size, self.block_size).map(VoxelBlock::from_array)
            }
            _ => decode::<u64>(bytes, self.num_channels, size, self.block_size).map(VoxelBlock::from_array),
        }
    }
}
