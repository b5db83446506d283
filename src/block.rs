//! Dense voxel blocks with `(channel, z, y, x)` indexing

use crate::error::{PrecomputedError, Result};
use crate::types::DataType;
use ndarray::{s, Array4};
use num_traits::{Bounded, ToPrimitive};
use std::fmt;
use std::hash::Hash;

/// Scalar voxel types that can live in a [`VoxelBlock`]
pub trait Sample: Copy + PartialEq + Default + fmt::Debug + Send + Sync + 'static {
    /// Data type tag of this scalar
    const DATA_TYPE: DataType;

    /// Decode one value from exactly `DATA_TYPE.size_in_bytes()` little-endian bytes
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Append the little-endian representation of this value
    fn extend_le(self, out: &mut Vec<u8>);

    /// Convert to `f64` (lossy above 2^53 for 64-bit integers)
    fn to_f64(self) -> f64;

    /// Round half up and clamp into the representable range
    fn from_f64_rounded(value: f64) -> Self;

    /// Arithmetic mean of `samples` plus `pad_count` copies of `pad_value`
    ///
    /// Integers round half up, floats are exact to `f64` precision. An empty
    /// input yields `pad_value` converted to this type.
    fn mean(samples: &[Self], pad_value: f64, pad_count: usize) -> Self;

    /// Wrap a typed array into the matching block variant
    fn into_block(array: Array4<Self>) -> VoxelBlock;

    /// Borrow the typed array if the block holds this scalar type
    fn as_array(block: &VoxelBlock) -> Option<&Array4<Self>>;
}

/// Integer samples usable as segmentation labels
pub trait Label: Sample + Eq + Hash {}

impl Label for u32 {}
impl Label for u64 {}

macro_rules! impl_unsigned_sample {
    ($t:ty, $variant:ident, $dtype:expr) => {
        impl Sample for $t {
            const DATA_TYPE: DataType = $dtype;

            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }

            fn extend_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64_rounded(value: f64) -> Self {
                if value.is_nan() {
                    return 0;
                }
                let rounded = (value + 0.5).floor();
                let max = ToPrimitive::to_f64(&<$t as Bounded>::max_value()).unwrap_or(f64::MAX);
                if rounded <= 0.0 {
                    0
                } else if rounded >= max {
                    <$t as Bounded>::max_value()
                } else {
                    rounded as $t
                }
            }

            fn mean(samples: &[Self], pad_value: f64, pad_count: usize) -> Self {
                let count = samples.len() + pad_count;
                if count == 0 {
                    return Self::from_f64_rounded(pad_value);
                }
                if pad_count == 0 {
                    // Exact integer path: floor((2 * sum + n) / 2n) is round half up
                    let sum: u128 = samples.iter().map(|&v| v as u128).sum();
                    let n = count as u128;
                    return ((2 * sum + n) / (2 * n)) as $t;
                }
                let sum: f64 = samples.iter().map(|&v| v as f64).sum::<f64>()
                    + pad_value * pad_count as f64;
                Self::from_f64_rounded(sum / count as f64)
            }

            fn into_block(array: Array4<Self>) -> VoxelBlock {
                VoxelBlock::$variant(array)
            }

            fn as_array(block: &VoxelBlock) -> Option<&Array4<Self>> {
                match block {
                    VoxelBlock::$variant(array) => Some(array),
                    _ => None,
                }
            }
        }
    };
}

impl_unsigned_sample!(u8, Uint8, DataType::Uint8);
impl_unsigned_sample!(u16, Uint16, DataType::Uint16);
impl_unsigned_sample!(u32, Uint32, DataType::Uint32);
impl_unsigned_sample!(u64, Uint64, DataType::Uint64);

impl Sample for f32 {
    const DATA_TYPE: DataType = DataType::Float32;

    fn from_le_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        f32::from_le_bytes(buf)
    }

    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64_rounded(value: f64) -> Self {
        value as f32
    }

    fn mean(samples: &[Self], pad_value: f64, pad_count: usize) -> Self {
        let count = samples.len() + pad_count;
        if count == 0 {
            return pad_value as f32;
        }
        let sum: f64 =
            samples.iter().map(|&v| v as f64).sum::<f64>() + pad_value * pad_count as f64;
        (sum / count as f64) as f32
    }

    fn into_block(array: Array4<Self>) -> VoxelBlock {
        VoxelBlock::Float32(array)
    }

    fn as_array(block: &VoxelBlock) -> Option<&Array4<Self>> {
        match block {
            VoxelBlock::Float32(array) => Some(array),
            _ => None,
        }
    }
}

/// Dense voxel array of one scalar type, shaped `(channels, z, y, x)`
#[derive(Debug, Clone, PartialEq)]
pub enum VoxelBlock {
    Uint8(Array4<u8>),
    Uint16(Array4<u16>),
    Uint32(Array4<u32>),
    Uint64(Array4<u64>),
    Float32(Array4<f32>),
}

/// Run `$body` with `$arr` bound to the typed array inside a block
#[macro_export]
macro_rules! with_block {
    ($block:expr, $arr:ident => $body:expr) => {
        match $block {
            $crate::block::VoxelBlock::Uint8($arr) => $body,
            $crate::block::VoxelBlock::Uint16($arr) => $body,
            $crate::block::VoxelBlock::Uint32($arr) => $body,
            $crate::block::VoxelBlock::Uint64($arr) => $body,
            $crate::block::VoxelBlock::Float32($arr) => $body,
        }
    };
}

/// Like [`with_block!`], re-wrapping the array produced by `$body` in the same variant
#[macro_export]
macro_rules! map_block {
    ($block:expr, $arr:ident => $body:expr) => {
        match $block {
            $crate::block::VoxelBlock::Uint8($arr) => $crate::block::VoxelBlock::Uint8($body),
            $crate::block::VoxelBlock::Uint16($arr) => $crate::block::VoxelBlock::Uint16($body),
            $crate::block::VoxelBlock::Uint32($arr) => $crate::block::VoxelBlock::Uint32($body),
            $crate::block::VoxelBlock::Uint64($arr) => $crate::block::VoxelBlock::Uint64($body),
            $crate::block::VoxelBlock::Float32($arr) => $crate::block::VoxelBlock::Float32($body),
        }
    };
}

impl VoxelBlock {
    /// Zero-filled block; `size` is `[x, y, z]`
    pub fn zeros(data_type: DataType, num_channels: usize, size: [usize; 3]) -> Self {
        let shape = (num_channels, size[2], size[1], size[0]);
        match data_type {
            DataType::Uint8 => VoxelBlock::Uint8(Array4::zeros(shape)),
            DataType::Uint16 => VoxelBlock::Uint16(Array4::zeros(shape)),
            DataType::Uint32 => VoxelBlock::Uint32(Array4::zeros(shape)),
            DataType::Uint64 => VoxelBlock::Uint64(Array4::zeros(shape)),
            DataType::Float32 => VoxelBlock::Float32(Array4::zeros(shape)),
        }
    }

    /// Wrap a typed array
    pub fn from_array<T: Sample>(array: Array4<T>) -> Self {
        T::into_block(array)
    }

    /// Borrow the typed array, `None` if the scalar type differs
    pub fn as_array<T: Sample>(&self) -> Option<&Array4<T>> {
        T::as_array(self)
    }

    /// Scalar type of the block
    pub fn data_type(&self) -> DataType {
        match self {
            VoxelBlock::Uint8(_) => DataType::Uint8,
            VoxelBlock::Uint16(_) => DataType::Uint16,
            VoxelBlock::Uint32(_) => DataType::Uint32,
            VoxelBlock::Uint64(_) => DataType::Uint64,
            VoxelBlock::Float32(_) => DataType::Float32,
        }
    }

    /// Shape as `[channels, z, y, x]`
    pub fn shape(&self) -> [usize; 4] {
        with_block!(self, arr => {
            let (c, z, y, x) = arr.dim();
            [c, z, y, x]
        })
    }

    /// Number of channels
    pub fn num_channels(&self) -> usize {
        self.shape()[0]
    }

    /// Spatial size as `[x, y, z]`
    pub fn size(&self) -> [usize; 3] {
        let [_, z, y, x] = self.shape();
        [x, y, z]
    }

    /// Total number of scalar values
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// True if the block holds no voxel
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize with X fastest, then Y, Z and channel slowest, little-endian
    pub fn to_le_bytes(&self) -> Vec<u8> {
        with_block!(self, arr => to_le_bytes(arr))
    }

    /// Inverse of [`VoxelBlock::to_le_bytes`]
    pub fn from_le_bytes(
        data_type: DataType,
        num_channels: usize,
        size: [usize; 3],
        bytes: &[u8],
    ) -> Result<Self> {
        match data_type {
            DataType::Uint8 => from_le_bytes::<u8>(num_channels, size, bytes).map(Self::from_array),
            DataType::Uint16 => {
                from_le_bytes::<u16>(num_channels, size, bytes).map(Self::from_array)
            }
            DataType::Uint32 => {
                from_le_bytes::<u32>(num_channels, size, bytes).map(Self::from_array)
            }
            DataType::Uint64 => {
                from_le_bytes::<u64>(num_channels, size, bytes).map(Self::from_array)
            }
            DataType::Float32 => {
                from_le_bytes::<f32>(num_channels, size, bytes).map(Self::from_array)
            }
        }
    }

    /// Copy out the sub-block at `origin` (`[x, y, z]`) with extent `size`
    pub fn subblock(&self, origin: [usize; 3], size: [usize; 3]) -> Result<Self> {
        let own = self.size();
        for axis in 0..3 {
            if origin[axis] + size[axis] > own[axis] {
                return Err(PrecomputedError::Data(format!(
                    "sub-block {:?}+{:?} exceeds block size {:?}",
                    origin, size, own
                )));
            }
        }
        Ok(map_block!(self, arr => arr
            .slice(s![
                ..,
                origin[2]..origin[2] + size[2],
                origin[1]..origin[1] + size[1],
                origin[0]..origin[0] + size[0]
            ])
            .to_owned()))
    }

    /// Overwrite the region at `origin` (`[x, y, z]`) with the content of `source`
    pub fn paste(&mut self, origin: [usize; 3], source: &VoxelBlock) -> Result<()> {
        if source.data_type() != self.data_type() || source.num_channels() != self.num_channels()
        {
            return Err(PrecomputedError::Data(format!(
                "cannot paste {} block with {} channels into {} block with {} channels",
                source.data_type(),
                source.num_channels(),
                self.data_type(),
                self.num_channels()
            )));
        }
        let own = self.size();
        let size = source.size();
        for axis in 0..3 {
            if origin[axis] + size[axis] > own[axis] {
                return Err(PrecomputedError::Data(format!(
                    "pasted region {:?}+{:?} exceeds block size {:?}",
                    origin, size, own
                )));
            }
        }
        fn paste_typed<T: Sample>(dst: &mut Array4<T>, origin: [usize; 3], src: &Array4<T>) {
            let (_, sz, sy, sx) = src.dim();
            dst.slice_mut(s![
                ..,
                origin[2]..origin[2] + sz,
                origin[1]..origin[1] + sy,
                origin[0]..origin[0] + sx
            ])
            .assign(src);
        }
        match (self, source) {
            (VoxelBlock::Uint8(dst), VoxelBlock::Uint8(src)) => paste_typed(dst, origin, src),
            (VoxelBlock::Uint16(dst), VoxelBlock::Uint16(src)) => paste_typed(dst, origin, src),
            (VoxelBlock::Uint32(dst), VoxelBlock::Uint32(src)) => paste_typed(dst, origin, src),
            (VoxelBlock::Uint64(dst), VoxelBlock::Uint64(src)) => paste_typed(dst, origin, src),
            (VoxelBlock::Float32(dst), VoxelBlock::Float32(src)) => paste_typed(dst, origin, src),
            _ => unreachable!("data types checked above"),
        }
        Ok(())
    }
}

fn to_le_bytes<T: Sample>(array: &Array4<T>) -> Vec<u8> {
    let mut out = Vec::with_capacity(array.len() * T::DATA_TYPE.size_in_bytes());
    for &value in array.iter() {
        value.extend_le(&mut out);
    }
    out
}

fn from_le_bytes<T: Sample>(
    num_channels: usize,
    size: [usize; 3],
    bytes: &[u8],
) -> Result<Array4<T>> {
    let item = T::DATA_TYPE.size_in_bytes();
    let expected = num_channels * size[0] * size[1] * size[2] * item;
    if bytes.len() != expected {
        return Err(PrecomputedError::Data(format!(
            "expected {} bytes for a {}x{}x{}x{} {} block, got {}",
            expected,
            num_channels,
            size[2],
            size[1],
            size[0],
            T::DATA_TYPE,
            bytes.len()
        )));
    }
    let values: Vec<T> = bytes.chunks_exact(item).map(T::from_le_slice).collect();
    Array4::from_shape_vec((num_channels, size[2], size[1], size[0]), values)
        .map_err(|e| PrecomputedError::Data(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_order_is_x_fastest() {
        let arr = Array4::from_shape_vec((1, 1, 2, 2), vec![1u16, 2, 3, 4]).unwrap();
        let block = VoxelBlock::from_array(arr);
        assert_eq!(block.size(), [2, 2, 1]);
        assert_eq!(block.to_le_bytes(), vec![1, 0, 2, 0, 3, 0, 4, 0]);
    }

    #[test]
    fn test_from_le_bytes_length_mismatch() {
        let err = VoxelBlock::from_le_bytes(DataType::Uint32, 1, [2, 2, 2], &[0u8; 31]);
        assert!(matches!(err, Err(PrecomputedError::Data(_))));
    }

    #[test]
    fn test_subblock_and_paste() {
        let arr = Array4::from_shape_fn((1, 4, 4, 4), |(_, z, y, x)| (x + 4 * y + 16 * z) as u8);
        let block = VoxelBlock::from_array(arr);
        let sub = block.subblock([1, 2, 3], [2, 2, 1]).unwrap();
        assert_eq!(sub.size(), [2, 2, 1]);
        assert_eq!(sub.to_le_bytes(), vec![57, 58, 61, 62]);

        let mut target = VoxelBlock::zeros(DataType::Uint8, 1, [4, 4, 4]);
        target.paste([1, 2, 3], &sub).unwrap();
        assert_eq!(target.subblock([1, 2, 3], [2, 2, 1]).unwrap(), sub);
        assert!(target.paste([3, 3, 3], &sub).is_err());
    }

    #[test]
    fn test_mean_rounds_half_up() {
        assert_eq!(u8::mean(&[1, 2], 0.0, 0), 2);
        assert_eq!(u8::mean(&[1, 1, 1, 0], 0.0, 0), 1);
        assert_eq!(u16::mean(&[0, 1, 1, 1], 0.0, 0), 1);
        assert_eq!(u8::mean(&[255; 8], 0.0, 0), 255);
        assert_eq!(u64::mean(&[u64::MAX; 8], 0.0, 0), u64::MAX);
        assert_eq!(u8::mean(&[200], 300.0, 1), 250);
        assert_eq!(u8::mean(&[], 7.0, 0), 7);
        assert_eq!(f32::mean(&[1.0, 2.0], 0.0, 0), 1.5);
    }

    #[test]
    fn test_rounded_conversion_clamps() {
        assert_eq!(u8::from_f64_rounded(-3.0), 0);
        assert_eq!(u8::from_f64_rounded(1000.0), 255);
        assert_eq!(u16::from_f64_rounded(2.5), 3);
        assert_eq!(u32::from_f64_rounded(f64::NAN), 0);
        assert_eq!(u32::from_f64_rounded(4_294_967_295.4), u32::MAX);
        assert_eq!(u64::from_f64_rounded(1e30), u64::MAX);
        assert_eq!(u16::from_f64_rounded(65_534.4), 65_534);
    }
}
