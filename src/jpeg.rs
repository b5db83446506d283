//! Lossy JPEG chunk encoding
//!
//! A chunk is flattened into one 2D image: `xy` stacks the Z*Y rows of X
//! voxels, `xz` lays each Z slice out as a single row, and `yz` stacks Z*X
//! rows of Y voxels. Three-channel chunks become RGB images.

use crate::block::VoxelBlock;
use crate::error::{PrecomputedError, Result};
use crate::types::{DataType, JpegPlane};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageFormat};
use ndarray::Array4;
use tracing::warn;

/// Image `(width, height)` of a chunk of `size` (`[x, y, z]`)
pub fn image_dimensions(size: [usize; 3], plane: JpegPlane) -> (usize, usize) {
    let [x, y, z] = size;
    match plane {
        JpegPlane::Xy => (x, z * y),
        JpegPlane::Xz => (y * x, z),
        JpegPlane::Yz => (y, z * x),
    }
}

/// Pixel of voxel `(z, y, x)`, as an index into the row-major image
fn pixel_index(size: [usize; 3], plane: JpegPlane, z: usize, y: usize, x: usize) -> usize {
    let [sx, sy, _] = size;
    match plane {
        // same order as the voxels themselves
        JpegPlane::Xy | JpegPlane::Xz => (z * sy + y) * sx + x,
        JpegPlane::Yz => (z * sx + x) * sy + y,
    }
}

fn check_channels(num_channels: usize) -> Result<ExtendedColorType> {
    match num_channels {
        1 => Ok(ExtendedColorType::L8),
        3 => Ok(ExtendedColorType::Rgb8),
        n => Err(PrecomputedError::Encoding(format!(
            "jpeg needs 1 or 3 channels, got {}",
            n
        ))),
    }
}

/// Encode a uint8 `(channel, z, y, x)` array
pub fn encode(array: &Array4<u8>, quality: u8, plane: JpegPlane) -> Result<Vec<u8>> {
    let (channels, sz, sy, sx) = array.dim();
    let color = check_channels(channels)?;
    let size = [sx, sy, sz];
    let (width, height) = image_dimensions(size, plane);
    let (width, height) = match (u16::try_from(width), u16::try_from(height)) {
        (Ok(w), Ok(h)) => (w as u32, h as u32),
        _ => {
            return Err(PrecomputedError::Encoding(format!(
                "chunk {:?} flattens to a {}x{} image, larger than jpeg allows",
                size, width, height
            )))
        }
    };

    let mut pixels = vec![0u8; array.len()];
    for ((c, z, y, x), &value) in array.indexed_iter() {
        pixels[pixel_index(size, plane, z, y, x) * channels + c] = value;
    }

    let quality = if quality == 0 {
        warn!("jpeg quality 0 is not supported, using 1");
        1
    } else {
        quality.min(100)
    };
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(&pixels, width, height, color)
        .map_err(|e| PrecomputedError::Encoding(format!("jpeg encoding failed: {}", e)))?;
    Ok(out)
}

/// Decode into a `(channel, z, y, x)` array of `size` (`[x, y, z]`)
pub fn decode(bytes: &[u8], num_channels: usize, size: [usize; 3], plane: JpegPlane) -> Result<Array4<u8>> {
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
        .map_err(|e| PrecomputedError::Data(format!("invalid jpeg chunk: {}", e)))?;
    let (width, height) = (image.width() as usize, image.height() as usize);
    let expected = image_dimensions(size, plane);
    // xy and xz share the voxel pixel order, so only the pixel count matters
    let fits = match plane {
        JpegPlane::Xy | JpegPlane::Xz => width * height == size.iter().product::<usize>(),
        JpegPlane::Yz => (width, height) == expected,
    };
    if !fits {
        return Err(PrecomputedError::Data(format!(
            "jpeg chunk is {}x{}, expected {}x{} for chunk {:?}",
            width, height, expected.0, expected.1, size
        )));
    }
    let pixels = match (num_channels, image) {
        (1, DynamicImage::ImageLuma8(img)) => img.into_raw(),
        (3, DynamicImage::ImageRgb8(img)) => img.into_raw(),
        (n, other) => {
            return Err(PrecomputedError::Data(format!(
                "jpeg chunk has color type {:?}, cannot produce {} channels",
                other.color(),
                n
            )))
        }
    };
    let [sx, sy, sz] = size;
    Ok(Array4::from_shape_fn((num_channels, sz, sy, sx), |(c, z, y, x)| {
        pixels[pixel_index(size, plane, z, y, x) * num_channels + c]
    }))
}

/// `jpeg` chunk codec of one scale level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegCodec {
    pub num_channels: usize,
    pub quality: u8,
    pub plane: JpegPlane,
}

impl JpegCodec {
    pub fn new(data_type: DataType, num_channels: usize, quality: u8, plane: JpegPlane) -> Result<Self> {
        if data_type != DataType::Uint8 {
            return Err(PrecomputedError::Encoding(format!(
                "jpeg needs uint8 data, not {}",
                data_type
            )));
        }
        check_channels(num_channels)?;
        Ok(Self {
            num_channels,
            quality,
            plane,
        })
    }

    pub fn encode(&self, block: &VoxelBlock) -> Result<Vec<u8>> {
        let array = block.as_array::<u8>().ok_or_else(|| {
            PrecomputedError::Encoding(format!(
                "cannot encode a {} block as jpeg",
                block.data_type()
            ))
        })?;
        if block.num_channels() != self.num_channels {
            return Err(PrecomputedError::Encoding(format!(
                "block has {} channels, the level declares {}",
                block.num_channels(),
                self.num_channels
            )));
        }
        encode(array, self.quality, self.plane)
    }

    pub fn decode(&self, bytes: &[u8], size: [usize; 3]) -> Result<VoxelBlock> {
        decode(bytes, self.num_channels, size, self.plane).map(VoxelBlock::from_array)
    }
}
