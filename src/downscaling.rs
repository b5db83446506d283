//! Downscaling algorithms used to build the lower-resolution levels
//!
//! Use [`get_downscaler`] to instantiate a concrete downscaler.

use crate::block::{Sample, VoxelBlock};
use crate::error::{PrecomputedError, Result};
use crate::map_block;
use crate::types::VolumeType;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Downscaling methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownscalingMethod {
    /// `average` for images, `stride` for segmentations
    #[default]
    Auto,
    /// Mean of the samples, for grey-level images
    Average,
    /// Most frequent sample, for label images
    Majority,
    /// Corner sample, fastest with no anti-aliasing
    Stride,
}

impl DownscalingMethod {
    /// Resolve `Auto` and reject combinations that would corrupt labels
    pub fn resolve(self, volume_type: VolumeType) -> Result<DownscalingMethod> {
        match (self, volume_type) {
            (DownscalingMethod::Auto, VolumeType::Image) => Ok(DownscalingMethod::Average),
            (DownscalingMethod::Auto, VolumeType::Segmentation) => Ok(DownscalingMethod::Stride),
            (DownscalingMethod::Average, VolumeType::Segmentation) => Err(PrecomputedError::Config(
                "average downscaling would mix labels of a segmentation volume, \
                 use majority or stride"
                    .into(),
            )),
            (method, _) => Ok(method),
        }
    }
}

impl fmt::Display for DownscalingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownscalingMethod::Auto => "auto",
            DownscalingMethod::Average => "average",
            DownscalingMethod::Majority => "majority",
            DownscalingMethod::Stride => "stride",
        };
        f.write_str(name)
    }
}

impl FromStr for DownscalingMethod {
    type Err = PrecomputedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(DownscalingMethod::Auto),
            "average" => Ok(DownscalingMethod::Average),
            "majority" => Ok(DownscalingMethod::Majority),
            "stride" => Ok(DownscalingMethod::Stride),
            other => Err(PrecomputedError::Config(format!(
                "invalid downscaling method {:?}",
                other
            ))),
        }
    }
}

/// Trait for downscaling operations
pub trait Downscaler: Send + Sync {
    /// Reduce `block` by `factors` (`[x, y, z]`); output size is `ceil(size / factor)`
    fn downscale(&self, block: &VoxelBlock, factors: [usize; 3]) -> Result<VoxelBlock>;

    /// Get the method implemented
    fn method(&self) -> DownscalingMethod;
}

fn check_dyadic_factors(factors: [usize; 3]) -> Result<()> {
    if factors.iter().all(|&f| f == 1 || f == 2) {
        Ok(())
    } else {
        Err(PrecomputedError::Config(format!(
            "downscaling factors {:?} must each be 1 or 2",
            factors
        )))
    }
}

fn output_shape(dim: (usize, usize, usize, usize), factors: [usize; 3]) -> (usize, usize, usize, usize) {
    let (c, z, y, x) = dim;
    (
        c,
        z.div_ceil(factors[2]),
        y.div_ceil(factors[1]),
        x.div_ceil(factors[0]),
    )
}

/// Apply `reduce` to the in-range samples of every output voxel
///
/// Samples are gathered in increasing `(z, y, x)` order; `reduce` also gets
/// the number of samples that fell outside the source block.
fn reduce_dyadic<T, F>(source: &Array4<T>, factors: [usize; 3], reduce: F) -> Array4<T>
where
    T: Sample,
    F: Fn(&[T], usize) -> T,
{
    let dim = source.dim();
    let (_, sz, sy, sx) = dim;
    let per_voxel = factors[0] * factors[1] * factors[2];
    let mut buf = [T::default(); 8];
    let mut out = Array4::from_elem(output_shape(dim, factors), T::default());
    for ((c, z, y, x), value) in out.indexed_iter_mut() {
        let mut n = 0;
        for dz in 0..factors[2] {
            let zs = z * factors[2] + dz;
            if zs >= sz {
                continue;
            }
            for dy in 0..factors[1] {
                let ys = y * factors[1] + dy;
                if ys >= sy {
                    continue;
                }
                for dx in 0..factors[0] {
                    let xs = x * factors[0] + dx;
                    if xs >= sx {
                        continue;
                    }
                    buf[n] = source[[c, zs, ys, xs]];
                    n += 1;
                }
            }
        }
        *value = reduce(&buf[..n], per_voxel - n);
    }
    out
}

/// Most frequent value; ties go to the value seen first
fn most_frequent<T: Sample>(samples: &[T]) -> T {
    let mut best = samples.first().copied().unwrap_or_default();
    let mut best_count = 0;
    for (i, &candidate) in samples.iter().enumerate() {
        if samples[..i].contains(&candidate) {
            continue;
        }
        let count = samples[i..].iter().filter(|&&s| s == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

/// Downscale by a factor of two along chosen axes, with averaging
///
/// With no `outside_value`, samples beyond the block edge are left out of the
/// mean (equivalent to edge padding). Otherwise they count as `outside_value`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AveragingDownscaler {
    outside_value: Option<f64>,
}

impl AveragingDownscaler {
    pub fn new(outside_value: Option<f64>) -> Self {
        Self { outside_value }
    }
}

impl Downscaler for AveragingDownscaler {
    fn downscale(&self, block: &VoxelBlock, factors: [usize; 3]) -> Result<VoxelBlock> {
        check_dyadic_factors(factors)?;
        fn average<T: Sample>(arr: &Array4<T>, factors: [usize; 3], outside: Option<f64>) -> Array4<T> {
            match outside {
                None => reduce_dyadic(arr, factors, |samples, _| T::mean(samples, 0.0, 0)),
                Some(pad) => reduce_dyadic(arr, factors, |samples, missing| {
                    T::mean(samples, pad, missing)
                }),
            }
        }
        let outside = self.outside_value;
        Ok(map_block!(block, arr => average(arr, factors, outside)))
    }

    fn method(&self) -> DownscalingMethod {
        DownscalingMethod::Average
    }
}

/// Downscale by majority voting, suitable for label images
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityDownscaler;

impl Downscaler for MajorityDownscaler {
    fn downscale(&self, block: &VoxelBlock, factors: [usize; 3]) -> Result<VoxelBlock> {
        check_dyadic_factors(factors)?;
        Ok(map_block!(block, arr => reduce_dyadic(arr, factors, |samples, _| most_frequent(samples))))
    }

    fn method(&self) -> DownscalingMethod {
        DownscalingMethod::Majority
    }
}

/// Downscale by keeping the lowest-coordinate sample; any factor >= 1
#[derive(Debug, Clone, Copy, Default)]
pub struct StridingDownscaler;

impl Downscaler for StridingDownscaler {
    fn downscale(&self, block: &VoxelBlock, factors: [usize; 3]) -> Result<VoxelBlock> {
        if factors.iter().any(|&f| f == 0) {
            return Err(PrecomputedError::Config(format!(
                "downscaling factors {:?} must be >= 1",
                factors
            )));
        }
        Ok(map_block!(block, arr => {
            Array4::from_shape_fn(output_shape(arr.dim(), factors), |(c, z, y, x)| {
                arr[[c, z * factors[2], y * factors[1], x * factors[0]]]
            })
        }))
    }

    fn method(&self) -> DownscalingMethod {
        DownscalingMethod::Stride
    }
}

/// Get a downscaler, resolving `Auto` against the volume type
pub fn get_downscaler(
    method: DownscalingMethod,
    volume_type: VolumeType,
    outside_value: Option<f64>,
) -> Result<Box<dyn Downscaler>> {
    match method.resolve(volume_type)? {
        DownscalingMethod::Average => Ok(Box::new(AveragingDownscaler::new(outside_value))),
        DownscalingMethod::Majority => Ok(Box::new(MajorityDownscaler)),
        DownscalingMethod::Stride | DownscalingMethod::Auto => Ok(Box::new(StridingDownscaler)),
    }
}
