//! Dyadic pyramid planning
//!
//! The planner only derives geometry: sizes, resolutions, chunk sizes and
//! keys of every level. No voxel is read here.
//!
//! A "level" counts downscaling steps from the full resolution. Anisotropic
//! volumes delay the halving of their coarse axes until voxels are as close
//! to isotropic as possible.

use crate::config::PyramidOptions;
use crate::downscaling::DownscalingMethod;
use crate::error::{PrecomputedError, Result};
use crate::layout::ScaleLevel;
use crate::metadata::Info;
use crate::utils::{ceil_div, choose_unit_for_key, format_length};
use tracing::warn;

/// Per-axis number of levels before the axis starts halving
pub fn axis_level_delays(resolution: [f64; 3]) -> [u32; 3] {
    let best = resolution.iter().copied().fold(f64::INFINITY, f64::min);
    resolution.map(|r| (r / best).log2().round().max(0.0) as u32)
}

/// Downscaling factor of each axis at `level`, relative to the base
pub fn level_factors(delays: [u32; 3], level: u32) -> [u64; 3] {
    delays.map(|d| 1u64 << level.saturating_sub(d).min(63))
}

/// Chunk size of `level`: about `target^3` voxels, shaped to offset residual anisotropy
pub fn level_chunk_size(delays: [u32; 3], level: u32, target_exponent: u32) -> [u64; 3] {
    let max_delay = delays.iter().copied().max().unwrap_or(0) as i64;
    let aniso = delays.map(|d| (max_delay - d as i64 - level as i64).max(0));
    let sum: i64 = aniso.iter().sum();
    let base = target_exponent as i64 - (sum + 1) / 3;
    aniso.map(|a| 1u64 << (base + a).clamp(0, 62))
}

/// Build every level of a dyadic pyramid from a full-resolution level
///
/// Chunk sizes of all levels, the base included, are derived from
/// `options.target_chunk_size`. Planning stops after `max_scales` levels,
/// once a level is a single voxel, or (opt-in) once a level fits in a
/// single chunk.
pub fn compute_dyadic_scales(base: &ScaleLevel, options: &PyramidOptions) -> Result<Vec<ScaleLevel>> {
    options.validate()?;
    if base.size.iter().any(|&s| s == 0) {
        return Err(PrecomputedError::Config(format!(
            "base level {} has size {:?}, every axis must be positive",
            base.key, base.size
        )));
    }
    if base.resolution.iter().any(|r| !(r.is_finite() && *r > 0.0)) {
        return Err(PrecomputedError::Config(format!(
            "base level {} has resolution {:?}, every axis must be positive",
            base.key, base.resolution
        )));
    }

    let target_exponent = options.target_chunk_size.trailing_zeros();
    let delays = axis_level_delays(base.resolution);
    let best_resolution = base.resolution.iter().copied().fold(f64::INFINITY, f64::min);
    let key_unit = choose_unit_for_key(best_resolution)?;
    let max_levels = options.max_scales.unwrap_or(usize::MAX);

    let mut levels: Vec<ScaleLevel> = Vec::new();
    let mut level = 0u32;
    while levels.len() < max_levels {
        if let Some(previous) = levels.last() {
            if previous.size.iter().all(|&s| s == 1) {
                break;
            }
            if options.stop_at_single_chunk && previous.num_chunks() == 1 {
                break;
            }
        }

        let factors = level_factors(delays, level);
        let mut scale = base.clone();
        for axis in 0..3 {
            scale.size[axis] = ceil_div(base.size[axis], factors[axis]);
            scale.resolution[axis] = base.resolution[axis] * factors[axis] as f64;
            scale.voxel_offset[axis] = base.voxel_offset[axis] / factors[axis];
        }
        let finest = scale.resolution.iter().copied().fold(f64::INFINITY, f64::min);
        scale.key = format_length(finest, key_unit)?;
        scale.chunk_size = level_chunk_size(delays, level, target_exponent);
        scale.sharding = match &options.sharding {
            Some(policy) => Some(policy.spec_for_grid(scale.grid_shape())?),
            None => base.sharding.clone(),
        };
        scale.validate()?;
        levels.push(scale);
        level += 1;
    }
    Ok(levels)
}

/// Fill the scales of `info` from its first scale
///
/// Fails before touching anything if `method` would mix segmentation labels.
pub fn plan_pyramid(info: &Info, options: &PyramidOptions, method: DownscalingMethod) -> Result<Info> {
    method.resolve(info.volume_type)?;
    let first = info
        .scales
        .first()
        .ok_or_else(|| PrecomputedError::Config("info has no scales to start from".into()))?;
    if info.scales.len() > 1 {
        warn!(
            scales = info.scales.len(),
            "info contains multiple scales, only the first one ({}) is used",
            first.key
        );
    }
    let base = ScaleLevel::try_from(first)?;
    let levels = compute_dyadic_scales(&base, options)?;
    let mut planned = info.clone();
    planned.set_levels(&levels);
    planned.validate()?;
    Ok(planned)
}
