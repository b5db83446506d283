//! Utility functions

use crate::error::{PrecomputedError, Result};

/// Ceil integer division
pub fn ceil_div(a: u64, b: u64) -> u64 {
    if a == 0 {
        0
    } else {
        (a - 1) / b + 1
    }
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

const IEC_PREFIXES: &[(u64, &str)] = &[
    (1 << 10, "ki"),
    (1 << 20, "Mi"),
    (1 << 30, "Gi"),
    (1 << 40, "Ti"),
    (1 << 50, "Pi"),
    (1 << 60, "Ei"),
];

/// Short count with an IEC binary prefix, at most 3 digits before the prefix
///
/// Concatenate the unit yourself: `readable_count(1e10 as u64) + "B"` gives `"9.3 GiB"`.
pub fn readable_count(count: u64) -> String {
    let plain = count.to_string();
    if plain.len() <= 3 {
        return plain + " ";
    }
    for &(factor, prefix) in IEC_PREFIXES {
        let scaled = count as f64 / factor as f64;
        let num = if count > 10 * factor {
            format!("{:.0}", scaled)
        } else {
            format!("{:.1}", scaled)
        };
        if num.len() <= 3 {
            return format!("{} {}", num, prefix);
        }
    }
    let (factor, prefix) = IEC_PREFIXES[IEC_PREFIXES.len() - 1];
    format!("{:.0} {}", count as f64 / factor as f64, prefix)
}

/// Units of length with their multiplier from nanometres, coarsest first
pub const LENGTH_UNITS: &[(&str, f64)] = &[
    ("km", 1e-12),
    ("m", 1e-9),
    ("mm", 1e-6),
    ("um", 1e-3),
    ("nm", 1.0),
    ("pm", 1e3),
];

/// Format a length given in nanometres, rounded to a whole number of `unit`
pub fn format_length(length_nm: f64, unit: &str) -> Result<String> {
    let factor = LENGTH_UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, factor)| *factor)
        .ok_or_else(|| PrecomputedError::Config(format!("unknown length unit {:?}", unit)))?;
    Ok(format!("{:.0}{}", length_nm * factor, unit))
}

/// Coarsest unit in which `resolution_nm` and its double format differently
pub fn choose_unit_for_key(resolution_nm: f64) -> Result<&'static str> {
    for &(unit, factor) in LENGTH_UNITS {
        if (resolution_nm * factor).round() != 0.0
            && format_length(resolution_nm, unit)? != format_length(resolution_nm * 2.0, unit)?
        {
            return Ok(unit);
        }
    }
    Err(PrecomputedError::Config(format!(
        "cannot find a suitable unit for {} nm",
        resolution_nm
    )))
}
