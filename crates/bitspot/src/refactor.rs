//! Per-bit scale and background estimation from decoded regions.
//!
//! One pass over a decoded plane collects well-formed spot regions per
//! barcode, reduces each region to a per-bit trace, and aggregates the traces
//! into per-bit scale refactors (and, optionally, background floors). The
//! estimates feed an external calibration loop that re-decodes with updated
//! vectors; nothing here iterates. Bits without any contributing barcode stay
//! NaN on purpose so the caller can see where calibration data is missing.

use ndarray::{Array1, Array2};
use tracing::warn;

use crate::decode::{DecodedImages, DecodedPlane};
use crate::extract::{connected_regions, ExtractError, ImageCube};
use crate::matrix::DecodingMatrix;

// ── Configuration ──────────────────────────────────────────────────────────

/// Estimation parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RefactorConfig {
    /// Smallest region (in pixels) trusted for estimation; smaller regions
    /// are noise-dominated. Default: [`RefactorConfig::DEFAULT_AREA_THRESHOLD`].
    #[serde(default = "RefactorConfig::default_area_threshold")]
    pub area_threshold: usize,
    /// Also estimate per-bit backgrounds from off-bit minima and subtract
    /// them before computing scales.
    #[serde(default)]
    pub extract_backgrounds: bool,
}

impl RefactorConfig {
    pub const DEFAULT_AREA_THRESHOLD: usize = 4;

    fn default_area_threshold() -> usize {
        Self::DEFAULT_AREA_THRESHOLD
    }
}

impl Default for RefactorConfig {
    fn default() -> Self {
        Self {
            area_threshold: Self::DEFAULT_AREA_THRESHOLD,
            extract_backgrounds: false,
        }
    }
}

// ── Estimate ───────────────────────────────────────────────────────────────

/// Outcome of one estimation pass.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RefactorEstimate {
    /// Per-bit multiplicative scale refactors, normalized so the mean over
    /// bits with data is 1; NaN where no barcode contributed.
    pub scale_factors: Array1<f64>,
    /// Per-bit additive background floors; all zeros unless requested.
    pub backgrounds: Array1<f64>,
    /// Qualifying-region count per matrix row; the caller's reliability
    /// signal for the estimate.
    pub barcodes_seen: Vec<usize>,
}

// ── Estimation pass ────────────────────────────────────────────────────────

fn nan_mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        if !value.is_nan() {
            sum += value;
            count += 1;
        }
    }
    if count > 0 {
        sum / count as f64
    } else {
        f64::NAN
    }
}

fn qualifying_regions(
    cube: &ImageCube<'_>,
    barcode: usize,
    area_threshold: usize,
) -> Vec<Vec<[usize; 3]>> {
    let Ok(target) = i32::try_from(barcode) else {
        return Vec::new();
    };
    connected_regions(cube, target)
        .into_iter()
        .filter(|coords| coords.len() >= area_threshold)
        .collect()
}

/// Mean over region pixels of trace × magnitude, per bit.
fn region_mean_trace(cube: &ImageCube<'_>, coords: &[[usize; 3]]) -> Array1<f64> {
    let mut trace = Array1::<f64>::zeros(cube.bits);
    for &[z, row, col] in coords {
        let magnitude = f64::from(cube.magnitude(z, row, col));
        for (bit, slot) in trace.iter_mut().enumerate() {
            *slot += f64::from(cube.trace(z, bit, row, col)) * magnitude;
        }
    }
    trace.mapv_inplace(|v| v / coords.len() as f64);
    trace
}

/// Minimum over region pixels of trace × magnitude, per bit.
fn region_min_trace(cube: &ImageCube<'_>, coords: &[[usize; 3]]) -> Array1<f64> {
    let mut trace = Array1::from_elem(cube.bits, f64::INFINITY);
    for &[z, row, col] in coords {
        let magnitude = f64::from(cube.magnitude(z, row, col));
        for (bit, slot) in trace.iter_mut().enumerate() {
            *slot = slot.min(f64::from(cube.trace(z, bit, row, col)) * magnitude);
        }
    }
    trace
}

/// Per-bit background floor from off-bit region minima.
///
/// Each bit averages the region-minimum products of barcodes that are off at
/// that bit, weighted by region count; a bit with no off-bit regions stays
/// NaN.
fn estimate_backgrounds(
    matrix: &DecodingMatrix,
    cube: &ImageCube<'_>,
    config: &RefactorConfig,
) -> Array1<f64> {
    let barcode_count = matrix.barcode_count();
    let bit_count = matrix.bit_count();
    let mut min_sums = Array2::<f64>::zeros((barcode_count, bit_count));
    let mut seen = vec![0usize; barcode_count];

    for barcode in 0..barcode_count {
        let regions = qualifying_regions(cube, barcode, config.area_threshold);
        seen[barcode] = regions.len();
        for coords in &regions {
            let minima = region_min_trace(cube, coords);
            let mut row = min_sums.row_mut(barcode);
            row += &minima;
        }
    }

    Array1::from_iter((0..bit_count).map(|bit| {
        let mut total = 0.0;
        let mut count = 0usize;
        for barcode in 0..barcode_count {
            if !matrix.is_on_bit(barcode, bit) {
                total += min_sums[[barcode, bit]];
                count += seen[barcode];
            }
        }
        if count > 0 {
            total / count as f64
        } else {
            f64::NAN
        }
    }))
}

/// Estimate per-bit scale (and optional background) refactors from one
/// decoded plane.
pub(crate) fn extract_refactors(
    matrix: &DecodingMatrix,
    plane: &DecodedPlane,
    config: &RefactorConfig,
) -> Result<RefactorEstimate, ExtractError> {
    let bit_count = matrix.bit_count();
    if plane.bit_count() != bit_count {
        return Err(ExtractError::BitCount {
            expected: bit_count,
            got: plane.bit_count(),
        });
    }
    let cube = ImageCube::new(DecodedImages::Plane(plane))?;

    let backgrounds = if config.extract_backgrounds {
        estimate_backgrounds(matrix, &cube, config)
    } else {
        Array1::zeros(bit_count)
    };

    let barcode_count = matrix.barcode_count();
    let mut mean_traces = Array2::from_elem((barcode_count, bit_count), f64::NAN);
    let mut barcodes_seen = vec![0usize; barcode_count];

    for barcode in 0..barcode_count {
        let regions = qualifying_regions(&cube, barcode, config.area_threshold);
        barcodes_seen[barcode] = regions.len();
        if regions.is_empty() {
            continue;
        }
        let mut accumulated = Array1::<f64>::zeros(bit_count);
        for coords in &regions {
            let mut trace = region_mean_trace(&cube, coords);
            trace -= &backgrounds;
            let norm = trace.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                trace.mapv_inplace(|v| v / norm);
            }
            accumulated += &trace;
        }
        accumulated.mapv_inplace(|v| v / regions.len() as f64);
        mean_traces.row_mut(barcode).assign(&accumulated);
    }

    // A barcode says nothing about bits it is off at.
    for barcode in 0..barcode_count {
        for bit in 0..bit_count {
            if !matrix.is_on_bit(barcode, bit) {
                mean_traces[[barcode, bit]] = f64::NAN;
            }
        }
    }

    let on_bit_intensity = Array1::from_iter(
        (0..bit_count).map(|bit| nan_mean(mean_traces.column(bit).iter().copied())),
    );
    let denominator = nan_mean(on_bit_intensity.iter().copied());
    let scale_factors = on_bit_intensity.mapv(|v| v / denominator);

    let missing = scale_factors.iter().filter(|v| v.is_nan()).count();
    if missing > 0 {
        warn!(
            "scale refactors left {} of {} bits without data",
            missing, bit_count
        );
    }

    Ok(RefactorEstimate {
        scale_factors,
        backgrounds,
        barcodes_seen,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────
