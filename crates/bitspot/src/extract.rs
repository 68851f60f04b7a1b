//! Connected-component spot extraction over decoded images.
//!
//! For one barcode index, same-label pixels are grouped into connected
//! regions (4-connected within a plane, 6-connected across planes) and each
//! region is reduced to one [`BarcodeFeature`] row: magnitude-weighted
//! centroid, intensity and distance statistics, per-bit mean trace, and
//! probability statistics when the decode was scored.

use std::cmp::Ordering;

use tracing::debug;

use crate::aligner::FovAligner;
use crate::decode::DecodedImages;
use crate::{BarcodeFeature, FeatureTable};

/// Guards `log10(0)` in the region log-likelihood score.
const LOG_LIKELIHOOD_EPSILON: f64 = 1e-6;

// ── Error type ─────────────────────────────────────────────────────────────

/// Errors raised before any region work starts.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractError {
    /// Decoded images disagree with the decoder's bit count.
    BitCount {
        /// Bit count K fixed by the decoder.
        expected: usize,
        /// Trace bit axis found in the images.
        got: usize,
    },
    /// Two parallel images disagree on shape.
    ShapeMismatch {
        /// Which image disagrees with the label image.
        image: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BitCount { expected, got } => {
                write!(f, "decoded images carry {} bits, expected {}", got, expected)
            }
            Self::ShapeMismatch {
                image,
                expected,
                got,
            } => write!(
                f,
                "{} image has shape {:?}, expected {:?}",
                image, got, expected
            ),
        }
    }
}

impl std::error::Error for ExtractError {}

// ── Configuration ──────────────────────────────────────────────────────────

/// Per-call extraction parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExtractConfig {
    /// Field-of-view id stamped into every row.
    #[serde(default)]
    pub fov: u32,
    /// Centroids within this many pixels of a lateral image border are
    /// dropped as edge-truncated. Default: [`ExtractConfig::DEFAULT_CROP_WIDTH`].
    #[serde(default = "ExtractConfig::default_crop_width")]
    pub crop_width: usize,
    /// z coordinate recorded for plane-mode centroids.
    #[serde(default)]
    pub z_index: usize,
    /// Minimum region size in pixels.
    /// Default: [`ExtractConfig::DEFAULT_MINIMUM_AREA`].
    #[serde(default = "ExtractConfig::default_minimum_area")]
    pub minimum_area: usize,
    /// Minimum mean region probability; applies only to scored decodes.
    /// Default: [`ExtractConfig::DEFAULT_MINIMUM_PROBABILITY`].
    #[serde(default = "ExtractConfig::default_minimum_probability")]
    pub minimum_probability: f64,
}

impl ExtractConfig {
    pub const DEFAULT_CROP_WIDTH: usize = 0;
    pub const DEFAULT_MINIMUM_AREA: usize = 1;
    pub const DEFAULT_MINIMUM_PROBABILITY: f64 = 0.4;

    fn default_crop_width() -> usize {
        Self::DEFAULT_CROP_WIDTH
    }

    fn default_minimum_area() -> usize {
        Self::DEFAULT_MINIMUM_AREA
    }

    fn default_minimum_probability() -> f64 {
        Self::DEFAULT_MINIMUM_PROBABILITY
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            fov: 0,
            crop_width: Self::DEFAULT_CROP_WIDTH,
            z_index: 0,
            minimum_area: Self::DEFAULT_MINIMUM_AREA,
            minimum_probability: Self::DEFAULT_MINIMUM_PROBABILITY,
        }
    }
}

// ── Image cube ─────────────────────────────────────────────────────────────

/// Uniform (z, row, column) view over plane and volume decode output.
///
/// Construction checks that all parallel images share the label image's
/// shape, so the per-pixel accessors cannot go out of bounds afterwards.
pub(crate) struct ImageCube<'a> {
    pub(crate) planes: usize,
    pub(crate) height: usize,
    pub(crate) width: usize,
    pub(crate) bits: usize,
    images: DecodedImages<'a>,
}

fn ensure_shape(
    image: &'static str,
    expected: &[usize],
    got: &[usize],
) -> Result<(), ExtractError> {
    if expected == got {
        Ok(())
    } else {
        Err(ExtractError::ShapeMismatch {
            image,
            expected: expected.to_vec(),
            got: got.to_vec(),
        })
    }
}

impl<'a> ImageCube<'a> {
    pub(crate) fn new(images: DecodedImages<'a>) -> Result<Self, ExtractError> {
        match images {
            DecodedImages::Plane(plane) => {
                let (height, width) = plane.labels.dim();
                let expected = [height, width];
                let dim = plane.magnitudes.dim();
                ensure_shape("magnitude", &expected, &[dim.0, dim.1])?;
                let dim = plane.distances.dim();
                ensure_shape("distance", &expected, &[dim.0, dim.1])?;
                if let Some(probabilities) = &plane.probabilities {
                    let dim = probabilities.dim();
                    ensure_shape("probability", &expected, &[dim.0, dim.1])?;
                }
                let (bits, rows, cols) = plane.traces.dim();
                ensure_shape("trace", &[bits, height, width], &[bits, rows, cols])?;
                Ok(Self {
                    planes: 1,
                    height,
                    width,
                    bits,
                    images,
                })
            }
            DecodedImages::Volume(volume) => {
                let (planes, height, width) = volume.labels.dim();
                let expected = [planes, height, width];
                let dim = volume.magnitudes.dim();
                ensure_shape("magnitude", &expected, &[dim.0, dim.1, dim.2])?;
                let dim = volume.distances.dim();
                ensure_shape("distance", &expected, &[dim.0, dim.1, dim.2])?;
                if let Some(probabilities) = &volume.probabilities {
                    let dim = probabilities.dim();
                    ensure_shape("probability", &expected, &[dim.0, dim.1, dim.2])?;
                }
                let (t_planes, bits, rows, cols) = volume.traces.dim();
                ensure_shape(
                    "trace",
                    &[planes, bits, height, width],
                    &[t_planes, bits, rows, cols],
                )?;
                Ok(Self {
                    planes,
                    height,
                    width,
                    bits,
                    images,
                })
            }
        }
    }

    pub(crate) fn is_plane(&self) -> bool {
        matches!(self.images, DecodedImages::Plane(_))
    }

    pub(crate) fn has_probabilities(&self) -> bool {
        self.images.has_probabilities()
    }

    pub(crate) fn label(&self, z: usize, row: usize, col: usize) -> i32 {
        match self.images {
            DecodedImages::Plane(plane) => plane.labels[[row, col]],
            DecodedImages::Volume(volume) => volume.labels[[z, row, col]],
        }
    }

    pub(crate) fn magnitude(&self, z: usize, row: usize, col: usize) -> f32 {
        match self.images {
            DecodedImages::Plane(plane) => plane.magnitudes[[row, col]],
            DecodedImages::Volume(volume) => volume.magnitudes[[z, row, col]],
        }
    }

    pub(crate) fn distance(&self, z: usize, row: usize, col: usize) -> f64 {
        match self.images {
            DecodedImages::Plane(plane) => plane.distances[[row, col]],
            DecodedImages::Volume(volume) => volume.distances[[z, row, col]],
        }
    }

    pub(crate) fn probability(&self, z: usize, row: usize, col: usize) -> Option<f64> {
        match self.images {
            DecodedImages::Plane(plane) => plane.probabilities.as_ref().map(|p| p[[row, col]]),
            DecodedImages::Volume(volume) => {
                volume.probabilities.as_ref().map(|p| p[[z, row, col]])
            }
        }
    }

    pub(crate) fn trace(&self, z: usize, bit: usize, row: usize, col: usize) -> f32 {
        match self.images {
            DecodedImages::Plane(plane) => plane.traces[[bit, row, col]],
            DecodedImages::Volume(volume) => volume.traces[[z, bit, row, col]],
        }
    }
}

// ── Connected components ───────────────────────────────────────────────────

/// Disjoint-set forest over provisional region labels; 0 is background.
struct DisjointSet {
    parent: Vec<u32>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new() -> Self {
        Self {
            parent: vec![0],
            rank: vec![0],
        }
    }

    fn len(&self) -> usize {
        self.parent.len()
    }

    fn make_set(&mut self) -> u32 {
        let id = self.parent.len() as u32;
        self.parent.push(id);
        self.rank.push(0);
        id
    }

    fn find(&mut self, id: u32) -> u32 {
        let mut root = id;
        while self.parent[root as usize] != root {
            self.parent[root as usize] = self.parent[self.parent[root as usize] as usize];
            root = self.parent[root as usize];
        }
        root
    }

    fn union(&mut self, a: u32, b: u32) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        match self.rank[root_a as usize].cmp(&self.rank[root_b as usize]) {
            Ordering::Less => self.parent[root_a as usize] = root_b,
            Ordering::Greater => self.parent[root_b as usize] = root_a,
            Ordering::Equal => {
                self.parent[root_a as usize] = root_b;
                self.rank[root_b as usize] += 1;
            }
        }
    }
}

/// Connected regions of pixels whose label equals `target`, as (z, row,
/// column) coordinate lists in scan order. 4-connected laterally, 6-connected
/// across planes; regions come out in first-encounter order.
pub(crate) fn connected_regions(cube: &ImageCube<'_>, target: i32) -> Vec<Vec<[usize; 3]>> {
    let plane_stride = cube.height * cube.width;
    if cube.planes == 0 || plane_stride == 0 {
        return Vec::new();
    }

    let mut provisional = vec![0u32; cube.planes * plane_stride];
    let mut forest = DisjointSet::new();

    for z in 0..cube.planes {
        for row in 0..cube.height {
            for col in 0..cube.width {
                if cube.label(z, row, col) != target {
                    continue;
                }
                let index = z * plane_stride + row * cube.width + col;

                let mut neighbors = [0u32; 3];
                let mut count = 0;
                if col > 0 && provisional[index - 1] != 0 {
                    neighbors[count] = provisional[index - 1];
                    count += 1;
                }
                if row > 0 && provisional[index - cube.width] != 0 {
                    neighbors[count] = provisional[index - cube.width];
                    count += 1;
                }
                if z > 0 && provisional[index - plane_stride] != 0 {
                    neighbors[count] = provisional[index - plane_stride];
                    count += 1;
                }

                provisional[index] = if count == 0 {
                    forest.make_set()
                } else {
                    let base = neighbors[0];
                    for &other in &neighbors[1..count] {
                        forest.union(base, other);
                    }
                    base
                };
            }
        }
    }

    let mut slot_of_root = vec![None::<usize>; forest.len()];
    let mut regions: Vec<Vec<[usize; 3]>> = Vec::new();
    for z in 0..cube.planes {
        for row in 0..cube.height {
            for col in 0..cube.width {
                let index = z * plane_stride + row * cube.width + col;
                if provisional[index] == 0 {
                    continue;
                }
                let root = forest.find(provisional[index]) as usize;
                let slot = match slot_of_root[root] {
                    Some(slot) => slot,
                    None => {
                        regions.push(Vec::new());
                        slot_of_root[root] = Some(regions.len() - 1);
                        regions.len() - 1
                    }
                };
                regions[slot].push([z, row, col]);
            }
        }
    }
    regions
}

// ── Feature extraction ─────────────────────────────────────────────────────

fn assemble_row(
    cube: &ImageCube<'_>,
    coords: &[[usize; 3]],
    barcode_index: usize,
    config: &ExtractConfig,
    aligner: Option<&dyn FovAligner>,
) -> BarcodeFeature {
    let area = coords.len();
    let magnitudes: Vec<f64> = coords
        .iter()
        .map(|&[z, row, col]| f64::from(cube.magnitude(z, row, col)))
        .collect();
    let weight_sum: f64 = magnitudes.iter().sum();

    // Magnitude-weighted centroid; a single pixel keeps its own coordinate
    // and an all-zero region falls back to the unweighted mean.
    let [mut z, y, x] = if area == 1 {
        let [pz, pr, pc] = coords[0];
        [pz as f64, pr as f64, pc as f64]
    } else {
        let mut acc = [0.0f64; 3];
        if weight_sum > 0.0 {
            for (&[pz, pr, pc], &weight) in coords.iter().zip(&magnitudes) {
                acc[0] += pz as f64 * weight;
                acc[1] += pr as f64 * weight;
                acc[2] += pc as f64 * weight;
            }
            [
                acc[0] / weight_sum,
                acc[1] / weight_sum,
                acc[2] / weight_sum,
            ]
        } else {
            for &[pz, pr, pc] in coords {
                acc[0] += pz as f64;
                acc[1] += pr as f64;
                acc[2] += pc as f64;
            }
            [
                acc[0] / area as f64,
                acc[1] / area as f64,
                acc[2] / area as f64,
            ]
        }
    };
    if cube.is_plane() {
        z = config.z_index as f64;
    }

    let mean_intensity = weight_sum / area as f64;
    let max_intensity = magnitudes.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let distances: Vec<f64> = coords
        .iter()
        .map(|&[z, row, col]| cube.distance(z, row, col))
        .collect();
    let mean_distance = distances.iter().sum::<f64>() / area as f64;
    let min_distance = distances.iter().copied().fold(f64::INFINITY, f64::min);

    let (mean_probability, max_probability, log_likelihood) = if cube.has_probabilities() {
        let values: Vec<f64> = coords
            .iter()
            .filter_map(|&[z, row, col]| cube.probability(z, row, col))
            .collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let score = values
            .iter()
            .map(|p| -(1.0 - p + LOG_LIKELIHOOD_EPSILON).log10())
            .sum();
        (Some(mean), Some(max), Some(score))
    } else {
        (None, None, None)
    };

    let mut intensity = vec![0.0f64; cube.bits];
    for &[pz, pr, pc] in coords {
        for (bit, slot) in intensity.iter_mut().enumerate() {
            *slot += f64::from(cube.trace(pz, bit, pr, pc));
        }
    }
    for slot in &mut intensity {
        *slot /= area as f64;
    }

    let local = [x, y, z];
    let [global_x, global_y, global_z] = match aligner {
        Some(mapper) => mapper.fov_coordinate_to_global(config.fov, local),
        None => local,
    };

    BarcodeFeature {
        barcode_id: barcode_index,
        fov: config.fov,
        mean_intensity,
        max_intensity,
        area,
        mean_distance,
        min_distance,
        mean_probability,
        max_probability,
        log_likelihood,
        x,
        y,
        z,
        global_x,
        global_y,
        global_z,
        cell_index: -1,
        intensity,
    }
}

/// Local centroids must sit strictly inside the cropped lateral frame;
/// x runs along the width axis, y along the height axis.
fn inside_crop(x: f64, y: f64, width: usize, height: usize, crop_width: usize) -> bool {
    let crop = crop_width as f64;
    x > crop && x < width as f64 - crop && y > crop && y < height as f64 - crop
}

/// One feature row per connected region decoded to `barcode_index`.
///
/// A label image with no matching pixels (including an out-of-range index)
/// yields an empty table carrying the full column schema.
pub(crate) fn extract_barcodes_with_index(
    barcode_index: usize,
    images: DecodedImages<'_>,
    config: &ExtractConfig,
    aligner: Option<&dyn FovAligner>,
) -> Result<FeatureTable, ExtractError> {
    let cube = ImageCube::new(images)?;
    let mut table = FeatureTable::empty(cube.bits, cube.has_probabilities());
    let Ok(target) = i32::try_from(barcode_index) else {
        return Ok(table);
    };

    let regions = connected_regions(&cube, target);
    let found = regions.len();
    for coords in &regions {
        if coords.len() < config.minimum_area {
            continue;
        }
        let row = assemble_row(&cube, coords, barcode_index, config, aligner);
        if !inside_crop(row.x, row.y, cube.width, cube.height, config.crop_width) {
            continue;
        }
        if let Some(mean) = row.mean_probability {
            if mean < config.minimum_probability {
                continue;
            }
        }
        table.push(row);
    }

    debug!(
        "barcode {}: kept {} of {} regions",
        barcode_index,
        table.len(),
        found
    );
    Ok(table)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode_stack, DecodeConfig, DecodedPlane, DecodedVolume};
    use crate::test_utils::{block_stack, labeled_plane, two_bit_matrix};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array3, Array4};

    fn extract(
        barcode_index: usize,
        plane: &DecodedPlane,
        config: &ExtractConfig,
    ) -> FeatureTable {
        extract_barcodes_with_index(barcode_index, DecodedImages::Plane(plane), config, None)
            .unwrap()
    }

    #[test]
    fn block_scenario_yields_one_centered_region() {
        let matrix = two_bit_matrix();
        let config = DecodeConfig {
            magnitude_threshold: 0.5,
            low_pass_sigma: 0.0,
            ..DecodeConfig::default()
        };
        let plane = decode_stack(&matrix, &block_stack(), &config).unwrap();

        let table = extract(
            0,
            &plane,
            &ExtractConfig {
                fov: 3,
                z_index: 2,
                ..ExtractConfig::default()
            },
        );
        assert_eq!(table.len(), 1);
        let row = &table.rows()[0];
        assert_eq!(row.barcode_id, 0);
        assert_eq!(row.fov, 3);
        assert_eq!(row.area, 4);
        assert_abs_diff_eq!(row.x, 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(row.y, 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(row.z, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(row.global_x, 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(row.mean_intensity, 5.0 / 8.0, epsilon = 1e-6);
        assert_abs_diff_eq!(row.max_intensity, 5.0 / 8.0, epsilon = 1e-6);
        assert_abs_diff_eq!(row.mean_distance, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(row.intensity[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(row.intensity[1], 0.0, epsilon = 1e-6);
        assert_eq!(row.cell_index, -1);
        assert!(row.mean_probability.is_none());
    }

    #[test]
    fn unmatched_index_yields_empty_table_with_schema() {
        let plane = labeled_plane(Array2::from_elem((4, 4), -1), 2);
        let config = ExtractConfig::default();

        let table = extract(0, &plane, &config);
        assert!(table.is_empty());
        assert_eq!(table.bit_count(), 2);
        assert!(!table.has_probabilities());
        assert_eq!(table.column_names().len(), 7 + 7 + 2);

        // Out-of-range indexes behave the same as unmatched ones.
        assert!(extract(99, &plane, &config).is_empty());
    }

    #[test]
    fn adjacent_pixels_with_different_labels_stay_separate() {
        let mut labels = Array2::from_elem((3, 4), -1);
        labels[[1, 1]] = 0;
        labels[[1, 2]] = 1;
        let plane = labeled_plane(labels, 2);
        let config = ExtractConfig::default();

        let zeros = extract(0, &plane, &config);
        let ones = extract(1, &plane, &config);
        assert_eq!(zeros.len(), 1);
        assert_eq!(ones.len(), 1);
        assert_eq!(zeros.rows()[0].area, 1);
        assert_eq!(ones.rows()[0].area, 1);
    }

    #[test]
    fn centroid_follows_magnitude_weights() {
        let mut labels = Array2::from_elem((5, 5), -1);
        labels[[2, 2]] = 0;
        labels[[2, 3]] = 0;
        let mut plane = labeled_plane(labels, 2);
        plane.magnitudes[[2, 2]] = 1.0;
        plane.magnitudes[[2, 3]] = 3.0;

        let table = extract(0, &plane, &ExtractConfig::default());
        assert_eq!(table.len(), 1);
        let row = &table.rows()[0];
        assert_abs_diff_eq!(row.x, 2.75, epsilon = 1e-9);
        assert_abs_diff_eq!(row.y, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(row.mean_intensity, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(row.max_intensity, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn degenerate_magnitudes_still_give_finite_centroids() {
        let mut labels = Array2::from_elem((5, 6), -1);
        // Single zero-magnitude pixel keeps its own coordinate.
        labels[[2, 3]] = 0;
        // Two-pixel zero-magnitude region falls back to the plain mean.
        labels[[4, 0]] = 1;
        labels[[4, 1]] = 1;
        let mut plane = labeled_plane(labels, 2);
        plane.magnitudes.fill(0.0);

        let single = extract(0, &plane, &ExtractConfig::default());
        assert_eq!(single.len(), 1);
        assert_abs_diff_eq!(single.rows()[0].x, 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(single.rows()[0].y, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(single.rows()[0].mean_intensity, 0.0, epsilon = 1e-9);

        let pair = extract(1, &plane, &ExtractConfig::default());
        assert_eq!(pair.len(), 1);
        assert_abs_diff_eq!(pair.rows()[0].x, 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(pair.rows()[0].y, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn crop_width_excludes_border_spots() {
        // Wider than tall, so an x inside (crop, width-crop) but outside
        // (crop, height-crop) proves x is checked against the width axis.
        let mut labels = Array2::from_elem((6, 10), -1);
        for col in 6..9 {
            labels[[3, col]] = 0; // centroid x=7, y=3: kept
        }
        for col in 0..3 {
            labels[[3, col]] = 0; // centroid x=1: too close to the left edge
        }
        for col in 6..9 {
            labels[[5, col]] = 0; // centroid y=5: too close to the bottom edge
        }
        let plane = labeled_plane(labels, 2);

        let table = extract(
            0,
            &plane,
            &ExtractConfig {
                crop_width: 2,
                ..ExtractConfig::default()
            },
        );
        assert_eq!(table.len(), 1);
        assert_abs_diff_eq!(table.rows()[0].x, 7.0, epsilon = 1e-9);
        assert_abs_diff_eq!(table.rows()[0].y, 3.0, epsilon = 1e-9);

        // Without cropping all three regions survive.
        assert_eq!(extract(0, &plane, &ExtractConfig::default()).len(), 3);
    }

    #[test]
    fn minimum_area_filters_single_pixels() {
        let mut labels = Array2::from_elem((6, 6), -1);
        labels[[1, 1]] = 0;
        for col in 2..5 {
            labels[[4, col]] = 0;
        }
        let plane = labeled_plane(labels, 2);

        let loose = extract(0, &plane, &ExtractConfig::default());
        assert_eq!(loose.len(), 2);

        let strict = extract(
            0,
            &plane,
            &ExtractConfig {
                minimum_area: 2,
                ..ExtractConfig::default()
            },
        );
        assert_eq!(strict.len(), 1);
        assert_eq!(strict.rows()[0].area, 3);
    }

    #[test]
    fn probability_channel_adds_statistics_and_filtering() {
        let mut labels = Array2::from_elem((5, 5), -1);
        labels[[1, 1]] = 0;
        labels[[1, 2]] = 0;
        labels[[3, 1]] = 0;
        labels[[3, 2]] = 0;
        let mut plane = labeled_plane(labels, 2);
        let mut probabilities = Array2::zeros((5, 5));
        probabilities[[1, 1]] = 0.9;
        probabilities[[1, 2]] = 0.9;
        probabilities[[3, 1]] = 0.2;
        probabilities[[3, 2]] = 0.2;
        plane.probabilities = Some(probabilities);

        let table = extract(0, &plane, &ExtractConfig::default());
        assert!(table.has_probabilities());
        assert_eq!(table.len(), 1);
        let row = &table.rows()[0];
        assert_abs_diff_eq!(row.mean_probability.unwrap(), 0.9, epsilon = 1e-9);
        assert_abs_diff_eq!(row.max_probability.unwrap(), 0.9, epsilon = 1e-9);
        // Two pixels at p=0.9: -2*log10(0.1 + 1e-6).
        assert_abs_diff_eq!(row.log_likelihood.unwrap(), 2.0, epsilon = 1e-3);

        // Lowering the bar keeps the weak region too.
        let permissive = extract(
            0,
            &plane,
            &ExtractConfig {
                minimum_probability: 0.1,
                ..ExtractConfig::default()
            },
        );
        assert_eq!(permissive.len(), 2);
    }

    #[test]
    fn volume_regions_merge_across_planes_but_not_diagonals() {
        let mut labels = Array3::from_elem((2, 5, 5), -1);
        labels[[0, 2, 2]] = 0;
        labels[[1, 2, 2]] = 0; // same row/col on the next plane: one region
        labels[[0, 1, 4]] = 0; // lateral diagonal from nothing: isolated
        labels[[1, 2, 3]] = 0; // touches [1,2,2] laterally: joins the region
        let mut magnitudes = Array3::ones((2, 5, 5));
        magnitudes[[1, 2, 2]] = 3.0;
        let volume = DecodedVolume {
            labels,
            magnitudes,
            traces: Array4::zeros((2, 2, 5, 5)),
            distances: Array3::zeros((2, 5, 5)),
            probabilities: None,
        };

        let table = extract_barcodes_with_index(
            0,
            DecodedImages::Volume(&volume),
            &ExtractConfig::default(),
            None,
        )
        .unwrap();
        assert_eq!(table.len(), 2);

        let spanning = table.iter().find(|row| row.area == 3).unwrap();
        // Weights 1, 3, 1 on z = 0, 1, 1.
        assert_abs_diff_eq!(spanning.z, 4.0 / 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(spanning.y, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(spanning.x, (2.0 + 6.0 + 3.0) / 5.0, epsilon = 1e-9);

        let isolated = table.iter().find(|row| row.area == 1).unwrap();
        assert_abs_diff_eq!(isolated.z, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(isolated.x, 4.0, epsilon = 1e-9);
    }

    struct ShiftAligner {
        dx: f64,
        dy: f64,
    }

    impl FovAligner for ShiftAligner {
        fn fov_coordinate_to_global(&self, fov: u32, local: [f64; 3]) -> [f64; 3] {
            [
                local[0] + self.dx,
                local[1] + self.dy,
                local[2] + f64::from(fov),
            ]
        }
    }

    #[test]
    fn aligner_maps_centroids_to_global_coordinates() {
        let mut labels = Array2::from_elem((5, 5), -1);
        labels[[2, 2]] = 0;
        let plane = labeled_plane(labels, 2);
        let aligner = ShiftAligner { dx: 100.0, dy: -7.5 };

        let table = extract_barcodes_with_index(
            0,
            DecodedImages::Plane(&plane),
            &ExtractConfig {
                fov: 4,
                ..ExtractConfig::default()
            },
            Some(&aligner),
        )
        .unwrap();
        let row = &table.rows()[0];
        assert_abs_diff_eq!(row.x, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(row.global_x, 102.0, epsilon = 1e-9);
        assert_abs_diff_eq!(row.global_y, -5.5, epsilon = 1e-9);
        assert_abs_diff_eq!(row.global_z, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn mismatched_images_fail_fast() {
        let mut plane = labeled_plane(Array2::from_elem((4, 4), -1), 2);
        plane.magnitudes = Array2::ones((3, 3));

        let err = extract_barcodes_with_index(
            0,
            DecodedImages::Plane(&plane),
            &ExtractConfig::default(),
            None,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ExtractError::ShapeMismatch {
                image: "magnitude",
                expected: vec![4, 4],
                got: vec![3, 3],
            }
        );
    }
}
