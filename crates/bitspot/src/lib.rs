//! bitspot — pixel-based barcode decoding for multiplexed single-molecule
//! imaging.
//!
//! Takes a stack of co-registered intensity images (one per imaging
//! round/bit), assigns each pixel to the nearest codebook barcode, and turns
//! contiguous same-barcode pixels into discrete spot records. The stages are:
//!
//! 1. **Codebook** – validated table of target names and bit patterns.
//! 2. **Decoding matrix** – unit-normalized barcode references, optionally
//!    expanded with single-bit-flip variants for error-tolerant matching.
//! 3. **Decode** – per-plane low-pass filter, background/scale correction,
//!    trace normalization, 1-nearest-neighbor assignment under distance and
//!    magnitude thresholds; a scored variant adds per-pixel probabilities
//!    from an external model.
//! 4. **Extract** – connected-component analysis per barcode producing one
//!    [`BarcodeFeature`] row per spot.
//! 5. **Refactor** – per-bit scale/background estimates from high-confidence
//!    regions, feeding an external calibration loop.
//!
//! # Public API
//! - [`PixelDecoder`] and [`DecoderOptions`] as primary entry points
//! - [`DecodeConfig`], [`ExtractConfig`], [`RefactorConfig`] for tuning
//! - [`PixelScorer`] and [`FovAligner`] collaborator traits
//! - [`BarcodeFeature`] / [`FeatureTable`] result records
//!
//! Registration across imaging rounds, cell segmentation, persistence, and
//! scheduling across fields of view all live outside this crate; decoding
//! one field of view is a pure function of its inputs.

mod aligner;
mod codebook;
mod decode;
mod decoder;
mod extract;
mod matrix;
mod refactor;
mod scorer;
#[cfg(test)]
pub(crate) mod test_utils;

pub use aligner::FovAligner;
pub use codebook::{BarcodeEntry, Codebook, CodebookError};
pub use decode::{
    DecodeConfig, DecodeError, DecodedImages, DecodedPlane, DecodedVolume,
    MAGNITUDE_SCALE_DIVISOR,
};
pub use decoder::{DecoderOptions, PixelDecoder};
pub use extract::{ExtractConfig, ExtractError};
pub use matrix::{DecodingMatrix, NearestBarcode};
pub use refactor::{RefactorConfig, RefactorEstimate};
pub use scorer::{PixelScorer, PIXEL_FEATURE_COLUMNS};

/// One decoded spot: a connected pixel region sharing a barcode assignment.
///
/// Probability fields are present exactly when the region came from a scored
/// decode. `cell_index` is always −1 here; cell assignment happens in a later,
/// external stage.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BarcodeFeature {
    /// Decoding-matrix row index the region was decoded to.
    pub barcode_id: usize,
    /// Field of view the region was found in.
    pub fov: u32,
    /// Mean pixel magnitude over the region.
    pub mean_intensity: f64,
    /// Maximum pixel magnitude over the region.
    pub max_intensity: f64,
    /// Region size in pixels.
    pub area: usize,
    /// Mean distance to the matched reference over the region.
    pub mean_distance: f64,
    /// Minimum distance to the matched reference over the region.
    pub min_distance: f64,
    /// Mean valid-barcode probability over the region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_probability: Option<f64>,
    /// Maximum valid-barcode probability over the region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_probability: Option<f64>,
    /// −Σ log10(1 − p + 1e-6) over region pixels; one low-confidence pixel
    /// drags the whole region down. Serialized under its historical name.
    #[serde(rename = "loglikehood", skip_serializing_if = "Option::is_none")]
    pub log_likelihood: Option<f64>,
    /// Magnitude-weighted centroid, local frame (x = column, y = row).
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Centroid mapped through the [`FovAligner`], or the local value when
    /// no aligner was supplied.
    pub global_x: f64,
    pub global_y: f64,
    pub global_z: f64,
    /// Cell association, filled by an external stage; −1 means unassigned.
    pub cell_index: i64,
    /// Mean normalized trace over the region, one entry per bit
    /// (the `intensity_0…intensity_{K−1}` columns).
    pub intensity: Vec<f64>,
}

/// Feature rows extracted for one barcode index, plus the schema they follow.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FeatureTable {
    bit_count: usize,
    with_probabilities: bool,
    rows: Vec<BarcodeFeature>,
}

impl FeatureTable {
    /// Construct an empty table carrying the full column schema.
    pub fn empty(bit_count: usize, with_probabilities: bool) -> Self {
        Self {
            bit_count,
            with_probabilities,
            rows: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, row: BarcodeFeature) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[BarcodeFeature] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BarcodeFeature> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<BarcodeFeature> {
        self.rows
    }

    /// Number of bits behind the `intensity_*` columns.
    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    /// Whether rows carry the probability columns.
    pub fn has_probabilities(&self) -> bool {
        self.with_probabilities
    }

    /// Column names in their fixed documented order, including the expanded
    /// `intensity_0…intensity_{K−1}` family.
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = [
            "barcode_id",
            "fov",
            "mean_intensity",
            "max_intensity",
            "area",
            "mean_distance",
            "min_distance",
        ]
        .map(String::from)
        .to_vec();
        if self.with_probabilities {
            names.extend(
                ["mean_probability", "max_probability", "loglikehood"].map(String::from),
            );
        }
        names.extend(
            ["x", "y", "z", "global_x", "global_y", "global_z", "cell_index"].map(String::from),
        );
        names.extend((0..self.bit_count).map(|i| format!("intensity_{i}")));
        names
    }
}

impl<'a> IntoIterator for &'a FeatureTable {
    type Item = &'a BarcodeFeature;
    type IntoIter = std::slice::Iter<'a, BarcodeFeature>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}
