//! Probability-estimator seam for scored decoding.
//!
//! The scored decode variant consults an externally trained model to judge,
//! per pixel, how likely the assigned barcode is real. The model is consumed
//! purely through [`PixelScorer`]; training it is somebody else's problem.

use ndarray::{Array1, Array2};

/// Column order of the feature matrix handed to a [`PixelScorer`].
///
/// `intensity` is log10 of the rescaled pixel magnitude; `distance` is the
/// Euclidean distance to the assigned decoding-matrix row. The remaining
/// columns are the squares and products of those two.
pub const PIXEL_FEATURE_COLUMNS: [&str; 6] = [
    "intensity",
    "distance",
    "intensity_2",
    "distance_2",
    "intensity_distance",
    "intensity_distance_2",
];

/// Predicts the probability that a decoded pixel carries a valid barcode.
pub trait PixelScorer {
    /// Probability of the valid-barcode class for each feature row.
    ///
    /// `features` has one row per pixel with columns ordered as
    /// [`PIXEL_FEATURE_COLUMNS`]; the returned vector must hold one value in
    /// `[0, 1]` per row.
    fn predict_valid(&self, features: &Array2<f64>) -> Array1<f64>;
}

/// Build the per-pixel feature matrix from flattened magnitude and distance
/// buffers (row-major pixel order, magnitudes already rescaled).
pub(crate) fn pixel_feature_matrix(magnitudes: &[f32], distances: &[f64]) -> Array2<f64> {
    let mut features = Array2::zeros((magnitudes.len(), PIXEL_FEATURE_COLUMNS.len()));
    for (pixel, (&magnitude, &distance)) in magnitudes.iter().zip(distances).enumerate() {
        let intensity = f64::from(magnitude).log10();
        features[[pixel, 0]] = intensity;
        features[[pixel, 1]] = distance;
        features[[pixel, 2]] = intensity * intensity;
        features[[pixel, 3]] = distance * distance;
        features[[pixel, 4]] = intensity * distance;
        features[[pixel, 5]] = intensity * intensity * distance * distance;
    }
    features
}
