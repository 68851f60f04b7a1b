//! Per-pixel barcode classification.
//!
//! One decode pass takes a K-plane intensity stack for a single z-plane and
//! produces four spatially aligned images: barcode label, trace magnitude,
//! distance to the matched reference, and the normalized trace stack itself.
//! The scored variant adds a per-pixel probability image from an external
//! [`PixelScorer`](crate::scorer::PixelScorer).

use ndarray::{Array1, Array2, Array3, Array4, Axis};

use crate::matrix::DecodingMatrix;
use crate::scorer::{pixel_feature_matrix, PixelScorer};

/// Fixed calibration divisor applied to pixel magnitudes after trace
/// normalization and before magnitude thresholding. Inherited from the
/// legacy MATLAB decoder without a stated derivation.
pub const MAGNITUDE_SCALE_DIVISOR: f32 = 8.0;

// ── Error type ─────────────────────────────────────────────────────────────

/// Errors raised before any per-pixel work starts.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The stack's first axis disagrees with the codebook bit count.
    BitPlaneCount {
        /// Bit count K fixed by the decoder.
        expected: usize,
        /// Number of planes in the stack.
        got: usize,
    },
    /// Scale-factor vector length differs from the bit count.
    ScaleLength { expected: usize, got: usize },
    /// Background vector length differs from the bit count.
    BackgroundLength { expected: usize, got: usize },
    /// A scale factor that cannot divide intensities.
    InvalidScale {
        /// Bit position of the offending entry.
        bit: usize,
        /// The value found.
        value: f64,
    },
    /// A non-finite background entry.
    InvalidBackground { bit: usize, value: f64 },
    /// The probability estimator returned the wrong number of rows.
    ScorerOutputLength { expected: usize, got: usize },
    /// Volume assembly was given no planes.
    EmptyVolume,
    /// A plane's shape disagrees with the first plane.
    PlaneShapeMismatch {
        /// Index of the offending plane.
        index: usize,
        /// (bits, height, width) of the first plane.
        expected: [usize; 3],
        /// (bits, height, width) found.
        got: [usize; 3],
    },
    /// Planes mix scored and unscored decode outputs.
    MixedProbability { index: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BitPlaneCount { expected, got } => {
                write!(f, "image stack has {} bit-planes, expected {}", got, expected)
            }
            Self::ScaleLength { expected, got } => {
                write!(f, "scale vector has {} entries, expected {}", got, expected)
            }
            Self::BackgroundLength { expected, got } => write!(
                f,
                "background vector has {} entries, expected {}",
                got, expected
            ),
            Self::InvalidScale { bit, value } => write!(
                f,
                "scale factor for bit {} is {}, must be finite and nonzero",
                bit, value
            ),
            Self::InvalidBackground { bit, value } => {
                write!(f, "background for bit {} is {}, must be finite", bit, value)
            }
            Self::ScorerOutputLength { expected, got } => write!(
                f,
                "pixel scorer returned {} probabilities for {} pixels",
                got, expected
            ),
            Self::EmptyVolume => write!(f, "cannot assemble a volume from zero planes"),
            Self::PlaneShapeMismatch {
                index,
                expected,
                got,
            } => write!(
                f,
                "plane {} has shape {:?}, expected {:?}",
                index, got, expected
            ),
            Self::MixedProbability { index } => write!(
                f,
                "plane {} mixes scored and unscored outputs in one volume",
                index
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

// ── Configuration ──────────────────────────────────────────────────────────

/// Per-call decode parameters.
///
/// `scale_factors` and `backgrounds` carry the current calibration state;
/// both default to the neutral vectors (all ones / all zeros). Thresholds
/// default to the hard-threshold variant; [`DecodeConfig::scored`] switches
/// to the probability-assisted defaults.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DecodeConfig {
    /// Per-bit divisors applied after background subtraction.
    /// `None` means all ones. Length must equal the bit count.
    #[serde(default)]
    pub scale_factors: Option<Array1<f64>>,
    /// Per-bit background levels subtracted before scaling.
    /// `None` means all zeros. Length must equal the bit count.
    #[serde(default)]
    pub backgrounds: Option<Array1<f64>>,
    /// Maximum distance between a normalized trace and its nearest reference
    /// for the pixel to keep that assignment.
    /// Default: [`DecodeConfig::DEFAULT_DISTANCE_THRESHOLD`].
    #[serde(default = "DecodeConfig::default_distance_threshold")]
    pub distance_threshold: f64,
    /// Minimum rescaled magnitude for a pixel to keep its assignment.
    /// Default: [`DecodeConfig::DEFAULT_MAGNITUDE_THRESHOLD`].
    #[serde(default = "DecodeConfig::default_magnitude_threshold")]
    pub magnitude_threshold: f64,
    /// Gaussian sigma for the per-plane low-pass filter; values <= 0 disable
    /// filtering. Default: [`DecodeConfig::DEFAULT_LOW_PASS_SIGMA`].
    #[serde(default = "DecodeConfig::default_low_pass_sigma")]
    pub low_pass_sigma: f32,
}

impl DecodeConfig {
    pub const DEFAULT_DISTANCE_THRESHOLD: f64 = 0.65;
    pub const DEFAULT_MAGNITUDE_THRESHOLD: f64 = 10.0;
    /// Distance threshold for the probability-assisted variant.
    pub const SCORED_DISTANCE_THRESHOLD: f64 = 0.5176;
    /// Magnitude threshold for the probability-assisted variant.
    pub const SCORED_MAGNITUDE_THRESHOLD: f64 = 1.0;
    pub const DEFAULT_LOW_PASS_SIGMA: f32 = 1.0;

    /// Defaults for the probability-assisted variant: a looser magnitude
    /// gate and a tighter distance gate, since the scorer does the real
    /// filtering downstream.
    pub fn scored() -> Self {
        Self {
            distance_threshold: Self::SCORED_DISTANCE_THRESHOLD,
            magnitude_threshold: Self::SCORED_MAGNITUDE_THRESHOLD,
            ..Self::default()
        }
    }

    fn default_distance_threshold() -> f64 {
        Self::DEFAULT_DISTANCE_THRESHOLD
    }

    fn default_magnitude_threshold() -> f64 {
        Self::DEFAULT_MAGNITUDE_THRESHOLD
    }

    fn default_low_pass_sigma() -> f32 {
        Self::DEFAULT_LOW_PASS_SIGMA
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            scale_factors: None,
            backgrounds: None,
            distance_threshold: Self::DEFAULT_DISTANCE_THRESHOLD,
            magnitude_threshold: Self::DEFAULT_MAGNITUDE_THRESHOLD,
            low_pass_sigma: Self::DEFAULT_LOW_PASS_SIGMA,
        }
    }
}

// ── Decode outputs ─────────────────────────────────────────────────────────

/// Aligned output images of one decode pass over a single z-plane.
#[derive(Debug, Clone)]
pub struct DecodedPlane {
    /// Barcode index per pixel, −1 where unassigned.
    pub labels: Array2<i32>,
    /// Rescaled trace magnitude per pixel.
    pub magnitudes: Array2<f32>,
    /// Normalized trace stack, (bit, row, column).
    pub traces: Array3<f32>,
    /// Distance to the matched reference per pixel.
    pub distances: Array2<f64>,
    /// Valid-barcode probability per pixel; present for scored decodes.
    pub probabilities: Option<Array2<f64>>,
}

impl DecodedPlane {
    pub fn bit_count(&self) -> usize {
        self.traces.shape()[0]
    }

    pub fn height(&self) -> usize {
        self.labels.nrows()
    }

    pub fn width(&self) -> usize {
        self.labels.ncols()
    }
}

/// Decoded planes stacked along z for volumetric extraction.
///
/// Trace axes are (z, bit, row, column); scalar images are (z, row, column).
#[derive(Debug, Clone)]
pub struct DecodedVolume {
    pub labels: Array3<i32>,
    pub magnitudes: Array3<f32>,
    pub traces: Array4<f32>,
    pub distances: Array3<f64>,
    pub probabilities: Option<Array3<f64>>,
}

impl DecodedVolume {
    /// Stack per-z decode outputs into one volume.
    ///
    /// All planes must share one shape and agree on probability presence;
    /// plane order becomes the z order.
    pub fn from_planes(planes: Vec<DecodedPlane>) -> Result<Self, DecodeError> {
        let first = planes.first().ok_or(DecodeError::EmptyVolume)?;
        let expected = [first.bit_count(), first.height(), first.width()];
        let with_probabilities = first.probabilities.is_some();

        for (index, plane) in planes.iter().enumerate() {
            let got = [plane.bit_count(), plane.height(), plane.width()];
            if got != expected {
                return Err(DecodeError::PlaneShapeMismatch {
                    index,
                    expected,
                    got,
                });
            }
            if plane.probabilities.is_some() != with_probabilities {
                return Err(DecodeError::MixedProbability { index });
            }
        }

        let [bit_count, height, width] = expected;
        let plane_count = planes.len();
        let mut labels = Array3::zeros((plane_count, height, width));
        let mut magnitudes = Array3::zeros((plane_count, height, width));
        let mut traces = Array4::zeros((plane_count, bit_count, height, width));
        let mut distances = Array3::zeros((plane_count, height, width));
        let mut probabilities =
            with_probabilities.then(|| Array3::zeros((plane_count, height, width)));

        for (z, plane) in planes.into_iter().enumerate() {
            labels.index_axis_mut(Axis(0), z).assign(&plane.labels);
            magnitudes
                .index_axis_mut(Axis(0), z)
                .assign(&plane.magnitudes);
            traces.index_axis_mut(Axis(0), z).assign(&plane.traces);
            distances.index_axis_mut(Axis(0), z).assign(&plane.distances);
            if let (Some(volume), Some(plane)) = (probabilities.as_mut(), plane.probabilities) {
                volume.index_axis_mut(Axis(0), z).assign(&plane);
            }
        }

        Ok(Self {
            labels,
            magnitudes,
            traces,
            distances,
            probabilities,
        })
    }

    pub fn plane_count(&self) -> usize {
        self.labels.shape()[0]
    }

    pub fn bit_count(&self) -> usize {
        self.traces.shape()[1]
    }

    pub fn height(&self) -> usize {
        self.labels.shape()[1]
    }

    pub fn width(&self) -> usize {
        self.labels.shape()[2]
    }
}

/// Borrowed decode output handed to extraction; the variant is the explicit
/// dimensionality switch.
#[derive(Debug, Clone, Copy)]
pub enum DecodedImages<'a> {
    Plane(&'a DecodedPlane),
    Volume(&'a DecodedVolume),
}

impl DecodedImages<'_> {
    pub fn bit_count(&self) -> usize {
        match self {
            Self::Plane(p) => p.bit_count(),
            Self::Volume(v) => v.bit_count(),
        }
    }

    pub fn has_probabilities(&self) -> bool {
        match self {
            Self::Plane(p) => p.probabilities.is_some(),
            Self::Volume(v) => v.probabilities.is_some(),
        }
    }
}

// ── Decode pipeline ────────────────────────────────────────────────────────

/// Resolved calibration vectors after validation.
struct CalibrationVectors {
    scale_factors: Vec<f64>,
    backgrounds: Vec<f64>,
}

fn resolve_calibration(
    bit_count: usize,
    config: &DecodeConfig,
) -> Result<CalibrationVectors, DecodeError> {
    let scale_factors = match &config.scale_factors {
        Some(scale) => {
            if scale.len() != bit_count {
                return Err(DecodeError::ScaleLength {
                    expected: bit_count,
                    got: scale.len(),
                });
            }
            scale.to_vec()
        }
        None => vec![1.0; bit_count],
    };
    for (bit, &value) in scale_factors.iter().enumerate() {
        if !value.is_finite() || value == 0.0 {
            return Err(DecodeError::InvalidScale { bit, value });
        }
    }

    let backgrounds = match &config.backgrounds {
        Some(backgrounds) => {
            if backgrounds.len() != bit_count {
                return Err(DecodeError::BackgroundLength {
                    expected: bit_count,
                    got: backgrounds.len(),
                });
            }
            backgrounds.to_vec()
        }
        None => vec![0.0; bit_count],
    };
    for (bit, &value) in backgrounds.iter().enumerate() {
        if !value.is_finite() {
            return Err(DecodeError::InvalidBackground { bit, value });
        }
    }

    Ok(CalibrationVectors {
        scale_factors,
        backgrounds,
    })
}

/// Gaussian low-pass over one bit-plane held as a flat row-major buffer.
fn low_pass_plane(plane: Vec<f32>, width: u32, height: u32, sigma: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return plane;
    }
    let buffer = image::ImageBuffer::<image::Luma<f32>, Vec<f32>>::from_raw(width, height, plane)
        .expect("plane buffer matches dimensions");
    imageproc::filter::gaussian_blur_f32(&buffer, sigma).into_raw()
}

/// Hard-threshold pixel classification over one z-plane.
pub(crate) fn decode_stack(
    matrix: &DecodingMatrix,
    stack: &Array3<f32>,
    config: &DecodeConfig,
) -> Result<DecodedPlane, DecodeError> {
    let bit_count = matrix.bit_count();
    let shape = stack.shape();
    if shape[0] != bit_count {
        return Err(DecodeError::BitPlaneCount {
            expected: bit_count,
            got: shape[0],
        });
    }
    let (height, width) = (shape[1], shape[2]);
    let pixel_count = height * width;
    let calibration = resolve_calibration(bit_count, config)?;

    // Filter each bit-plane, keeping everything in one plane-major buffer.
    let mut filtered = Vec::with_capacity(bit_count * pixel_count);
    for bit in 0..bit_count {
        let plane: Vec<f32> = stack.index_axis(Axis(0), bit).iter().copied().collect();
        filtered.extend(low_pass_plane(
            plane,
            width as u32,
            height as u32,
            config.low_pass_sigma,
        ));
    }

    let mut labels = vec![0i32; pixel_count];
    let mut magnitudes = vec![0f32; pixel_count];
    let mut distances = vec![0f64; pixel_count];
    let mut traces = vec![0f32; bit_count * pixel_count];
    let mut scaled = vec![0f64; bit_count];
    let mut assigned = 0usize;

    for pixel in 0..pixel_count {
        let mut sq_sum = 0f64;
        for bit in 0..bit_count {
            let raw = f64::from(filtered[bit * pixel_count + pixel]);
            let value = (raw - calibration.backgrounds[bit]) / calibration.scale_factors[bit];
            scaled[bit] = value;
            sq_sum += value * value;
        }

        // A zero-magnitude pixel keeps a defined all-zero trace.
        let mut magnitude = sq_sum.sqrt();
        if magnitude == 0.0 {
            magnitude = 1.0;
        }
        for bit in 0..bit_count {
            scaled[bit] /= magnitude;
            traces[bit * pixel_count + pixel] = scaled[bit] as f32;
        }

        let hit = matrix.nearest(&scaled);
        let rescaled = (magnitude / f64::from(MAGNITUDE_SCALE_DIVISOR)) as f32;
        let mut label = if hit.distance <= config.distance_threshold {
            hit.index as i32
        } else {
            -1
        };
        if f64::from(rescaled) < config.magnitude_threshold {
            label = -1;
        }
        if label >= 0 {
            assigned += 1;
        }

        labels[pixel] = label;
        magnitudes[pixel] = rescaled;
        distances[pixel] = hit.distance;
    }

    tracing::debug!(
        "decoded {}/{} pixels ({} barcodes, {} bits)",
        assigned,
        pixel_count,
        matrix.barcode_count(),
        bit_count
    );

    Ok(DecodedPlane {
        labels: Array2::from_shape_vec((height, width), labels)
            .expect("label buffer matches plane shape"),
        magnitudes: Array2::from_shape_vec((height, width), magnitudes)
            .expect("magnitude buffer matches plane shape"),
        traces: Array3::from_shape_vec((bit_count, height, width), traces)
            .expect("trace buffer matches stack shape"),
        distances: Array2::from_shape_vec((height, width), distances)
            .expect("distance buffer matches plane shape"),
        probabilities: None,
    })
}

/// Probability-assisted pixel classification over one z-plane.
///
/// Runs the hard-threshold pipeline, then asks `scorer` for a per-pixel
/// valid-barcode probability; unassigned pixels are forced to probability 0.
pub(crate) fn decode_stack_scored(
    matrix: &DecodingMatrix,
    stack: &Array3<f32>,
    config: &DecodeConfig,
    scorer: &dyn PixelScorer,
) -> Result<DecodedPlane, DecodeError> {
    let mut plane = decode_stack(matrix, stack, config)?;

    let magnitudes: Vec<f32> = plane.magnitudes.iter().copied().collect();
    let distances: Vec<f64> = plane.distances.iter().copied().collect();
    let features = pixel_feature_matrix(&magnitudes, &distances);
    let predicted = scorer.predict_valid(&features);
    if predicted.len() != magnitudes.len() {
        return Err(DecodeError::ScorerOutputLength {
            expected: magnitudes.len(),
            got: predicted.len(),
        });
    }

    let (height, width) = (plane.height(), plane.width());
    let mut probabilities = Array2::zeros((height, width));
    for (pixel, &p) in predicted.iter().enumerate() {
        let (row, col) = (pixel / width, pixel % width);
        if plane.labels[[row, col]] >= 0 {
            probabilities[[row, col]] = p;
        }
    }
    plane.probabilities = Some(probabilities);
    Ok(plane)
}
