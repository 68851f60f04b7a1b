//! Decoding matrix: unit-normalized barcode references and 1-NN matching.
//!
//! Each codebook barcode becomes one matrix row rescaled to unit L2 norm, so
//! Euclidean distance between a normalized pixel trace and a row measures how
//! well the pixel matches that target. In error-tolerant mode every row is
//! accompanied by its K single-bit-flip variants; a query then reports the
//! parent barcode of whichever variant lies closest.

use ndarray::{Array1, Array2, Array3};

use crate::codebook::{Codebook, CodebookError};

/// Result of a 1-nearest-neighbor query against the matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestBarcode {
    /// Row index of the matched barcode (parent row in error-tolerant mode).
    pub index: usize,
    /// Euclidean distance to the best-matching row or variant.
    pub distance: f64,
}

/// Immutable barcode reference matrix.
///
/// Built once per decoder from a [`Codebook`]; rows may be a filtered subset
/// of the codebook when blanks are excluded, so each row remembers its source
/// codebook index.
#[derive(Debug, Clone)]
pub struct DecodingMatrix {
    /// B×K canonical rows, each unit-normalized (all-zero rows stay zero).
    rows: Array2<f64>,
    /// B×(K+1)×K single-bit-flip variants, present in error-tolerant mode.
    /// Variant 0 is the canonical row itself.
    variants: Option<Array3<f64>>,
    /// Row index → codebook index.
    source_indexes: Vec<usize>,
}

impl DecodingMatrix {
    /// Build the matrix from a codebook.
    ///
    /// `ignore_blanks` drops blank/control entries before building;
    /// `include_errors` adds the single-bit-flip variants.
    pub fn from_codebook(
        codebook: &Codebook,
        ignore_blanks: bool,
        include_errors: bool,
    ) -> Result<Self, CodebookError> {
        let bit_count = codebook.bit_count();
        let source_indexes: Vec<usize> = (0..codebook.barcode_count())
            .filter(|&i| !(ignore_blanks && codebook.is_blank(i)))
            .collect();
        if source_indexes.is_empty() {
            return Err(CodebookError::AllBlank);
        }

        let barcode_count = source_indexes.len();
        let mut rows = Array2::zeros((barcode_count, bit_count));
        for (row, &src) in source_indexes.iter().enumerate() {
            let bits = codebook.bits(src).unwrap_or(&[]);
            rows.row_mut(row).assign(&unit_normalized(bits));
        }

        let variants = include_errors.then(|| {
            let mut tensor = Array3::zeros((barcode_count, bit_count + 1, bit_count));
            for (row, &src) in source_indexes.iter().enumerate() {
                let bits = codebook.bits(src).unwrap_or(&[]);
                tensor
                    .slice_mut(ndarray::s![row, 0, ..])
                    .assign(&unit_normalized(bits));
                for flip in 0..bit_count {
                    tensor
                        .slice_mut(ndarray::s![row, flip + 1, ..])
                        .assign(&unit_normalized(&flip_bit(bits, flip)));
                }
            }
            tensor
        });

        Ok(Self {
            rows,
            variants,
            source_indexes,
        })
    }

    /// Number of matrix rows B (after any blank filtering).
    pub fn barcode_count(&self) -> usize {
        self.rows.nrows()
    }

    /// Number of bits K.
    pub fn bit_count(&self) -> usize {
        self.rows.ncols()
    }

    /// Canonical unit-normalized rows, B×K.
    pub fn rows(&self) -> &Array2<f64> {
        &self.rows
    }

    /// Whether single-bit-flip variants participate in matching.
    pub fn has_error_variants(&self) -> bool {
        self.variants.is_some()
    }

    /// Codebook index behind a matrix row.
    pub fn source_index(&self, row: usize) -> Option<usize> {
        self.source_indexes.get(row).copied()
    }

    /// Whether `bit` is an on-bit of the barcode at `row`.
    pub fn is_on_bit(&self, row: usize, bit: usize) -> bool {
        self.rows[[row, bit]] > 0.0
    }

    /// Brute-force 1-nearest-neighbor search for one normalized pixel trace.
    ///
    /// `trace` must have length K. Scans every row (every variant row in
    /// error-tolerant mode); ties resolve to the lowest row index, which
    /// keeps repeated calls deterministic.
    pub fn nearest(&self, trace: &[f64]) -> NearestBarcode {
        debug_assert_eq!(trace.len(), self.bit_count());

        let mut best_index = 0usize;
        let mut best_sq = f64::INFINITY;
        match &self.variants {
            Some(tensor) => {
                for barcode in 0..tensor.shape()[0] {
                    for variant in 0..tensor.shape()[1] {
                        let row = tensor.slice(ndarray::s![barcode, variant, ..]);
                        let sq = squared_distance(trace, row);
                        if sq < best_sq {
                            best_sq = sq;
                            best_index = barcode;
                        }
                    }
                }
            }
            None => {
                for (barcode, row) in self.rows.rows().into_iter().enumerate() {
                    let sq = squared_distance(trace, row);
                    if sq < best_sq {
                        best_sq = sq;
                        best_index = barcode;
                    }
                }
            }
        }

        NearestBarcode {
            index: best_index,
            distance: best_sq.sqrt(),
        }
    }
}

fn squared_distance(trace: &[f64], row: ndarray::ArrayView1<f64>) -> f64 {
    trace
        .iter()
        .zip(row)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Rescale a bit pattern to unit L2 norm; an all-zero pattern stays zero.
fn unit_normalized(bits: &[u8]) -> Array1<f64> {
    let mut row = Array1::from_iter(bits.iter().map(|&b| f64::from(b)));
    let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        row.mapv_inplace(|v| v / norm);
    }
    row
}

/// Copy of `bits` with the bit at `position` inverted.
fn flip_bit(bits: &[u8], position: usize) -> Vec<u8> {
    let mut flipped = bits.to_vec();
    flipped[position] = 1 - flipped[position];
    flipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebook::BarcodeEntry;
    use approx::assert_abs_diff_eq;

    fn demo_codebook() -> Codebook {
        Codebook::new(vec![
            BarcodeEntry::new("GeneA", vec![1, 1, 0, 0]),
            BarcodeEntry::new("GeneB", vec![0, 0, 1, 1]),
            BarcodeEntry::new("Blank-01", vec![1, 0, 0, 1]),
        ])
        .unwrap()
    }

    #[test]
    fn rows_have_unit_norm() {
        let matrix = DecodingMatrix::from_codebook(&demo_codebook(), false, false).unwrap();
        for row in matrix.rows().rows() {
            let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
            assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn all_zero_barcode_stays_zero() {
        let cb = Codebook::new(vec![
            BarcodeEntry::new("GeneA", vec![1, 0]),
            BarcodeEntry::new("Empty", vec![0, 0]),
        ])
        .unwrap();
        let matrix = DecodingMatrix::from_codebook(&cb, false, false).unwrap();
        assert_eq!(matrix.rows().row(1).iter().sum::<f64>(), 0.0);
    }

    #[test]
    fn blank_filtering_remaps_source_indexes() {
        let matrix = DecodingMatrix::from_codebook(&demo_codebook(), true, false).unwrap();
        assert_eq!(matrix.barcode_count(), 2);
        assert_eq!(matrix.source_index(0), Some(0));
        assert_eq!(matrix.source_index(1), Some(1));
        assert_eq!(matrix.source_index(2), None);
    }

    #[test]
    fn all_blank_codebook_is_rejected() {
        let cb = Codebook::new(vec![BarcodeEntry::new("Blank-07", vec![1, 0])]).unwrap();
        let err = DecodingMatrix::from_codebook(&cb, true, false).unwrap_err();
        assert_eq!(err, CodebookError::AllBlank);
    }

    #[test]
    fn variant_tensor_shape_and_norms() {
        let matrix = DecodingMatrix::from_codebook(&demo_codebook(), false, true).unwrap();
        assert!(matrix.has_error_variants());
        let tensor = matrix.variants.as_ref().unwrap();
        assert_eq!(tensor.shape(), &[3, 5, 4]);
        for barcode in 0..3 {
            for variant in 0..5 {
                let row = tensor.slice(ndarray::s![barcode, variant, ..]);
                let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
                assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn nearest_matches_exact_pattern() {
        let matrix = DecodingMatrix::from_codebook(&demo_codebook(), false, false).unwrap();
        let inv = 1.0 / 2.0f64.sqrt();
        let hit = matrix.nearest(&[0.0, 0.0, inv, inv]);
        assert_eq!(hit.index, 1);
        assert_abs_diff_eq!(hit.distance, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn error_variants_recover_single_bit_flips() {
        let cb = Codebook::new(vec![
            BarcodeEntry::new("GeneA", vec![1, 1, 0, 0]),
            BarcodeEntry::new("GeneB", vec![0, 0, 1, 1]),
        ])
        .unwrap();
        // GeneA with bit 2 erroneously on.
        let corrupted = unit_normalized(&[1, 1, 1, 0]);
        let trace = corrupted.as_slice().unwrap();

        let plain = DecodingMatrix::from_codebook(&cb, false, false).unwrap();
        assert!(plain.nearest(trace).distance > 0.3);

        let tolerant = DecodingMatrix::from_codebook(&cb, false, true).unwrap();
        let hit = tolerant.nearest(trace);
        assert_eq!(hit.index, 0);
        assert_abs_diff_eq!(hit.distance, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn on_bit_lookup_follows_codebook() {
        let matrix = DecodingMatrix::from_codebook(&demo_codebook(), false, false).unwrap();
        assert!(matrix.is_on_bit(0, 0));
        assert!(!matrix.is_on_bit(0, 2));
        assert!(matrix.is_on_bit(1, 3));
    }
}
