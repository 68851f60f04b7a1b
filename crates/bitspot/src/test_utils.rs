//! Shared fixtures for decode, extraction, and refactor tests.
//!
//! Consolidated here so the per-module tests agree on one pair of reference
//! codebooks and one synthetic spot image instead of re-painting their own.

use std::ops::Range;

use ndarray::{Array2, Array3};

use crate::codebook::{BarcodeEntry, Codebook};
use crate::decode::DecodedPlane;
use crate::matrix::DecodingMatrix;

/// Minimal two-bit codebook: barcode 0 = [1,0], barcode 1 = [0,1].
pub(crate) fn two_bit_codebook() -> Codebook {
    Codebook::new(vec![
        BarcodeEntry::new("GeneA", vec![1, 0]),
        BarcodeEntry::new("GeneB", vec![0, 1]),
    ])
    .unwrap()
}

pub(crate) fn two_bit_matrix() -> DecodingMatrix {
    DecodingMatrix::from_codebook(&two_bit_codebook(), false, false).unwrap()
}

/// Four-bit codebook with two on-bits per barcode.
pub(crate) fn demo_codebook() -> Codebook {
    Codebook::new(vec![
        BarcodeEntry::new("GeneA", vec![1, 1, 0, 0]),
        BarcodeEntry::new("GeneB", vec![0, 0, 1, 1]),
        BarcodeEntry::new("GeneC", vec![1, 0, 1, 0]),
        BarcodeEntry::new("GeneD", vec![0, 1, 0, 1]),
    ])
    .unwrap()
}

pub(crate) fn demo_matrix() -> DecodingMatrix {
    DecodingMatrix::from_codebook(&demo_codebook(), false, false).unwrap()
}

/// Fill a rectangular patch of one bit-plane with a constant intensity.
pub(crate) fn paint_block(
    stack: &mut Array3<f32>,
    bit: usize,
    rows: Range<usize>,
    cols: Range<usize>,
    value: f32,
) {
    for row in rows {
        for col in cols.clone() {
            stack[[bit, row, col]] = value;
        }
    }
}

/// 4×4 two-bit stack with a centered 2×2 block lit on bit 0 at intensity 5.
pub(crate) fn block_stack() -> Array3<f32> {
    let mut stack = Array3::zeros((2, 4, 4));
    paint_block(&mut stack, 0, 1..3, 1..3, 5.0);
    stack
}

/// Decoded plane built directly from a label image: unit magnitudes, zero
/// traces and distances. Tests overwrite the channels they care about.
pub(crate) fn labeled_plane(labels: Array2<i32>, bits: usize) -> DecodedPlane {
    let (height, width) = labels.dim();
    DecodedPlane {
        labels,
        magnitudes: Array2::ones((height, width)),
        traces: Array3::zeros((bits, height, width)),
        distances: Array2::zeros((height, width)),
        probabilities: None,
    }
}
