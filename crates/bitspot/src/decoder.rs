//! Decoder facade: one codebook, one immutable matrix, `&self` methods.

use ndarray::Array3;
use tracing::info;

use crate::aligner::FovAligner;
use crate::codebook::{Codebook, CodebookError};
use crate::decode::{
    decode_stack, decode_stack_scored, DecodeConfig, DecodeError, DecodedImages, DecodedPlane,
};
use crate::extract::{extract_barcodes_with_index, ExtractConfig, ExtractError};
use crate::matrix::DecodingMatrix;
use crate::refactor::{extract_refactors, RefactorConfig, RefactorEstimate};
use crate::scorer::PixelScorer;
use crate::FeatureTable;

/// Matrix-construction options.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct DecoderOptions {
    /// Drop blank/control barcodes from the matrix; label values then index
    /// the filtered rows, see [`DecodingMatrix::source_index`].
    #[serde(default)]
    pub ignore_blanks: bool,
    /// Match pixels against single-bit-flip variants as well.
    #[serde(default)]
    pub include_errors: bool,
}

/// Pixel-level barcode decoder for one codebook.
///
/// Construction fixes the decoding matrix; every method takes `&self` and is
/// a pure function of its arguments, so one decoder can serve concurrent
/// fields of view.
#[derive(Debug, Clone)]
pub struct PixelDecoder {
    matrix: DecodingMatrix,
}

impl PixelDecoder {
    /// Build a decoder with default options: blanks kept, no error
    /// tolerance.
    pub fn new(codebook: &Codebook) -> Result<Self, CodebookError> {
        Self::with_options(codebook, DecoderOptions::default())
    }

    pub fn with_options(
        codebook: &Codebook,
        options: DecoderOptions,
    ) -> Result<Self, CodebookError> {
        let matrix = DecodingMatrix::from_codebook(
            codebook,
            options.ignore_blanks,
            options.include_errors,
        )?;
        info!(
            "pixel decoder ready: {} barcodes, {} bits, error-tolerant: {}",
            matrix.barcode_count(),
            matrix.bit_count(),
            matrix.has_error_variants()
        );
        Ok(Self { matrix })
    }

    /// Number of decodable barcodes (matrix rows).
    pub fn barcode_count(&self) -> usize {
        self.matrix.barcode_count()
    }

    /// Number of bits per barcode.
    pub fn bit_count(&self) -> usize {
        self.matrix.bit_count()
    }

    /// The underlying reference matrix.
    pub fn matrix(&self) -> &DecodingMatrix {
        &self.matrix
    }

    /// Hard-threshold decode of one (bit, row, column) intensity stack.
    pub fn decode_pixels(
        &self,
        stack: &Array3<f32>,
        config: &DecodeConfig,
    ) -> Result<DecodedPlane, DecodeError> {
        decode_stack(&self.matrix, stack, config)
    }

    /// Probability-assisted decode of one (bit, row, column) intensity stack.
    pub fn decode_pixels_scored(
        &self,
        stack: &Array3<f32>,
        config: &DecodeConfig,
        scorer: &dyn PixelScorer,
    ) -> Result<DecodedPlane, DecodeError> {
        decode_stack_scored(&self.matrix, stack, config, scorer)
    }

    /// Extract one feature row per connected spot decoded to
    /// `barcode_index`.
    pub fn extract_barcodes_with_index(
        &self,
        barcode_index: usize,
        images: DecodedImages<'_>,
        config: &ExtractConfig,
        aligner: Option<&dyn FovAligner>,
    ) -> Result<FeatureTable, ExtractError> {
        let got = images.bit_count();
        if got != self.bit_count() {
            return Err(ExtractError::BitCount {
                expected: self.bit_count(),
                got,
            });
        }
        extract_barcodes_with_index(barcode_index, images, config, aligner)
    }

    /// Estimate per-bit scale/background refactors from one decoded plane.
    pub fn extract_refactors(
        &self,
        plane: &DecodedPlane,
        config: &RefactorConfig,
    ) -> Result<RefactorEstimate, ExtractError> {
        extract_refactors(&self.matrix, plane, config)
    }
}
