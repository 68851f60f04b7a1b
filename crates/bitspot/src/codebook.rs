//! Barcode codebook: the reference table for one experiment.
//!
//! A codebook lists every target with its fixed-length on/off bit pattern
//! across imaging rounds. It is validated once at construction and never
//! mutated afterwards; the decoder derives its matching matrix from it.

use std::path::Path;

use serde::{Deserialize, Serialize};

// ── Error type ─────────────────────────────────────────────────────────────

/// Errors raised while validating a codebook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodebookError {
    /// The codebook contains no barcodes at all.
    Empty,
    /// The first barcode has an empty bit vector.
    ZeroBits,
    /// A barcode's bit vector length disagrees with the first entry.
    RaggedEntry {
        /// Index of the offending barcode.
        index: usize,
        /// Bit count established by the first entry.
        expected: usize,
        /// Bit count found on this entry.
        got: usize,
    },
    /// A bit value other than 0 or 1.
    NonBinaryBit {
        /// Index of the offending barcode.
        index: usize,
        /// Bit position within the barcode.
        bit: usize,
        /// The value found.
        value: u8,
    },
    /// Ignoring blanks left nothing to match against.
    AllBlank,
}

impl std::fmt::Display for CodebookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "codebook has no barcodes"),
            Self::ZeroBits => write!(f, "codebook barcodes must have at least one bit"),
            Self::RaggedEntry {
                index,
                expected,
                got,
            } => write!(
                f,
                "barcode {} has {} bits, expected {}",
                index, got, expected
            ),
            Self::NonBinaryBit { index, bit, value } => write!(
                f,
                "barcode {} bit {} is {}, expected 0 or 1",
                index, bit, value
            ),
            Self::AllBlank => write!(f, "codebook contains only blank barcodes"),
        }
    }
}

impl std::error::Error for CodebookError {}

// ── Types ──────────────────────────────────────────────────────────────────

/// One codebook entry: a target name plus its bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarcodeEntry {
    pub name: String,
    pub bits: Vec<u8>,
}

impl BarcodeEntry {
    pub fn new(name: impl Into<String>, bits: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bits,
        }
    }
}

/// Validated, immutable barcode table.
#[derive(Debug, Clone)]
pub struct Codebook {
    name: String,
    entries: Vec<BarcodeEntry>,
    bit_count: usize,
}

/// On-disk codebook document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CodebookSpec {
    name: String,
    barcodes: Vec<BarcodeEntry>,
}

impl Codebook {
    /// Build a codebook from entries, validating shape and bit values.
    pub fn new(entries: Vec<BarcodeEntry>) -> Result<Self, CodebookError> {
        Self::with_name(String::new(), entries)
    }

    /// Build a named codebook from entries.
    pub fn with_name(
        name: impl Into<String>,
        entries: Vec<BarcodeEntry>,
    ) -> Result<Self, CodebookError> {
        let first = entries.first().ok_or(CodebookError::Empty)?;
        let bit_count = first.bits.len();
        if bit_count == 0 {
            return Err(CodebookError::ZeroBits);
        }

        for (index, entry) in entries.iter().enumerate() {
            if entry.bits.len() != bit_count {
                return Err(CodebookError::RaggedEntry {
                    index,
                    expected: bit_count,
                    got: entry.bits.len(),
                });
            }
            for (bit, &value) in entry.bits.iter().enumerate() {
                if value > 1 {
                    return Err(CodebookError::NonBinaryBit { index, bit, value });
                }
            }
        }

        Ok(Self {
            name: name.into(),
            entries,
            bit_count,
        })
    }

    /// Load a codebook from a JSON document on disk.
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// Parse a codebook from a JSON document.
    pub fn from_json_str(data: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let spec: CodebookSpec = serde_json::from_str(data)?;
        Self::with_name(spec.name, spec.barcodes).map_err(Into::into)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of barcodes B.
    pub fn barcode_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of bits K per barcode.
    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    /// Target name for a barcode index.
    pub fn barcode_name(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|e| e.name.as_str())
    }

    /// Bit pattern for a barcode index.
    pub fn bits(&self, index: usize) -> Option<&[u8]> {
        self.entries.get(index).map(|e| e.bits.as_slice())
    }

    /// Iterator over all entries in codebook order.
    pub fn entries(&self) -> impl Iterator<Item = &BarcodeEntry> + '_ {
        self.entries.iter()
    }

    /// Whether the entry at `index` is a blank/control barcode.
    ///
    /// Blanks are recognized by name: any entry whose name contains
    /// "blank" (case-insensitive) encodes no real target.
    pub fn is_blank(&self, index: usize) -> bool {
        self.entries
            .get(index)
            .is_some_and(|e| e.name.to_ascii_lowercase().contains("blank"))
    }

    /// Indexes of all blank/control barcodes.
    pub fn blank_indexes(&self) -> Vec<usize> {
        (0..self.entries.len())
            .filter(|&i| self.is_blank(i))
            .collect()
    }
}
