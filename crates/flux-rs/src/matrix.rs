//! Buffer metadata shared by every operator.
//!
//! Storage is always owned by the caller. The runtime only records the
//! address and shape of an operand when a kernel is built.

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BackendResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I32,
}

impl DType {
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 => 8,
        }
    }

    pub fn c_type(self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::F64 => "double",
            DType::I32 => "int",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Decodes native-endian element bytes into `f64` host values.
    pub fn decode(self, bytes: &[u8]) -> Vec<f64> {
        match self {
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            DType::F64 => bytes
                .chunks_exact(8)
                .map(|c| f64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
            DType::I32 => bytes
                .chunks_exact(4)
                .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
        }
    }

    pub fn encode(self, values: &[f64]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * self.size_bytes());
        for &value in values {
            match self {
                DType::F32 => out.extend_from_slice(&(value as f32).to_ne_bytes()),
                DType::F64 => out.extend_from_slice(&value.to_ne_bytes()),
                DType::I32 => out.extend_from_slice(&(value as i32).to_ne_bytes()),
            }
        }
        out
    }
}

/// The (rows, cols, leading dimension, element type) tuple that decides
/// whether two buffers can take part in the same operation.
///
/// Layout is row-major: element `(r, c)` lives at `r * leaddim + c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixTraits {
    pub rows: usize,
    pub cols: usize,
    pub leaddim: usize,
    pub dtype: DType,
}

impl MatrixTraits {
    pub fn new(rows: usize, cols: usize, dtype: DType) -> Self {
        Self {
            rows,
            cols,
            leaddim: cols,
            dtype,
        }
    }

    pub fn with_leaddim(mut self, leaddim: usize) -> Self {
        assert!(
            leaddim >= self.cols,
            "leading dimension {leaddim} is smaller than column count {}",
            self.cols
        );
        self.leaddim = leaddim;
        self
    }

    pub fn nbytes(&self) -> usize {
        self.rows * self.leaddim * self.dtype.size_bytes()
    }

    pub fn offset(&self, row: usize, col: usize) -> usize {
        row * self.leaddim + col
    }
}

/// Checks that every traits tuple equals the first one and returns it.
pub fn ensure_compatible<'a, I>(traits: I) -> BackendResult<MatrixTraits>
where
    I: IntoIterator<Item = &'a MatrixTraits>,
{
    let mut iter = traits.into_iter();
    let first = *iter
        .next()
        .ok_or_else(|| BackendError::incompatible("operation needs at least one operand"))?;
    for other in iter {
        if *other != first {
            return Err(BackendError::incompatible(format!(
                "incompatible matrix types: {first:?} vs {other:?}"
            )));
        }
    }
    Ok(first)
}

/// A dense strided operand owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matrix {
    traits: MatrixTraits,
    addr: u64,
}

impl Matrix {
    pub fn new(addr: u64, traits: MatrixTraits) -> Self {
        Self { traits, addr }
    }

    pub fn traits(&self) -> &MatrixTraits {
        &self.traits
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn rows(&self) -> usize {
        self.traits.rows
    }

    pub fn cols(&self) -> usize {
        self.traits.cols
    }

    pub fn leaddim(&self) -> usize {
        self.traits.leaddim
    }

    pub fn dtype(&self) -> DType {
        self.traits.dtype
    }

    pub fn nbytes(&self) -> usize {
        self.traits.nbytes()
    }
}

/// An operand gathered through an index array, optionally with per-component
/// column and row stride arrays (interface and boundary data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    pub data: u64,
    pub vix: u64,
    pub vcstri: Option<u64>,
    pub vrstri: Option<u64>,
    pub dtype: DType,
}

impl View {
    pub fn new(data: u64, vix: u64, dtype: DType) -> Self {
        Self {
            data,
            vix,
            vcstri: None,
            vrstri: None,
            dtype,
        }
    }

    pub fn with_col_strides(mut self, vcstri: u64) -> Self {
        self.vcstri = Some(vcstri);
        self
    }

    pub fn with_row_strides(mut self, vrstri: u64) -> Self {
        self.vrstri = Some(vrstri);
        self
    }

    pub fn ncdim(&self) -> u8 {
        match (self.vcstri, self.vrstri) {
            (_, Some(_)) => 2,
            (Some(_), None) => 1,
            (None, None) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_equality_decides_compatibility() {
        let a = MatrixTraits::new(8, 3, DType::F64);
        let b = MatrixTraits::new(8, 3, DType::F64);
        let c = MatrixTraits::new(8, 3, DType::F32);
        let d = MatrixTraits::new(8, 3, DType::F64).with_leaddim(4);

        assert_eq!(ensure_compatible([&a, &b]).unwrap(), a);
        assert!(ensure_compatible([&a, &c]).unwrap_err().is_incompatible());
        assert!(ensure_compatible([&a, &d]).unwrap_err().is_incompatible());
        assert!(ensure_compatible(std::iter::empty()).is_err());
    }

    #[test]
    fn nbytes_uses_leading_dimension() {
        let traits = MatrixTraits::new(10, 3, DType::F32).with_leaddim(4);
        assert_eq!(traits.nbytes(), 10 * 4 * 4);
        assert_eq!(traits.offset(2, 1), 9);
    }

    #[test]
    fn dtype_encoding_preserves_values() {
        let values = [1.5, -2.0, 0.25];
        for dtype in [DType::F32, DType::F64] {
            assert_eq!(dtype.decode(&dtype.encode(&values)), values.to_vec());
        }
        assert_eq!(DType::I32.decode(&DType::I32.encode(&[3.0, -7.0])), vec![3.0, -7.0]);
    }

    #[test]
    fn view_component_dimensionality_follows_stride_arrays() {
        let view = View::new(0x10, 0x20, DType::F64);
        assert_eq!(view.ncdim(), 0);
        assert_eq!(view.with_col_strides(0x30).ncdim(), 1);
        assert_eq!(view.with_col_strides(0x30).with_row_strides(0x40).ncdim(), 2);
    }
}
