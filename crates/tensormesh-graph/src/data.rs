//! Typed byte buffers and f64 widen/narrow conversion.
//!
//! Values cross the wire as a raw f64 array plus a dtype tag; each
//! endpoint narrows to its declared dtype on receipt and widens back
//! to f64 when serving. Narrowing follows `as`-cast semantics.

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::GraphError;
use crate::shape::Shape;

/// A tensor value: element dtype plus exactly
/// `n_elems * dtype.size_bytes()` little-endian bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    dtype: DType,
    bytes: Vec<u8>,
}

impl TensorData {
    /// A zero-filled buffer for the given shape and dtype.
    #[must_use]
    pub fn zeroed(dtype: DType, shape: &Shape) -> Self {
        Self {
            dtype,
            bytes: vec![0; shape.n_elems() * dtype.size_bytes()],
        }
    }

    /// Narrow an f64 slice into a typed buffer.
    pub fn from_f64s(dtype: DType, values: &[f64]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * dtype.size_bytes());
        for &v in values {
            match dtype {
                DType::F32 => bytes.extend_from_slice(&(v as f32).to_le_bytes()),
                DType::F64 => bytes.extend_from_slice(&v.to_le_bytes()),
                DType::I32 => bytes.extend_from_slice(&(v as i32).to_le_bytes()),
                DType::I64 => bytes.extend_from_slice(&(v as i64).to_le_bytes()),
            }
        }
        Self { dtype, bytes }
    }

    /// Widen the buffer back to f64s.
    #[must_use]
    pub fn to_f64s(&self) -> Vec<f64> {
        let step = self.dtype.size_bytes();
        self.bytes
            .chunks_exact(step)
            .map(|c| match self.dtype {
                DType::F32 => f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                DType::F64 => f64::from_le_bytes([
                    c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                ]),
                DType::I32 => f64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                #[allow(clippy::cast_precision_loss)]
                DType::I64 => i64::from_le_bytes([
                    c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                ]) as f64,
            })
            .collect()
    }

    /// Element dtype of this buffer.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Raw little-endian bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of elements in the buffer.
    #[must_use]
    pub fn n_elems(&self) -> usize {
        self.bytes.len() / self.dtype.size_bytes()
    }

    /// Check the buffer against an expected shape.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::BufferSize`] on a length mismatch.
    pub fn check_shape(&self, shape: &Shape) -> Result<(), GraphError> {
        let expected = shape.n_elems() * self.dtype.size_bytes();
        if self.bytes.len() != expected {
            return Err(GraphError::BufferSize {
                got: self.bytes.len(),
                expected,
            });
        }
        Ok(())
    }
}
