//! Typed tensor facade shared between the synthesis stages and the backend.
//!
//! Stages assemble their model inputs as [`Tensor`] values and hand them to
//! an inference session wrapped in `Arc`, so a tensor produced by one stage
//! (the acoustic F0 curve, for example) can be consumed by another without a
//! copy. A tensor is written only while it is being built; afterwards it is
//! read-only.

use super::error::{DiffSingerError, Result};

/// Element type of a [`Tensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Float,
    Int64,
    Bool,
}

impl DType {
    pub fn byte_width(self) -> usize {
        match self {
            DType::Float => 4,
            DType::Int64 => 8,
            DType::Bool => 1,
        }
    }
}

/// Typed backing storage of a [`Tensor`].
#[derive(Debug, Clone)]
pub enum TensorData {
    Float(Vec<f32>),
    Int64(Vec<i64>),
    Bool(Vec<bool>),
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for i64 {}
    impl Sealed for bool {}
}

/// Types that can be stored as tensor elements.
pub trait Element: sealed::Sealed + Copy + Default + 'static {
    const DTYPE: DType;
    fn into_data(values: Vec<Self>) -> TensorData;
    fn as_slice(data: &TensorData) -> Option<&[Self]>;
    fn as_mut_slice(data: &mut TensorData) -> Option<&mut [Self]>;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;
            fn into_data(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }
            fn as_slice(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn as_mut_slice(data: &mut TensorData) -> Option<&mut [Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f32, DType::Float, Float);
impl_element!(i64, DType::Int64, Int64);
impl_element!(bool, DType::Bool, Bool);

/// An n-dimensional array of `Float`, `Int64` or `Bool` elements.
///
/// The empty shape denotes a scalar (one element, rank zero).
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<i64>,
    data: TensorData,
}

impl Tensor {
    /// Create a zero-initialized tensor of the given type and shape.
    pub fn zeros(dtype: DType, shape: Vec<i64>) -> Result<Tensor> {
        let count = checked_element_count(&shape)?;
        let data = match dtype {
            DType::Float => TensorData::Float(vec![0.0; count]),
            DType::Int64 => TensorData::Int64(vec![0; count]),
            DType::Bool => TensorData::Bool(vec![false; count]),
        };
        Ok(Tensor { shape, data })
    }

    /// Create a tensor of the given shape with every element set to `value`.
    pub fn filled<T: Element>(shape: Vec<i64>, value: T) -> Result<Tensor> {
        let count = checked_element_count(&shape)?;
        Ok(Tensor {
            shape,
            data: T::into_data(vec![value; count]),
        })
    }

    /// Create a rank-zero tensor holding a single value.
    pub fn scalar<T: Element>(value: T) -> Tensor {
        Tensor {
            shape: Vec::new(),
            data: T::into_data(vec![value]),
        }
    }

    /// Create a tensor from an owned vector. The vector length must match the
    /// element count implied by the shape.
    pub fn from_vec<T: Element>(shape: Vec<i64>, values: Vec<T>) -> Result<Tensor> {
        let count = checked_element_count(&shape)?;
        if values.len() != count {
            return Err(DiffSingerError::InvalidArgument(format!(
                "tensor data length {} does not match shape {:?} ({} elements)",
                values.len(),
                shape,
                count
            )));
        }
        Ok(Tensor {
            shape,
            data: T::into_data(values),
        })
    }

    /// Create a tensor by decoding raw little-endian bytes.
    pub fn from_raw_data(dtype: DType, shape: Vec<i64>, bytes: &[u8]) -> Result<Tensor> {
        let count = checked_element_count(&shape)?;
        let expected = count * dtype.byte_width();
        if bytes.len() != expected {
            return Err(DiffSingerError::InvalidArgument(format!(
                "raw tensor data is {} bytes, shape {:?} requires {}",
                bytes.len(),
                shape,
                expected
            )));
        }
        let data = match dtype {
            DType::Float => TensorData::Float(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::Int64 => TensorData::Int64(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DType::Bool => TensorData::Bool(bytes.iter().map(|&b| b != 0).collect()),
        };
        Ok(Tensor { shape, data })
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::Float(_) => DType::Float,
            TensorData::Int64(_) => DType::Int64,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn element_count(&self) -> usize {
        match &self.data {
            TensorData::Float(v) => v.len(),
            TensorData::Int64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.dtype().byte_width()
    }

    /// Read-only element view. Fails when `T` does not match the stored type.
    pub fn view<T: Element>(&self) -> Result<&[T]> {
        T::as_slice(&self.data).ok_or_else(|| {
            DiffSingerError::InvalidArgument(format!(
                "tensor element type mismatch: stored {:?}, requested {:?}",
                self.dtype(),
                T::DTYPE
            ))
        })
    }

    /// Mutable element view for filling a tensor while it is being built.
    pub fn data_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        let dtype = self.dtype();
        T::as_mut_slice(&mut self.data).ok_or_else(|| {
            DiffSingerError::InvalidArgument(format!(
                "tensor element type mismatch: stored {:?}, requested {:?}",
                dtype,
                T::DTYPE
            ))
        })
    }
}

fn checked_element_count(shape: &[i64]) -> Result<usize> {
    let mut count: usize = 1;
    for &dim in shape {
        if dim < 0 {
            return Err(DiffSingerError::InvalidArgument(format!(
                "tensor shape {:?} has a negative dimension",
                shape
            )));
        }
        count = count.checked_mul(dim as usize).ok_or_else(|| {
            DiffSingerError::InvalidArgument(format!("tensor shape {:?} overflows", shape))
        })?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::{DType, Tensor};

    #[test]
    fn scalar_has_rank_zero_and_one_element() {
        let t = Tensor::scalar(170i64);
        assert!(t.shape().is_empty());
        assert_eq!(t.element_count(), 1);
        assert_eq!(t.view::<i64>().unwrap(), &[170]);
    }

    #[test]
    fn filled_matches_shape() {
        let t = Tensor::filled(vec![1, 4], 1.0f32).unwrap();
        assert_eq!(t.element_count(), 4);
        assert_eq!(t.byte_size(), 16);
        assert_eq!(t.view::<f32>().unwrap(), &[1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn view_rejects_wrong_element_type() {
        let t = Tensor::filled(vec![2], 0i64).unwrap();
        assert!(t.view::<f32>().is_err());
    }

    #[test]
    fn from_vec_rejects_length_mismatch() {
        assert!(Tensor::from_vec(vec![1, 3], vec![1i64, 2]).is_err());
    }

    #[test]
    fn raw_data_decodes_little_endian_floats() {
        let mut bytes = Vec::new();
        for v in [1.5f32, -2.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let t = Tensor::from_raw_data(DType::Float, vec![1, 2], &bytes).unwrap();
        assert_eq!(t.view::<f32>().unwrap(), &[1.5, -2.0]);
    }
}
