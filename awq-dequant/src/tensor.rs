use candle_core::{DType, DeviceLocation, Tensor};
use half::{bf16, f16};

use crate::{AwqError, Result};

/// Shape, dtype and location of one operand, as seen by descriptor creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDesc {
    pub dims: (usize, usize),
    pub dtype: DType,
    pub device: DeviceLocation,
}

impl TensorDesc {
    pub fn new(rows: usize, cols: usize, dtype: DType) -> Self {
        Self {
            dims: (rows, cols),
            dtype,
            device: DeviceLocation::Cpu,
        }
    }

    pub fn on(mut self, device: DeviceLocation) -> Self {
        self.device = device;
        self
    }

    /// Describe a rank-2 tensor. Other ranks are rejected with `InvalidShape`.
    pub fn from_tensor(name: &str, t: &Tensor) -> Result<Self> {
        let (rows, cols) = match t.dims() {
            [rows, cols] => (*rows, *cols),
            dims => {
                return Err(AwqError::InvalidShape(format!(
                    "`{name}` must be rank 2, got shape {dims:?}"
                )))
            }
        };
        Ok(Self {
            dims: (rows, cols),
            dtype: t.dtype(),
            device: t.device().location(),
        })
    }

    pub fn rows(&self) -> usize {
        self.dims.0
    }

    pub fn cols(&self) -> usize {
        self.dims.1
    }

    pub fn elem_count(&self) -> usize {
        self.dims.0 * self.dims.1
    }
}

/// Floating point storage types accepted for scales and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatDType {
    F16,
    BF16,
    F32,
}

impl FloatDType {
    pub fn size_in_bytes(&self) -> usize {
        self.as_dtype().size_in_bytes()
    }

    pub fn as_dtype(&self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

impl TryFrom<DType> for FloatDType {
    type Error = AwqError;

    fn try_from(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F16 => Ok(Self::F16),
            DType::BF16 => Ok(Self::BF16),
            DType::F32 => Ok(Self::F32),
            other => Err(AwqError::InvalidDtype(format!(
                "expected one of f16, bf16, f32, got {other:?}"
            ))),
        }
    }
}

/// A read-only floating point buffer.
#[derive(Debug, Clone, Copy)]
pub enum FloatSlice<'a> {
    F16(&'a [f16]),
    BF16(&'a [bf16]),
    F32(&'a [f32]),
}

impl FloatSlice<'_> {
    pub fn dtype(&self) -> FloatDType {
        match self {
            Self::F16(_) => FloatDType::F16,
            Self::BF16(_) => FloatDType::BF16,
            Self::F32(_) => FloatDType::F32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F16(s) => s.len(),
            Self::BF16(s) => s.len(),
            Self::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first `len` elements. Panics if `len > self.len()`.
    pub fn prefix(self, len: usize) -> Self {
        match self {
            Self::F16(s) => Self::F16(&s[..len]),
            Self::BF16(s) => Self::BF16(&s[..len]),
            Self::F32(s) => Self::F32(&s[..len]),
        }
    }
}

impl<'a> From<&'a [f16]> for FloatSlice<'a> {
    fn from(s: &'a [f16]) -> Self {
        Self::F16(s)
    }
}

impl<'a> From<&'a [bf16]> for FloatSlice<'a> {
    fn from(s: &'a [bf16]) -> Self {
        Self::BF16(s)
    }
}

impl<'a> From<&'a [f32]> for FloatSlice<'a> {
    fn from(s: &'a [f32]) -> Self {
        Self::F32(s)
    }
}

/// A writable floating point buffer.
#[derive(Debug)]
pub enum FloatSliceMut<'a> {
    F16(&'a mut [f16]),
    BF16(&'a mut [bf16]),
    F32(&'a mut [f32]),
}

impl FloatSliceMut<'_> {
    pub fn dtype(&self) -> FloatDType {
        match self {
            Self::F16(_) => FloatDType::F16,
            Self::BF16(_) => FloatDType::BF16,
            Self::F32(_) => FloatDType::F32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F16(s) => s.len(),
            Self::BF16(s) => s.len(),
            Self::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first `len` elements. Panics if `len > self.len()`.
    pub fn prefix(self, len: usize) -> Self {
        match self {
            Self::F16(s) => Self::F16(&mut s[..len]),
            Self::BF16(s) => Self::BF16(&mut s[..len]),
            Self::F32(s) => Self::F32(&mut s[..len]),
        }
    }
}

impl<'a> From<&'a mut [f16]> for FloatSliceMut<'a> {
    fn from(s: &'a mut [f16]) -> Self {
        Self::F16(s)
    }
}

impl<'a> From<&'a mut [bf16]> for FloatSliceMut<'a> {
    fn from(s: &'a mut [bf16]) -> Self {
        Self::BF16(s)
    }
}

impl<'a> From<&'a mut [f32]> for FloatSliceMut<'a> {
    fn from(s: &'a mut [f32]) -> Self {
        Self::F32(s)
    }
}
