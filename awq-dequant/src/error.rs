//! Error types and status codes for the AWQ dequantize operator.

use thiserror::Error;

/// Error type for every lifecycle operation of the operator.
///
/// Validation errors are produced eagerly when a descriptor is created. Execution only
/// fails for workspace, backend or buffer faults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AwqError {
    /// A shape is inconsistent with the AWQ packing layout or with the other tensors.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// A packed buffer is not 32-bit integer, or a scale/output buffer is not a supported float.
    #[error("invalid dtype: {0}")]
    InvalidDtype(String),

    /// The group size was zero or negative.
    #[error("invalid group size {0}, expected a strictly positive integer")]
    InvalidGroupSize(i64),

    /// The descriptor handle is null, unknown or already destroyed.
    #[error("invalid descriptor handle {0}")]
    InvalidDescriptor(u64),

    /// The caller provided less scratch memory than the descriptor reported.
    #[error("insufficient workspace: {required} bytes required, {provided} provided")]
    InsufficientWorkspace { required: usize, provided: usize },

    /// Backend failure or unsupported device.
    #[error("device error: {0}")]
    Device(String),
}

impl AwqError {
    /// Status code reported through the C ABI for this error.
    pub fn status(&self) -> AwqStatus {
        match self {
            Self::InvalidShape(_) => AwqStatus::InvalidShape,
            Self::InvalidDtype(_) => AwqStatus::InvalidDtype,
            Self::InvalidGroupSize(_) => AwqStatus::InvalidGroupSize,
            Self::InvalidDescriptor(_) => AwqStatus::InvalidDescriptor,
            Self::InsufficientWorkspace { .. } => AwqStatus::InsufficientWorkspace,
            Self::Device(_) => AwqStatus::DeviceError,
        }
    }
}

/// Convenience type alias for `std::result::Result<T, AwqError>`.
pub type Result<T> = std::result::Result<T, AwqError>;

/// Status codes of the operator interface. Zero is success.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AwqStatus {
    Success = 0,
    InvalidShape = 1,
    InvalidDtype = 2,
    InvalidGroupSize = 3,
    InvalidDescriptor = 4,
    InsufficientWorkspace = 5,
    DeviceError = 6,
    NullPointer = 7,
}

impl<T> From<&Result<T>> for AwqStatus {
    fn from(res: &Result<T>) -> Self {
        match res {
            Ok(_) => AwqStatus::Success,
            Err(e) => e.status(),
        }
    }
}

impl From<AwqError> for candle_core::Error {
    fn from(e: AwqError) -> Self {
        candle_core::Error::Msg(e.to_string()).bt()
    }
}
