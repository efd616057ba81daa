//! C ABI for the AWQ dequantize operator.
//!
//! Every entry point returns an `AwqStatus`; zero is success. Handles, descriptors and streams are
//! opaque nonzero ids; `0` is never a valid object.

use std::{
    ffi::c_void,
    panic::{catch_unwind, AssertUnwindSafe},
};

use awq_dequant::{
    AwqDequantizeDescriptor, AwqError, AwqStatus, DescriptorTable, Handle, RawBuffers, Result,
    Stream, TensorDesc,
};
use candle_core::{DType, DeviceLocation};
use once_cell::sync::Lazy;
use tracing::{debug, warn};

pub type AwqHandle = u64;
pub type AwqDescriptor = u64;
/// `0` selects synchronous execution.
pub type AwqStream = u64;

pub const AWQ_DTYPE_U32: u32 = 0;
pub const AWQ_DTYPE_F16: u32 = 1;
pub const AWQ_DTYPE_BF16: u32 = 2;
pub const AWQ_DTYPE_F32: u32 = 3;
pub const AWQ_DTYPE_I32: u32 = 4;

pub const AWQ_DEVICE_CPU: u32 = 0;
pub const AWQ_DEVICE_CUDA: u32 = 1;
pub const AWQ_DEVICE_METAL: u32 = 2;

/// Shape, dtype and device of one operand.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AwqTensorDesc {
    pub rows: usize,
    pub cols: usize,
    /// One of the `AWQ_DTYPE_*` codes.
    pub dtype: u32,
    /// One of the `AWQ_DEVICE_*` codes.
    pub device: u32,
    pub device_id: u32,
}

static HANDLES: Lazy<DescriptorTable<Handle>> = Lazy::new(DescriptorTable::new);
static DESCRIPTORS: Lazy<DescriptorTable<AwqDequantizeDescriptor>> =
    Lazy::new(DescriptorTable::new);
static STREAMS: Lazy<DescriptorTable<Stream>> = Lazy::new(DescriptorTable::new);

enum FfiError {
    Null(&'static str),
    Awq(AwqError),
}

impl From<AwqError> for FfiError {
    fn from(e: AwqError) -> Self {
        Self::Awq(e)
    }
}

/// Run `f`, reporting errors and panics as status codes.
fn guard<F>(name: &str, f: F) -> AwqStatus
where
    F: FnOnce() -> std::result::Result<(), FfiError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => AwqStatus::Success,
        Ok(Err(FfiError::Null(arg))) => {
            debug!("{name}: `{arg}` is null");
            AwqStatus::NullPointer
        }
        Ok(Err(FfiError::Awq(e))) => {
            debug!("{name}: {e}");
            e.status()
        }
        Err(_) => {
            debug!("{name}: panicked");
            AwqStatus::DeviceError
        }
    }
}

fn non_null<T>(arg: &'static str, ptr: *const T) -> std::result::Result<(), FfiError> {
    if ptr.is_null() {
        Err(FfiError::Null(arg))
    } else {
        Ok(())
    }
}

fn dtype_from_code(code: u32) -> Result<DType> {
    match code {
        AWQ_DTYPE_U32 => Ok(DType::U32),
        AWQ_DTYPE_F16 => Ok(DType::F16),
        AWQ_DTYPE_BF16 => Ok(DType::BF16),
        AWQ_DTYPE_F32 => Ok(DType::F32),
        AWQ_DTYPE_I32 => Ok(DType::I32),
        other => Err(AwqError::InvalidDtype(format!("unknown dtype code {other}"))),
    }
}

fn device_from_code(code: u32, id: u32) -> Result<DeviceLocation> {
    let gpu_id = id as usize;
    match code {
        AWQ_DEVICE_CPU => Ok(DeviceLocation::Cpu),
        AWQ_DEVICE_CUDA => Ok(DeviceLocation::Cuda { gpu_id }),
        AWQ_DEVICE_METAL => Ok(DeviceLocation::Metal { gpu_id }),
        other => Err(AwqError::Device(format!("unknown device code {other}"))),
    }
}

fn tensor_desc(desc: &AwqTensorDesc) -> Result<TensorDesc> {
    Ok(TensorDesc::new(desc.rows, desc.cols, dtype_from_code(desc.dtype)?)
        .on(device_from_code(desc.device, desc.device_id)?))
}

/// Create a handle for a device.
///
/// # Safety
/// `handle` must be null or valid for a write.
#[no_mangle]
pub unsafe extern "C" fn awq_create_handle(
    device: u32,
    device_id: u32,
    handle: *mut AwqHandle,
) -> AwqStatus {
    guard("awq_create_handle", || {
        non_null("handle", handle)?;
        let location = device_from_code(device, device_id)?;
        *handle = HANDLES.insert(Handle::from_location(location));
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn awq_destroy_handle(handle: AwqHandle) -> AwqStatus {
    guard("awq_destroy_handle", || {
        HANDLES.remove(handle)?;
        Ok(())
    })
}

/// Validate a problem and create a descriptor for it.
///
/// # Safety
/// `descriptor` must be null or valid for a write; each tensor descriptor must be null or point
/// to a valid `AwqTensorDesc`.
#[no_mangle]
pub unsafe extern "C" fn awq_create_descriptor(
    handle: AwqHandle,
    descriptor: *mut AwqDescriptor,
    y: *const AwqTensorDesc,
    qweight: *const AwqTensorDesc,
    qzeros: *const AwqTensorDesc,
    scales: *const AwqTensorDesc,
    group_size: i64,
) -> AwqStatus {
    guard("awq_create_descriptor", || {
        non_null("descriptor", descriptor)?;
        non_null("y", y)?;
        non_null("qweight", qweight)?;
        non_null("qzeros", qzeros)?;
        non_null("scales", scales)?;
        let handle = HANDLES.get(handle)?;
        let desc = AwqDequantizeDescriptor::create(
            &handle,
            &tensor_desc(&*y)?,
            &tensor_desc(&*qweight)?,
            &tensor_desc(&*qzeros)?,
            &tensor_desc(&*scales)?,
            group_size,
        )?;
        *descriptor = DESCRIPTORS.insert(desc);
        Ok(())
    })
}

/// Write the minimum workspace size, in bytes, to `size`.
///
/// # Safety
/// `size` must be null or valid for a write.
#[no_mangle]
pub unsafe extern "C" fn awq_get_workspace_size(
    descriptor: AwqDescriptor,
    size: *mut usize,
) -> AwqStatus {
    guard("awq_get_workspace_size", || {
        non_null("size", size)?;
        *size = DESCRIPTORS.get(descriptor)?.workspace_size();
        Ok(())
    })
}

/// Dequantize into `y`. With `stream == 0` this blocks until `y` is written; otherwise the work
/// is queued and completes by `awq_stream_synchronize`.
///
/// # Safety
/// Every buffer must be valid for the size implied by the descriptor's shapes and dtypes, and
/// `workspace` for `workspace_size` bytes. None of them may be touched by the caller until the
/// execution completes.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn awq_dequantize(
    descriptor: AwqDescriptor,
    workspace: *mut c_void,
    workspace_size: usize,
    y: *mut c_void,
    qweight: *const c_void,
    qzeros: *const c_void,
    scales: *const c_void,
    stream: AwqStream,
) -> AwqStatus {
    guard("awq_dequantize", || {
        let desc = DESCRIPTORS.get(descriptor)?;
        non_null("y", y)?;
        non_null("qweight", qweight)?;
        non_null("qzeros", qzeros)?;
        non_null("scales", scales)?;
        let buffers = RawBuffers {
            workspace: workspace.cast(),
            workspace_size: if workspace.is_null() { 0 } else { workspace_size },
            y,
            qweight: qweight.cast(),
            qzeros: qzeros.cast(),
            scales,
        };
        if stream == 0 {
            desc.execute_raw(buffers)?;
        } else {
            let stream = STREAMS.get(stream)?;
            // Size errors are reported now rather than at synchronize.
            let required = desc.workspace_size();
            if buffers.workspace_size < required {
                return Err(AwqError::InsufficientWorkspace {
                    required,
                    provided: buffers.workspace_size,
                }
                .into());
            }
            desc.enqueue_raw(&stream, buffers)?;
        }
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn awq_destroy_descriptor(descriptor: AwqDescriptor) -> AwqStatus {
    guard("awq_destroy_descriptor", || {
        DESCRIPTORS.remove(descriptor)?;
        Ok(())
    })
}

/// Create an in-order execution stream.
///
/// # Safety
/// `stream` must be null or valid for a write.
#[no_mangle]
pub unsafe extern "C" fn awq_create_stream(stream: *mut AwqStream) -> AwqStatus {
    guard("awq_create_stream", || {
        non_null("stream", stream)?;
        *stream = STREAMS.insert(Stream::new()?);
        Ok(())
    })
}

/// Block until every execution queued on `stream` has finished. Returns the status of the first
/// failed one, if any.
#[no_mangle]
pub extern "C" fn awq_stream_synchronize(stream: AwqStream) -> AwqStatus {
    guard("awq_stream_synchronize", || {
        STREAMS.get(stream)?.synchronize()?;
        Ok(())
    })
}

/// Destroy a stream after draining its queued work.
///
/// The status reflects the destruction only. A failure of queued work that was never observed
/// through `awq_stream_synchronize` is logged and discarded; synchronize first to receive it.
#[no_mangle]
pub extern "C" fn awq_destroy_stream(stream: AwqStream) -> AwqStatus {
    guard("awq_destroy_stream", || {
        let stream = STREAMS.remove(stream)?;
        if let Err(e) = stream.synchronize() {
            warn!("awq_destroy_stream: discarding failure of queued work: {e}");
        }
        Ok(())
    })
}
