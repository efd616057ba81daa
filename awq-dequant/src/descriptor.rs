use std::{ffi::c_void, sync::Arc};

use candle_core::{DType, Device, DeviceLocation};
use half::{bf16, f16};
use tracing::debug;

use crate::{
    awq::{
        kernel::{select_kernel, KernelFn, KernelShape},
        unpack::unpack_reordered_into,
        AWQ_PACK_FACTOR,
    },
    utils::log::once_log_info,
    AwqError, FloatDType, FloatSlice, FloatSliceMut, Result, Stream, TensorDesc,
};

/// Device context descriptors are created against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    device: DeviceLocation,
}

impl Handle {
    pub fn new(device: &Device) -> Self {
        Self::from_location(device.location())
    }

    pub fn from_location(device: DeviceLocation) -> Self {
        Self { device }
    }

    pub fn cpu() -> Self {
        Self::from_location(DeviceLocation::Cpu)
    }

    pub fn location(&self) -> DeviceLocation {
        self.device
    }
}

const PACKED_WORD_BYTES: usize = 4;

/// Packed weights and zero-points are 32-bit words; the sign is irrelevant to nibble extraction.
pub fn is_packed_dtype(dtype: DType) -> bool {
    matches!(dtype, DType::U32 | DType::I32)
}

/// Validated problem configuration. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwqDequantizeInfo {
    pub out_dtype: FloatDType,
    pub scale_dtype: FloatDType,
    pub group_size: usize,
    /// Output rows.
    pub n: usize,
    /// Output columns, unpacked.
    pub m: usize,
    pub m_packed: usize,
    /// Rows of the zero-point and scale matrices.
    pub zeros_n: usize,
}

impl AwqDequantizeInfo {
    pub fn create(
        y: &TensorDesc,
        qweight: &TensorDesc,
        qzeros: &TensorDesc,
        scales: &TensorDesc,
        group_size: i64,
    ) -> Result<Self> {
        if group_size <= 0 {
            return Err(AwqError::InvalidGroupSize(group_size));
        }
        let group_size = group_size as usize;

        for (name, desc) in [("qweight", qweight), ("qzeros", qzeros)] {
            if !is_packed_dtype(desc.dtype) {
                return Err(AwqError::InvalidDtype(format!(
                    "`{name}` must hold packed 32-bit integer words, got {:?}",
                    desc.dtype
                )));
            }
        }
        let out_dtype = FloatDType::try_from(y.dtype)?;
        let scale_dtype = FloatDType::try_from(scales.dtype)?;

        let (n, m) = y.dims;
        if m % AWQ_PACK_FACTOR != 0 {
            return Err(AwqError::InvalidShape(format!(
                "output columns must be a multiple of {AWQ_PACK_FACTOR}, got {m}"
            )));
        }
        let m_packed = m / AWQ_PACK_FACTOR;
        if qweight.dims != (n, m_packed) {
            return Err(AwqError::InvalidShape(format!(
                "`qweight` must be {:?} for an output of {:?}, got {:?}",
                (n, m_packed),
                y.dims,
                qweight.dims
            )));
        }
        if n % group_size != 0 {
            return Err(AwqError::InvalidShape(format!(
                "output rows ({n}) must be divisible by the group size ({group_size})"
            )));
        }
        let zeros_n = qzeros.rows();
        if zeros_n != n / group_size {
            return Err(AwqError::InvalidShape(format!(
                "`qzeros` must have {} rows for {n} rows in groups of {group_size}, got {zeros_n}",
                n / group_size
            )));
        }
        if qzeros.cols() != m_packed {
            return Err(AwqError::InvalidShape(format!(
                "`qzeros` must have {m_packed} columns, got {}",
                qzeros.cols()
            )));
        }
        if scales.dims != (zeros_n, m) {
            return Err(AwqError::InvalidShape(format!(
                "`scales` must be {:?}, got {:?}",
                (zeros_n, m),
                scales.dims
            )));
        }

        for (name, elems, elem_size) in [
            ("y", n.checked_mul(m), out_dtype.size_in_bytes()),
            ("qweight", n.checked_mul(m_packed), PACKED_WORD_BYTES),
            ("qzeros", zeros_n.checked_mul(m_packed), PACKED_WORD_BYTES),
            ("scales", zeros_n.checked_mul(m), scale_dtype.size_in_bytes()),
            ("workspace", zeros_n.checked_mul(m), 1),
        ] {
            let bytes = elems.and_then(|e| e.checked_mul(elem_size));
            if !bytes.is_some_and(|b| b <= isize::MAX as usize) {
                return Err(AwqError::InvalidShape(format!(
                    "`{name}` of {n}x{m} (group size {group_size}) exceeds the addressable size"
                )));
            }
        }

        Ok(Self {
            out_dtype,
            scale_dtype,
            group_size,
            n,
            m,
            m_packed,
            zeros_n,
        })
    }

    pub fn kernel_shape(&self) -> KernelShape {
        KernelShape {
            rows: self.n,
            cols: self.m,
            group_size: self.group_size,
        }
    }

    /// Bytes of scratch space: the unpacked, reordered zero-points, one nibble per byte.
    pub fn workspace_size(&self) -> usize {
        self.zeros_n * self.m
    }
}

/// Raw buffers of one execution, as handed over through the C ABI.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffers {
    pub workspace: *mut u8,
    pub workspace_size: usize,
    pub y: *mut c_void,
    pub qweight: *const u32,
    pub qzeros: *const u32,
    pub scales: *const c_void,
}

// SAFETY: the caller of `enqueue_raw` guarantees exclusive access to these buffers until the
// stream is synchronized.
unsafe impl Send for RawBuffers {}

unsafe fn slice_or_empty<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if len == 0 || ptr.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len)
    }
}

unsafe fn slice_or_empty_mut<'a, T>(ptr: *mut T, len: usize) -> &'a mut [T] {
    if len == 0 || ptr.is_null() {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(ptr, len)
    }
}

/// A created AWQ dequantize operator: validated configuration plus the kernel resolved for its
/// dtypes. Descriptors are immutable and may be shared between threads; concurrent executions
/// must each use their own workspace.
#[derive(Debug, Clone)]
pub struct AwqDequantizeDescriptor {
    info: AwqDequantizeInfo,
    device: DeviceLocation,
    kernel: KernelFn,
}

impl AwqDequantizeDescriptor {
    pub fn create(
        handle: &Handle,
        y: &TensorDesc,
        qweight: &TensorDesc,
        qzeros: &TensorDesc,
        scales: &TensorDesc,
        group_size: i64,
    ) -> Result<Self> {
        if group_size <= 0 {
            return Err(AwqError::InvalidGroupSize(group_size));
        }
        let device = handle.location();
        if !matches!(device, DeviceLocation::Cpu) {
            return Err(AwqError::Device(format!(
                "AWQ dequantize has no kernel for {device:?}"
            )));
        }
        let info = AwqDequantizeInfo::create(y, qweight, qzeros, scales, group_size)?;
        let kernel = select_kernel(info.out_dtype, info.scale_dtype);
        once_log_info(format!(
            "AWQ dequantize using the CPU kernel for {:?} outputs with {:?} scales.",
            info.out_dtype, info.scale_dtype
        ));
        debug!(
            "Created AWQ dequantize descriptor: n={}, m={}, group_size={}, groups={}",
            info.n, info.m, info.group_size, info.zeros_n
        );
        Ok(Self {
            info,
            device,
            kernel,
        })
    }

    pub fn info(&self) -> &AwqDequantizeInfo {
        &self.info
    }

    pub fn device(&self) -> DeviceLocation {
        self.device
    }

    /// Minimum workspace, in bytes, that `execute` requires.
    pub fn workspace_size(&self) -> usize {
        self.info.workspace_size()
    }

    /// Dequantize `qweight` into `y`.
    ///
    /// Buffers are dense row-major; they may be longer than the described shapes, in which case
    /// only the leading elements are used.
    pub fn execute(
        &self,
        workspace: &mut [u8],
        y: FloatSliceMut<'_>,
        qweight: &[u32],
        qzeros: &[u32],
        scales: FloatSlice<'_>,
    ) -> Result<()> {
        let info = &self.info;
        let required = self.workspace_size();
        if workspace.len() < required {
            return Err(AwqError::InsufficientWorkspace {
                required,
                provided: workspace.len(),
            });
        }
        if y.dtype() != info.out_dtype {
            return Err(AwqError::InvalidDtype(format!(
                "output buffer is {:?}, descriptor expects {:?}",
                y.dtype(),
                info.out_dtype
            )));
        }
        if scales.dtype() != info.scale_dtype {
            return Err(AwqError::InvalidDtype(format!(
                "scale buffer is {:?}, descriptor expects {:?}",
                scales.dtype(),
                info.scale_dtype
            )));
        }
        let y_len = info.n * info.m;
        let qweight_len = info.n * info.m_packed;
        let qzeros_len = info.zeros_n * info.m_packed;
        let scales_len = info.zeros_n * info.m;
        for (name, len, expected) in [
            ("y", y.len(), y_len),
            ("qweight", qweight.len(), qweight_len),
            ("qzeros", qzeros.len(), qzeros_len),
            ("scales", scales.len(), scales_len),
        ] {
            if len < expected {
                return Err(AwqError::InvalidShape(format!(
                    "`{name}` holds {len} elements, expected {expected}"
                )));
            }
        }

        let zeros = &mut workspace[..required];
        unpack_reordered_into(zeros, &qzeros[..qzeros_len], info.m_packed);

        debug!(
            "Executing AWQ dequantize: n={}, m={}, group_size={}",
            info.n, info.m, info.group_size
        );
        (self.kernel)(
            &info.kernel_shape(),
            y.prefix(y_len),
            &qweight[..qweight_len],
            zeros,
            scales.prefix(scales_len),
        )
    }

    /// Execute over raw pointers, deriving every buffer length from the descriptor.
    ///
    /// # Safety
    /// Each non-null pointer must be valid for the length implied by the descriptor's shapes and
    /// dtypes (`workspace` for `workspace_size` bytes), properly aligned, and not accessed by
    /// anything else for the duration of the call.
    pub unsafe fn execute_raw(&self, buffers: RawBuffers) -> Result<()> {
        let info = &self.info;
        let workspace = slice_or_empty_mut(buffers.workspace, buffers.workspace_size);
        let y_len = info.n * info.m;
        let scales_len = info.zeros_n * info.m;
        let y = match info.out_dtype {
            FloatDType::F16 => FloatSliceMut::F16(slice_or_empty_mut(buffers.y as *mut f16, y_len)),
            FloatDType::BF16 => {
                FloatSliceMut::BF16(slice_or_empty_mut(buffers.y as *mut bf16, y_len))
            }
            FloatDType::F32 => FloatSliceMut::F32(slice_or_empty_mut(buffers.y as *mut f32, y_len)),
        };
        let scales = match info.scale_dtype {
            FloatDType::F16 => {
                FloatSlice::F16(slice_or_empty(buffers.scales as *const f16, scales_len))
            }
            FloatDType::BF16 => {
                FloatSlice::BF16(slice_or_empty(buffers.scales as *const bf16, scales_len))
            }
            FloatDType::F32 => {
                FloatSlice::F32(slice_or_empty(buffers.scales as *const f32, scales_len))
            }
        };
        let qweight = slice_or_empty(buffers.qweight, info.n * info.m_packed);
        let qzeros = slice_or_empty(buffers.qzeros, info.zeros_n * info.m_packed);
        self.execute(workspace, y, qweight, qzeros, scales)
    }

    /// Queue an execution over raw pointers on `stream`. Completion is observed with
    /// `Stream::synchronize`, which also reports a failure of the queued execution.
    ///
    /// # Safety
    /// Same contract as `execute_raw`, extended until `stream.synchronize()` returns.
    pub unsafe fn enqueue_raw(self: &Arc<Self>, stream: &Stream, buffers: RawBuffers) -> Result<()> {
        let this = self.clone();
        stream.enqueue(move || {
            let buffers = buffers;
            // SAFETY: upheld by the caller of `enqueue_raw`.
            unsafe { this.execute_raw(buffers) }
        })
    }
}
