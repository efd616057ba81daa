use std::{borrow::Cow, sync::Arc};

use candle_core::{CpuStorage, CustomOp3, DType, Layout, Result, Shape, Tensor};
use half::{bf16, f16};

use crate::{
    AwqDequantizeDescriptor, FloatDType, FloatSlice, FloatSliceMut, Handle, TensorDesc,
};

fn contiguous<'a, T>(name: &str, data: &'a [T], layout: &Layout) -> Result<&'a [T]> {
    match layout.contiguous_offsets() {
        Some((start, end)) => Ok(&data[start..end]),
        None => candle_core::bail!("`{name}` must be contiguous for AWQ dequantize"),
    }
}

/// Packed words as unsigned bits; signed storage is reinterpreted, not converted.
fn packed_words<'a>(
    name: &str,
    storage: &'a CpuStorage,
    layout: &Layout,
) -> Result<Cow<'a, [u32]>> {
    match storage {
        CpuStorage::U32(data) => Ok(Cow::Borrowed(contiguous(name, data, layout)?)),
        CpuStorage::I32(data) => Ok(Cow::Owned(
            contiguous(name, data, layout)?
                .iter()
                .map(|w| *w as u32)
                .collect(),
        )),
        _ => candle_core::bail!("`{name}` must be u32 or i32 for AWQ dequantize"),
    }
}

/// Dequantize `(qweight, qzeros, scales)` into an `n x m` tensor of the descriptor's output dtype.
pub(crate) struct AwqDequantizeOp {
    pub(crate) descriptor: Arc<AwqDequantizeDescriptor>,
}

impl CustomOp3 for AwqDequantizeOp {
    fn name(&self) -> &'static str {
        "awq-dequantize"
    }

    fn cpu_fwd(
        &self,
        qweight: &CpuStorage,
        l_qweight: &Layout,
        qzeros: &CpuStorage,
        l_qzeros: &Layout,
        scales: &CpuStorage,
        l_scales: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let info = self.descriptor.info();

        let qweight = packed_words("qweight", qweight, l_qweight)?;
        let qzeros = packed_words("qzeros", qzeros, l_qzeros)?;
        let scales = match scales {
            CpuStorage::F16(s) => FloatSlice::F16(contiguous("scales", s, l_scales)?),
            CpuStorage::BF16(s) => FloatSlice::BF16(contiguous("scales", s, l_scales)?),
            CpuStorage::F32(s) => FloatSlice::F32(contiguous("scales", s, l_scales)?),
            _ => candle_core::bail!("Dtype mismatch, expected one of f32, f16, bf16 scales"),
        };

        let mut workspace = vec![0u8; self.descriptor.workspace_size()];
        let len = info.n * info.m;
        let out = match info.out_dtype {
            FloatDType::F16 => {
                let mut out = vec![f16::ZERO; len];
                self.descriptor.execute(
                    &mut workspace,
                    FloatSliceMut::F16(&mut out),
                    &qweight,
                    &qzeros,
                    scales,
                )?;
                CpuStorage::F16(out)
            }
            FloatDType::BF16 => {
                let mut out = vec![bf16::ZERO; len];
                self.descriptor.execute(
                    &mut workspace,
                    FloatSliceMut::BF16(&mut out),
                    &qweight,
                    &qzeros,
                    scales,
                )?;
                CpuStorage::BF16(out)
            }
            FloatDType::F32 => {
                let mut out = vec![0f32; len];
                self.descriptor.execute(
                    &mut workspace,
                    FloatSliceMut::F32(&mut out),
                    &qweight,
                    &qzeros,
                    scales,
                )?;
                CpuStorage::F32(out)
            }
        };
        Ok((out, Shape::from_dims(&[info.n, info.m])))
    }
}

/// Dequantize AWQ-packed tensors on their device.
///
/// - `qweight`: `(n, m / 8)` u32 or i32
/// - `qzeros`: `(n / group_size, m / 8)` u32 or i32
/// - `scales`: `(n / group_size, m)` f16, bf16 or f32
///
/// Returns an `(n, m)` tensor of `out_dtype`.
pub fn awq_dequantize(
    qweight: &Tensor,
    qzeros: &Tensor,
    scales: &Tensor,
    group_size: usize,
    out_dtype: DType,
) -> Result<Tensor> {
    let qweight_desc = TensorDesc::from_tensor("qweight", qweight)?;
    let qzeros_desc = TensorDesc::from_tensor("qzeros", qzeros)?;
    let scales_desc = TensorDesc::from_tensor("scales", scales)?;
    let out_desc = TensorDesc::new(qweight_desc.rows(), scales_desc.cols(), out_dtype)
        .on(qweight_desc.device);

    let handle = Handle::new(qweight.device());
    let descriptor = AwqDequantizeDescriptor::create(
        &handle,
        &out_desc,
        &qweight_desc,
        &qzeros_desc,
        &scales_desc,
        group_size as i64,
    )?;
    qweight.apply_op3_no_bwd(
        qzeros,
        scales,
        &AwqDequantizeOp {
            descriptor: Arc::new(descriptor),
        },
    )
}
