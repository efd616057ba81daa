use candle_core::WithDType;
use half::{bf16, f16};
use rayon::iter::{IndexedParallelIterator, ParallelIterator};
use rayon::slice::{ParallelSlice, ParallelSliceMut};

use super::{expand::GroupedRows, unpack::unpack_reordered, AWQ_PACK_FACTOR};
use crate::{AwqError, FloatDType, FloatSlice, FloatSliceMut, Result};

/// Storage types the kernel can read scales from and write outputs to.
pub trait AwqFloat: WithDType {
    const FLOAT_DTYPE: FloatDType;

    fn view<'a>(s: FloatSlice<'a>) -> Option<&'a [Self]>;
    fn view_mut<'a>(s: FloatSliceMut<'a>) -> Option<&'a mut [Self]>;
}

macro_rules! awq_float {
    ($t:ty, $variant:ident) => {
        impl AwqFloat for $t {
            const FLOAT_DTYPE: FloatDType = FloatDType::$variant;

            fn view<'a>(s: FloatSlice<'a>) -> Option<&'a [Self]> {
                match s {
                    FloatSlice::$variant(s) => Some(s),
                    _ => None,
                }
            }

            fn view_mut<'a>(s: FloatSliceMut<'a>) -> Option<&'a mut [Self]> {
                match s {
                    FloatSliceMut::$variant(s) => Some(s),
                    _ => None,
                }
            }
        }
    };
}

awq_float!(f16, F16);
awq_float!(bf16, BF16);
awq_float!(f32, F32);

/// Problem size of one dequantization: `rows x cols` output, `rows / group_size` groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelShape {
    pub rows: usize,
    pub cols: usize,
    pub group_size: usize,
}

impl KernelShape {
    pub fn cols_packed(&self) -> usize {
        self.cols / AWQ_PACK_FACTOR
    }

    pub fn groups(&self) -> usize {
        self.rows / self.group_size
    }
}

/// Dequantize into `out` with the zero-points already unpacked and reordered in `zeros`
/// (`groups x cols`, one nibble per byte).
///
/// `out[r][c] = (w[r][c] - zeros[r / group_size][c]) * scales[r / group_size][c]`
pub fn dequantize_rows<O: WithDType, S: WithDType>(
    shape: &KernelShape,
    out: &mut [O],
    qweight: &[u32],
    zeros: &[u8],
    scales: &[S],
) {
    let cols = shape.cols;
    let cols_packed = shape.cols_packed();
    if cols == 0 || shape.rows == 0 {
        return;
    }
    let zeros = GroupedRows::new(zeros, cols, shape.group_size);
    let scales = GroupedRows::new(scales, cols, shape.group_size);

    out.par_chunks_mut(cols)
        .zip(qweight.par_chunks(cols_packed))
        .enumerate()
        .for_each(|(r, (out_row, w_row))| {
            let z_row = zeros.row(r);
            let s_row = scales.row(r);
            for (block, word) in w_row.iter().enumerate() {
                let base = block * AWQ_PACK_FACTOR;
                let w = unpack_reordered(*word);
                for (slot, q) in w.iter().enumerate() {
                    let c = base + slot;
                    let diff = *q as i32 - z_row[c] as i32;
                    // Exact in f64 for every supported scale type, so narrowing rounds once.
                    out_row[c] = O::from_f64(diff as f64 * s_row[c].to_f64());
                }
            }
        });
}

/// Monomorphized kernel entry point for one (output, scale) dtype pair.
pub type KernelFn =
    fn(&KernelShape, FloatSliceMut<'_>, &[u32], &[u8], FloatSlice<'_>) -> Result<()>;

fn run<O: AwqFloat, S: AwqFloat>(
    shape: &KernelShape,
    out: FloatSliceMut<'_>,
    qweight: &[u32],
    zeros: &[u8],
    scales: FloatSlice<'_>,
) -> Result<()> {
    let out_dtype = out.dtype();
    let scale_dtype = scales.dtype();
    let out = O::view_mut(out).ok_or_else(|| {
        AwqError::InvalidDtype(format!(
            "output buffer is {out_dtype:?}, descriptor expects {:?}",
            O::FLOAT_DTYPE
        ))
    })?;
    let scales = S::view(scales).ok_or_else(|| {
        AwqError::InvalidDtype(format!(
            "scale buffer is {scale_dtype:?}, descriptor expects {:?}",
            S::FLOAT_DTYPE
        ))
    })?;
    dequantize_rows(shape, out, qweight, zeros, scales);
    Ok(())
}

/// Resolve the kernel for an (output, scale) dtype pair.
pub fn select_kernel(out: FloatDType, scale: FloatDType) -> KernelFn {
    match (out, scale) {
        (FloatDType::F16, FloatDType::F16) => run::<f16, f16>,
        (FloatDType::F16, FloatDType::BF16) => run::<f16, bf16>,
        (FloatDType::F16, FloatDType::F32) => run::<f16, f32>,
        (FloatDType::BF16, FloatDType::F16) => run::<bf16, f16>,
        (FloatDType::BF16, FloatDType::BF16) => run::<bf16, bf16>,
        (FloatDType::BF16, FloatDType::F32) => run::<bf16, f32>,
        (FloatDType::F32, FloatDType::F16) => run::<f32, f16>,
        (FloatDType::F32, FloatDType::BF16) => run::<f32, bf16>,
        (FloatDType::F32, FloatDType::F32) => run::<f32, f32>,
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, WithDType};
    use half::{bf16, f16};

    use super::{dequantize_rows, select_kernel, AwqFloat, KernelShape};
    use crate::awq::unpack::unpack_reordered_into;
    use crate::{AwqError, FloatDType, FloatSlice, FloatSliceMut};

    fn pack(values: [u32; 8]) -> u32 {
        values
            .iter()
            .enumerate()
            .fold(0, |acc, (k, v)| acc | ((v & 0xF) << (4 * k)))
    }

    #[test]
    fn test_float_dtype_matches_candle_dtype() {
        assert_eq!(<f16 as AwqFloat>::FLOAT_DTYPE, FloatDType::F16);
        assert_eq!(<bf16 as AwqFloat>::FLOAT_DTYPE, FloatDType::BF16);
        assert_eq!(<f32 as AwqFloat>::FLOAT_DTYPE, FloatDType::F32);
        assert_eq!(<f16 as WithDType>::DTYPE, DType::F16);
        assert_eq!(
            <bf16 as AwqFloat>::FLOAT_DTYPE.as_dtype(),
            <bf16 as WithDType>::DTYPE
        );
    }

    #[test]
    fn test_single_block() {
        let shape = KernelShape {
            rows: 1,
            cols: 8,
            group_size: 1,
        };
        // Nibble k holds k, so logical column `slot` holds AWQ_ORDER[slot].
        let qweight = [pack([0, 1, 2, 3, 4, 5, 6, 7])];
        let zeros = [1u8; 8];
        let scales = [2.0f32; 8];
        let mut out = [0f32; 8];
        dequantize_rows(&shape, &mut out, &qweight, &zeros, &scales);
        assert_eq!(out, [-2., 6., 0., 8., 2., 10., 4., 12.]);
    }

    #[test]
    fn test_negative_differences() {
        let shape = KernelShape {
            rows: 2,
            cols: 8,
            group_size: 2,
        };
        let qweight = [0u32, pack([15; 8])];
        let zeros = [15u8; 8];
        let scales = [0.5f32; 8];
        let mut out = [0f32; 16];
        dequantize_rows(&shape, &mut out, &qweight, &zeros, &scales);
        assert!(out[..8].iter().all(|v| *v == -7.5));
        assert!(out[8..].iter().all(|v| *v == 0.));
    }

    #[test]
    fn test_groups_select_rows() {
        let shape = KernelShape {
            rows: 4,
            cols: 8,
            group_size: 2,
        };
        let qweight = [pack([3; 8]); 4];
        let qzeros = [pack([1; 8]), pack([2; 8])];
        let mut zeros = vec![0u8; 16];
        unpack_reordered_into(&mut zeros, &qzeros, 1);
        let scales: Vec<f32> = [[1.0f32; 8], [10.0f32; 8]].concat();
        let mut out = vec![0f32; 32];
        dequantize_rows(&shape, &mut out, &qweight, &zeros, &scales);
        assert!(out[..16].iter().all(|v| *v == 2.));
        assert!(out[16..].iter().all(|v| *v == 10.));
    }

    #[test]
    fn test_half_output_rounds_to_nearest() {
        let shape = KernelShape {
            rows: 1,
            cols: 8,
            group_size: 1,
        };
        let qweight = [pack([9; 8])];
        let zeros = [0u8; 8];
        let scales = [0.1f32; 8];
        let mut out = vec![f16::ZERO; 8];
        let kernel = select_kernel(FloatDType::F16, FloatDType::F32);
        kernel(
            &shape,
            FloatSliceMut::F16(&mut out),
            &qweight,
            &zeros,
            FloatSlice::F32(&scales),
        )
        .unwrap();
        let expected = f16::from_f64(9.0 * 0.1f32 as f64);
        assert!(out.iter().all(|v| *v == expected));
    }

    #[test]
    fn test_kernel_rejects_mismatched_buffers() {
        let shape = KernelShape {
            rows: 1,
            cols: 8,
            group_size: 1,
        };
        let kernel = select_kernel(FloatDType::F32, FloatDType::F32);
        let mut out = vec![f16::ZERO; 8];
        let res = kernel(
            &shape,
            FloatSliceMut::F16(&mut out),
            &[0],
            &[0; 8],
            FloatSlice::F32(&[1.0; 8]),
        );
        assert!(matches!(res, Err(AwqError::InvalidDtype(_))));
    }
}
