//! Slow, tensor-level AWQ dequantization used to check the kernel, plus random problem generation.

use candle_core::{DType, Device, Result, Tensor, D};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::awq::{AWQ_ORDER, AWQ_PACK_FACTOR};

/// `(atol, rtol)` used when comparing against the reference.
pub fn tolerance(dtype: DType) -> (f64, f64) {
    match dtype {
        DType::F16 => (2e-3, 2e-3),
        DType::BF16 => (1.6e-2, 1.6e-2),
        _ => (1e-5, 1e-5),
    }
}

/// Unpack `(rows, cols_packed)` u32 words into `(rows, cols_packed * 8)` nibbles in storage order.
fn unpack_nibbles(packed: &Tensor) -> Result<Tensor> {
    let (rows, cols_packed) = packed.dims2()?;
    let dev = packed.device();
    let shifts: Vec<u32> = (0..AWQ_PACK_FACTOR as u32).map(|k| 1u32 << (4 * k)).collect();
    let shifts = Tensor::from_vec(shifts, (1, 1, AWQ_PACK_FACTOR), dev)?;
    let sixteen = Tensor::new(&[16u32], dev)?;

    let shifted = packed.unsqueeze(D::Minus1)?.broadcast_div(&shifts)?;
    let high = shifted.broadcast_div(&sixteen)?.broadcast_mul(&sixteen)?;
    (shifted - high)?.reshape((rows, cols_packed * AWQ_PACK_FACTOR))
}

/// Column `c` of the logical matrix is column `order_index()[c]` of the unpacked storage.
fn order_index(cols: usize, dev: &Device) -> Result<Tensor> {
    let idx: Vec<u32> = (0..cols)
        .map(|c| {
            let base = c - c % AWQ_PACK_FACTOR;
            (base + AWQ_ORDER[c % AWQ_PACK_FACTOR]) as u32
        })
        .collect();
    Tensor::from_vec(idx, cols, dev)
}

/// Unpack and reorder a packed matrix into f64 values.
pub fn unpack_awq(packed: &Tensor) -> Result<Tensor> {
    let unpacked = unpack_nibbles(packed)?;
    let idx = order_index(unpacked.dim(1)?, packed.device())?;
    unpacked.index_select(&idx, 1)?.to_dtype(DType::F64)
}

fn repeat_rows(t: &Tensor, group_size: usize) -> Result<Tensor> {
    let (groups, cols) = t.dims2()?;
    t.unsqueeze(1)?
        .broadcast_as((groups, group_size, cols))?
        .reshape((groups * group_size, cols))
}

/// `(w - z) * s`, computed in f64 and cast to `out_dtype`.
pub fn awq_dequantize_reference(
    qweight: &Tensor,
    qzeros: &Tensor,
    scales: &Tensor,
    group_size: usize,
    out_dtype: DType,
) -> Result<Tensor> {
    let w = unpack_awq(qweight)?;
    let z = repeat_rows(&unpack_awq(qzeros)?, group_size)?;
    let s = repeat_rows(&scales.to_dtype(DType::F64)?, group_size)?;
    ((w - z)? * s)?.to_dtype(out_dtype)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f64> {
    let a = a.to_dtype(DType::F64)?;
    let b = b.to_dtype(DType::F64)?;
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()
}

/// Elementwise `|actual - expected| <= atol + rtol * |expected|`, with the tolerance of
/// `actual`'s dtype.
pub fn all_close(actual: &Tensor, expected: &Tensor) -> Result<bool> {
    let (atol, rtol) = tolerance(actual.dtype());
    let a = actual.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let e = expected.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    if a.len() != e.len() {
        return Ok(false);
    }
    Ok(a.iter()
        .zip(&e)
        .all(|(a, e)| (a - e).abs() <= atol + rtol * e.abs()))
}

/// Random inputs for one `(n, m, group_size)` problem.
#[derive(Debug, Clone)]
pub struct AwqProblem {
    pub qweight: Tensor,
    pub qzeros: Tensor,
    pub scales: Tensor,
    pub group_size: usize,
}

impl AwqProblem {
    /// Packed words over the full u32 range and scales of magnitude about 0.01.
    pub fn random(
        n: usize,
        m: usize,
        group_size: usize,
        scale_dtype: DType,
        seed: u64,
        dev: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let m_packed = m / AWQ_PACK_FACTOR;
        let groups = n / group_size.max(1);

        let qweight: Vec<u32> = (0..n * m_packed).map(|_| rng.gen()).collect();
        let qzeros: Vec<u32> = (0..groups * m_packed).map(|_| rng.gen()).collect();
        let scales: Vec<f32> = (0..groups * m)
            .map(|_| rng.gen_range(0.005f32..0.015))
            .collect();

        Ok(Self {
            qweight: Tensor::from_vec(qweight, (n, m_packed), dev)?,
            qzeros: Tensor::from_vec(qzeros, (groups, m_packed), dev)?,
            scales: Tensor::from_vec(scales, (groups, m), dev)?.to_dtype(scale_dtype)?,
            group_size,
        })
    }

    pub fn reference(&self, out_dtype: DType) -> Result<Tensor> {
        awq_dequantize_reference(
            &self.qweight,
            &self.qzeros,
            &self.scales,
            self.group_size,
            out_dtype,
        )
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::{all_close, awq_dequantize_reference, max_abs_diff, unpack_awq, AwqProblem};

    #[test]
    fn test_unpack_fixture() -> candle_core::Result<()> {
        let packed = Tensor::new(&[[0x01234567u32]], &Device::Cpu)?;
        let unpacked = unpack_awq(&packed)?.to_vec2::<f64>()?;
        assert_eq!(unpacked, vec![vec![7., 3., 6., 2., 5., 1., 4., 0.]]);
        Ok(())
    }

    #[test]
    fn test_reference_groups() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let qweight = Tensor::new(&[[0x33333333u32], [0x33333333], [0x55555555], [0x55555555]], &dev)?;
        let qzeros = Tensor::new(&[[0x11111111u32], [0x22222222]], &dev)?;
        let scales = Tensor::new(&[[0.5f32; 8], [2.0f32; 8]], &dev)?;
        let out = awq_dequantize_reference(&qweight, &qzeros, &scales, 2, DType::F32)?;
        let rows = out.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![1.0; 8]);
        assert_eq!(rows[1], vec![1.0; 8]);
        assert_eq!(rows[2], vec![6.0; 8]);
        assert_eq!(rows[3], vec![6.0; 8]);
        Ok(())
    }

    #[test]
    fn test_random_problem_shapes() -> candle_core::Result<()> {
        let p = AwqProblem::random(16, 64, 4, DType::BF16, 0, &Device::Cpu)?;
        assert_eq!(p.qweight.dims(), &[16, 8]);
        assert_eq!(p.qzeros.dims(), &[4, 8]);
        assert_eq!(p.scales.dims(), &[4, 64]);
        assert_eq!(p.scales.dtype(), DType::BF16);
        assert_eq!(p.reference(DType::F16)?.dims(), &[16, 64]);
        Ok(())
    }

    #[test]
    fn test_all_close() -> candle_core::Result<()> {
        let a = Tensor::new(&[1.0f32, 2.0], &Device::Cpu)?;
        let b = Tensor::new(&[1.0f32, 2.000001], &Device::Cpu)?;
        let c = Tensor::new(&[1.0f32, 2.1], &Device::Cpu)?;
        assert!(all_close(&a, &b)?);
        assert!(!all_close(&a, &c)?);
        assert!((max_abs_diff(&a, &c)? - 0.1).abs() < 1e-6);
        Ok(())
    }
}
