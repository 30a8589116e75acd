use candle_core::{DType, Device, Result, Tensor};

const TEMPERATURE: f64 = 10_000.0;

/// 1-D sinusoidal position embedding, `(seq, dim)`.
///
/// `omega_k = 1 / temperature^(k / (dim/2 - 1))` for `k < dim/2`; the first
/// half of the features is `sin(n * omega)`, the second half `cos(n * omega)`.
pub fn posemb_sincos_1d(
    seq: usize,
    dim: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    if dim % 2 != 0 || dim < 4 {
        candle_core::bail!(
            "sincos position embedding needs an even width of at least 4, got {dim}"
        );
    }
    let half = dim / 2;
    let omega: Vec<f64> = (0..half)
        .map(|k| 1.0 / TEMPERATURE.powf(k as f64 / (half - 1) as f64))
        .collect();

    let mut data = Vec::with_capacity(seq * dim);
    for n in 0..seq {
        let angles = omega.iter().map(|w| n as f64 * w);
        data.extend(angles.clone().map(|a| a.sin() as f32));
        data.extend(angles.map(|a| a.cos() as f32));
    }
    Tensor::from_vec(data, (seq, dim), device)?.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_position_is_sin_zero_cos_one() {
        let emb = posemb_sincos_1d(3, 8, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(emb.dims(), &[3, 8]);
        let rows = emb.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn frequencies_span_one_to_inverse_temperature() {
        let emb = posemb_sincos_1d(2, 8, DType::F32, &Device::Cpu).unwrap();
        let row = &emb.to_vec2::<f32>().unwrap()[1];
        // omega_0 = 1, omega_last = 1e-4
        assert!((row[0] - 1f32.sin()).abs() < 1e-6);
        assert!((row[3] - 1e-4f32.sin()).abs() < 1e-6);
        assert!((row[4] - 1f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn rejects_degenerate_widths() {
        assert!(posemb_sincos_1d(2, 2, DType::F32, &Device::Cpu).is_err());
        assert!(posemb_sincos_1d(2, 7, DType::F32, &Device::Cpu).is_err());
    }
}
