use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

const LAYER_NORM_EPS: f32 = 1e-5;

/// LayerNorm with a learnable scale and a fixed zero shift.
///
/// Normalizes over the last axis. The shift is a constant buffer rather than a
/// parameter, so only `gamma` is registered with the `VarBuilder`.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    gamma: Tensor,
    beta: Tensor,
}

impl LayerNorm {
    pub fn new(gamma: Tensor) -> Result<Self> {
        let beta = gamma.zeros_like()?;
        Ok(Self { gamma, beta })
    }

    pub fn gamma(&self) -> &Tensor {
        &self.gamma
    }

    pub fn dim(&self) -> usize {
        self.gamma.elem_count()
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dim = xs.dim(candle_core::D::Minus1)?;
        if dim != self.dim() {
            candle_core::bail!(
                "layer norm expects last axis {}, got shape {:?}",
                self.dim(),
                xs.dims()
            );
        }
        candle_nn::ops::layer_norm(&xs.contiguous()?, &self.gamma, &self.beta, LAYER_NORM_EPS)
    }
}

/// Create a LayerNorm, loading `gamma` (initialized to ones) from a VarBuilder.
pub fn layer_norm(dim: usize, vb: VarBuilder) -> Result<LayerNorm> {
    let gamma = vb.get_with_hints(dim, "gamma", Init::Const(1.0))?;
    LayerNorm::new(gamma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_layer_norm_shape_any_rank() {
        let device = Device::Cpu;
        let norm = LayerNorm::new(Tensor::ones(16, DType::F32, &device).unwrap()).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (2, 3, 2, 2, 4, 16), &device).unwrap();
        let output = norm.forward(&input).unwrap();
        assert_eq!(output.dims(), input.dims());
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_variance() {
        let device = Device::Cpu;
        let hidden = 32;
        let norm = LayerNorm::new(Tensor::ones(hidden, DType::F32, &device).unwrap()).unwrap();

        let input = Tensor::randn(3.0f32, 2.0, (4, hidden), &device).unwrap();
        let output = norm.forward(&input).unwrap();

        let data: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        for row in data.chunks(hidden) {
            let mean = row.iter().sum::<f32>() / hidden as f32;
            let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / hidden as f32;
            assert!(mean.abs() < 1e-4, "mean should be ~0, got {mean}");
            assert!((var - 1.0).abs() < 1e-2, "variance should be ~1, got {var}");
        }
    }

    #[test]
    fn test_layer_norm_gamma_scales_output() {
        let device = Device::Cpu;
        let hidden = 8;
        let norm_1 = LayerNorm::new(Tensor::ones(hidden, DType::F32, &device).unwrap()).unwrap();
        let norm_3 = LayerNorm::new(
            (Tensor::ones(hidden, DType::F32, &device).unwrap() * 3.0).unwrap(),
        )
        .unwrap();

        let input = Tensor::arange(0f32, hidden as f32, &device).unwrap();
        let out_1: Vec<f32> = norm_1.forward(&input).unwrap().to_vec1().unwrap();
        let out_3: Vec<f32> = norm_3.forward(&input).unwrap().to_vec1().unwrap();
        for (a, b) in out_1.iter().zip(out_3.iter()) {
            assert!((b - 3.0 * a).abs() < 1e-4, "{b} vs 3*{a}");
        }
    }

    #[test]
    fn test_layer_norm_rejects_wrong_width() {
        let device = Device::Cpu;
        let norm = LayerNorm::new(Tensor::ones(8, DType::F32, &device).unwrap()).unwrap();
        let input = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        assert!(norm.forward(&input).is_err());
    }

    #[test]
    fn test_layer_norm_varbuilder_initializes_ones() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = layer_norm(12, vb.pp("norm")).unwrap();
        assert_eq!(norm.dim(), 12);
        let gamma: Vec<f32> = norm.gamma().to_vec1().unwrap();
        assert!(gamma.iter().all(|&g| g == 1.0));
        // only the scale is a parameter
        assert_eq!(varmap.all_vars().len(), 1);
    }
}
