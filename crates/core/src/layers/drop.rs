use candle_core::{Result, Tensor};

/// Per-sample stochastic depth: drops a whole residual branch for a batch item.
///
/// Survivors are rescaled by `1 / (1 - prob)`. Identity in eval mode or when
/// `prob == 0`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Dropsample {
    prob: f64,
}

impl Dropsample {
    pub fn new(prob: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&prob) {
            candle_core::bail!("dropsample probability must be in [0, 1), got {prob}");
        }
        Ok(Self { prob })
    }

    pub fn prob(&self) -> f64 {
        self.prob
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if self.prob == 0.0 || !train {
            return Ok(xs.clone());
        }
        let batch = xs.dim(0)?;
        let mut shape = vec![1usize; xs.rank()];
        shape[0] = batch;
        let keep = Tensor::rand(0f32, 1f32, shape, xs.device())?
            .gt(self.prob)?
            .to_dtype(xs.dtype())?;
        xs.broadcast_mul(&keep)? / (1.0 - self.prob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn identity_in_eval_mode() {
        let xs = Tensor::ones((4, 2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let drop = Dropsample::new(0.5).unwrap();
        let out = drop.forward(&xs, false).unwrap();
        assert_eq!(out.sum_all().unwrap().to_scalar::<f32>().unwrap(), 72.0);
    }

    #[test]
    fn zero_prob_is_identity_when_training() {
        let xs = Tensor::ones((4, 2), DType::F32, &Device::Cpu).unwrap();
        let out = Dropsample::default().forward(&xs, true).unwrap();
        assert_eq!(out.sum_all().unwrap().to_scalar::<f32>().unwrap(), 8.0);
    }

    #[test]
    fn drops_whole_samples_and_rescales() {
        let xs = Tensor::ones((64, 2, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let drop = Dropsample::new(0.5).unwrap();
        let out = drop.forward(&xs, true).unwrap();
        let per_sample: Vec<f32> = out
            .flatten_from(1)
            .unwrap()
            .mean(1)
            .unwrap()
            .to_vec1()
            .unwrap();
        // each sample is either fully dropped or fully kept at 1 / (1 - p)
        assert!(per_sample.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn rejects_out_of_range_probability() {
        assert!(Dropsample::new(1.0).is_err());
        assert!(Dropsample::new(-0.1).is_err());
    }
}
