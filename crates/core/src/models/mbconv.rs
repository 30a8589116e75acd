//! MBConv: inverted-bottleneck convolution block with squeeze-excitation.
//!
//! ```text
//! 1x1 conv → BN → GELU → 3x3 depthwise (stride 2 when downsampling) → BN → GELU
//!   → squeeze-excitation → 1x1 conv → BN
//! ```
//!
//! When input and output widths match and the block keeps resolution, the
//! branch is residual with per-sample drop.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, linear_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear,
    VarBuilder,
};

use crate::layers::Dropsample;

// ─── Squeeze-Excitation ──────────────────────────────────────────────────────

/// Channel gate from a pooled bottleneck: mean → Linear → SiLU → Linear → sigmoid.
#[derive(Clone, Debug)]
pub struct SqueezeExcitation {
    reduce: Linear,
    expand: Linear,
}

impl SqueezeExcitation {
    /// Bottleneck width is `int(dim * shrinkage_rate)`.
    pub fn new(dim: usize, shrinkage_rate: f64, vb: VarBuilder) -> Result<Self> {
        let hidden = (dim as f64 * shrinkage_rate) as usize;
        if hidden == 0 {
            candle_core::bail!(
                "squeeze-excitation width int({dim} * {shrinkage_rate}) is zero"
            );
        }
        Ok(Self {
            reduce: linear_no_bias(dim, hidden, vb.pp("gate.1"))?,
            expand: linear_no_bias(hidden, dim, vb.pp("gate.3"))?,
        })
    }
}

impl Module for SqueezeExcitation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = xs.dims4()?;
        let pooled = xs.mean((2, 3))?;
        let gate = self.reduce.forward(&pooled)?.silu()?;
        let gate = self.expand.forward(&gate)?;
        let gate = candle_nn::ops::sigmoid(&gate)?.reshape((b, c, 1, 1))?;
        xs.broadcast_mul(&gate)
    }
}

// ─── MBConv ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct MbConv {
    expand_conv: Conv2d,
    expand_bn: BatchNorm,
    depthwise_conv: Conv2d,
    depthwise_bn: BatchNorm,
    se: SqueezeExcitation,
    project_conv: Conv2d,
    project_bn: BatchNorm,
    /// Present when the block is residual.
    dropsample: Option<Dropsample>,
    dim_out: usize,
    downsample: bool,
}

impl MbConv {
    pub fn new(
        dim_in: usize,
        dim_out: usize,
        downsample: bool,
        expansion_rate: f64,
        shrinkage_rate: f64,
        dropsample: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = (expansion_rate * dim_out as f64) as usize;
        if hidden == 0 {
            candle_core::bail!("mbconv hidden width int({expansion_rate} * {dim_out}) is zero");
        }
        let vb = vb.pp("net");
        let bn_cfg = BatchNormConfig::default();

        let expand_conv = conv2d(dim_in, hidden, 1, Conv2dConfig::default(), vb.pp("0"))?;
        let expand_bn = batch_norm(hidden, bn_cfg, vb.pp("1"))?;
        let depthwise_cfg = Conv2dConfig {
            padding: 1,
            stride: if downsample { 2 } else { 1 },
            groups: hidden,
            ..Default::default()
        };
        let depthwise_conv = conv2d(hidden, hidden, 3, depthwise_cfg, vb.pp("3"))?;
        let depthwise_bn = batch_norm(hidden, bn_cfg, vb.pp("4"))?;
        let se = SqueezeExcitation::new(hidden, shrinkage_rate, vb.pp("6"))?;
        let project_conv = conv2d(hidden, dim_out, 1, Conv2dConfig::default(), vb.pp("7"))?;
        let project_bn = batch_norm(dim_out, bn_cfg, vb.pp("8"))?;

        let dropsample = if dim_in == dim_out && !downsample {
            Some(Dropsample::new(dropsample)?)
        } else {
            None
        };

        Ok(Self {
            expand_conv,
            expand_bn,
            depthwise_conv,
            depthwise_bn,
            se,
            project_conv,
            project_bn,
            dropsample,
            dim_out,
            downsample,
        })
    }

    pub fn is_residual(&self) -> bool {
        self.dropsample.is_some()
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    pub fn downsample(&self) -> bool {
        self.downsample
    }

    /// `(b, dim_in, h, w)` → `(b, dim_out, h', w')`, halved when downsampling.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.expand_conv.forward(xs)?;
        let h = self.expand_bn.forward_t(&h, train)?.gelu_erf()?;
        let h = self.depthwise_conv.forward(&h)?;
        let h = self.depthwise_bn.forward_t(&h, train)?.gelu_erf()?;
        let h = self.se.forward(&h)?;
        let h = self.project_conv.forward(&h)?;
        let h = self.project_bn.forward_t(&h, train)?;
        match &self.dropsample {
            Some(dropsample) => dropsample.forward(&h, train)? + xs,
            None => Ok(h),
        }
    }
}
