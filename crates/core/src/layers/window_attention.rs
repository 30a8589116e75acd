use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Dropout, Embedding, Init, Linear, VarBuilder};

use super::normalization::{layer_norm, LayerNorm};

/// Pairwise offset table of a `window × window` tile, flattened row-major.
///
/// Entry `(i, j)` is `(Δr + w - 1) * (2w - 1) + (Δc + w - 1)` with
/// `Δ = pos_i - pos_j`, so every entry lies in `0..(2w - 1)^2`.
pub fn relative_position_indices(window: usize) -> Vec<u32> {
    let n = window * window;
    let span = 2 * window - 1;
    let mut indices = Vec::with_capacity(n * n);
    for i in 0..n {
        let (ri, ci) = (i / window, i % window);
        for j in 0..n {
            let (rj, cj) = (j / window, j % window);
            let dr = ri + window - 1 - rj;
            let dc = ci + window - 1 - cj;
            indices.push((dr * span + dc) as u32);
        }
    }
    indices
}

/// Self-attention inside fixed windows with memory key/values and a learned
/// relative position bias.
///
/// Input and output are `(batch, grid_x, grid_y, window, window, dim)`.
#[derive(Clone, Debug)]
pub struct WindowAttention {
    norm: LayerNorm,
    to_qkv: Linear,
    to_out: Linear,
    /// `(2, heads, num_mem_kv, dim_head)`
    mem_kv: Tensor,
    rel_pos_bias: Embedding,
    rel_pos_indices: Tensor,
    attn_dropout: Dropout,
    out_dropout: Dropout,
    dim: usize,
    heads: usize,
    dim_head: usize,
    num_mem_kv: usize,
    window: usize,
    scale: f64,
}

impl WindowAttention {
    pub fn new(
        dim: usize,
        dim_head: usize,
        dropout: f64,
        window: usize,
        num_mem_kv: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if dim_head == 0 || dim % dim_head != 0 {
            candle_core::bail!(
                "dimension {dim} should be divisible by dimension per head {dim_head}"
            );
        }
        if window == 0 {
            candle_core::bail!("window size must be positive");
        }
        let heads = dim / dim_head;
        let span = 2 * window - 1;

        let norm = layer_norm(dim, vb.pp("norm"))?;
        let to_qkv = linear_no_bias(dim, dim * 3, vb.pp("to_qkv"))?;
        let to_out = linear_no_bias(dim, dim, vb.pp("to_out"))?;
        let mem_kv = vb.get_with_hints(
            (2, heads, num_mem_kv, dim_head),
            "mem_kv",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let rel_pos_bias = embedding(span * span, heads, vb.pp("rel_pos_bias"))?;
        let indices = relative_position_indices(window);
        let rel_pos_indices = Tensor::from_vec(indices, window.pow(4), vb.device())?;

        Ok(Self {
            norm,
            to_qkv,
            to_out,
            mem_kv,
            rel_pos_bias,
            rel_pos_indices,
            attn_dropout: Dropout::new(dropout as f32),
            out_dropout: Dropout::new(dropout as f32),
            dim,
            heads,
            dim_head,
            num_mem_kv,
            window,
            scale: (dim_head as f64).powf(-0.5),
        })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Bias `(heads, n, num_mem_kv + n)` with zero columns for the memory slots.
    fn position_bias(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let n = self.window * self.window;
        let bias = self
            .rel_pos_bias
            .forward(&self.rel_pos_indices)?
            .reshape((n, n, self.heads))?
            .pad_with_zeros(1, self.num_mem_kv, 0)?
            .permute((2, 0, 1))?
            .contiguous()?;
        bias.to_dtype(dtype)?.to_device(device)
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let dims = xs.dims().to_vec();
        let &[batch, gx, gy, wh, ww, dim] = dims.as_slice() else {
            candle_core::bail!("window attention expects a 6-d input, got {dims:?}");
        };
        if wh != self.window || ww != self.window || dim != self.dim {
            candle_core::bail!(
                "window attention built for {w}x{w} windows of width {}, got {dims:?}",
                self.dim,
                w = self.window
            );
        }
        let windows = batch * gx * gy;
        let n = wh * ww;

        let hidden = self.norm.forward(xs)?.reshape((windows * n, dim))?;
        let qkv = self
            .to_qkv
            .forward(&hidden)?
            .reshape((windows, n, 3, self.heads, self.dim_head))?
            .permute((2, 0, 3, 1, 4))?;
        let q = (qkv.get(0)?.contiguous()? * self.scale)?;
        let k = qkv.get(1)?;
        let v = qkv.get(2)?;

        let mem_shape = (windows, self.heads, self.num_mem_kv, self.dim_head);
        let mem_kv = self.mem_kv.to_dtype(q.dtype())?;
        let mem_k = mem_kv.get(0)?.unsqueeze(0)?.broadcast_as(mem_shape)?;
        let mem_v = mem_kv.get(1)?.unsqueeze(0)?.broadcast_as(mem_shape)?;
        let k = Tensor::cat(&[&mem_k, &k], 2)?.contiguous()?;
        let v = Tensor::cat(&[&mem_v, &v], 2)?.contiguous()?;

        let sim = q.matmul(&k.t()?)?;
        let sim = sim.broadcast_add(&self.position_bias(sim.dtype(), sim.device())?)?;
        let attn = candle_nn::ops::softmax(&sim, D::Minus1)?;
        let attn = self.attn_dropout.forward(&attn, train)?;

        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((windows * n, self.heads * self.dim_head))?;
        let out = self.to_out.forward(&out)?;
        let out = self.out_dropout.forward(&out, train)?;
        out.reshape(dims)
    }
}
