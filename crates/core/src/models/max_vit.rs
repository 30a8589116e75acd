//! MaxViT backbone.
//!
//! Architecture:
//! - **Stem**: `Conv3x3(channels → stem, stride 2)` → `Conv3x3(stem → stem)`
//! - **Stages**: stage `i` is `dim * 2^i` wide; each block is
//!   MBConv (downsampling on the first block of a stage) → block-local
//!   window attention + feed-forward → grid (dilated) attention + feed-forward
//! - **Head**: spatial mean → LayerNorm → Linear(num_classes)
//!
//! A conditioning closure, when supplied, modulates the channel-first feature
//! map right before every block.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};

use super::mbconv::MbConv;
use crate::conditioning::{next_cond_fn, CondCursor};
use crate::config::MaxVitConfig;
use crate::layers::{layer_norm, FeedForward, LayerNorm, WindowAttention};

// ─── Windowing ───────────────────────────────────────────────────────────────

/// `b d (x w1) (y w2) -> b x y w1 w2 d`
fn block_partition(xs: &Tensor, window: usize) -> Result<Tensor> {
    let (b, d, h, w) = xs.dims4()?;
    xs.reshape((b, d, h / window, window, w / window, window))?
        .permute((0, 2, 4, 3, 5, 1))?
        .contiguous()
}

/// `b x y w1 w2 d -> b d (x w1) (y w2)`
fn block_merge(xs: &Tensor) -> Result<Tensor> {
    let &[b, gx, gy, w1, w2, d] = xs.dims() else {
        candle_core::bail!("expected a 6-d window tensor, got {:?}", xs.dims());
    };
    xs.permute((0, 5, 1, 3, 2, 4))?
        .contiguous()?
        .reshape((b, d, gx * w1, gy * w2))
}

/// `b d (w1 x) (w2 y) -> b x y w1 w2 d`
fn grid_partition(xs: &Tensor, window: usize) -> Result<Tensor> {
    let (b, d, h, w) = xs.dims4()?;
    xs.reshape((b, d, window, h / window, window, w / window))?
        .permute((0, 3, 5, 2, 4, 1))?
        .contiguous()
}

/// `b x y w1 w2 d -> b d (w1 x) (w2 y)`
fn grid_merge(xs: &Tensor) -> Result<Tensor> {
    let &[b, gx, gy, w1, w2, d] = xs.dims() else {
        candle_core::bail!("expected a 6-d window tensor, got {:?}", xs.dims());
    };
    xs.permute((0, 5, 3, 1, 4, 2))?
        .contiguous()?
        .reshape((b, d, w1 * gx, w2 * gy))
}

// ─── Block ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct MaxVitBlock {
    mbconv: MbConv,
    block_attn: WindowAttention,
    block_ff: FeedForward,
    grid_attn: WindowAttention,
    grid_ff: FeedForward,
    window: usize,
}

impl MaxVitBlock {
    fn new(dim_in: usize, dim: usize, downsample: bool, cfg: &MaxVitConfig, vb: VarBuilder) -> Result<Self> {
        let mbconv = MbConv::new(
            dim_in,
            dim,
            downsample,
            cfg.mbconv_expansion_rate,
            cfg.mbconv_shrinkage_rate,
            cfg.mbconv_dropsample,
            vb.pp("mbconv"),
        )?;
        let attn = |name: &str| {
            WindowAttention::new(
                dim,
                cfg.dim_head,
                cfg.dropout,
                cfg.window_size,
                cfg.num_mem_kv,
                vb.pp(name),
            )
        };
        let ff = |name: &str| FeedForward::new(dim, 4.0, cfg.dropout, vb.pp(name));
        Ok(Self {
            mbconv,
            block_attn: attn("block_attn")?,
            block_ff: ff("block_ff")?,
            grid_attn: attn("grid_attn")?,
            grid_ff: ff("grid_ff")?,
            window: cfg.window_size,
        })
    }

    fn attend(
        attn: &WindowAttention,
        ff: &FeedForward,
        windows: Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let windows = (attn.forward(&windows, train)? + &windows)?;
        ff.forward(&windows, None, train)? + &windows
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.mbconv.forward(xs, train)?;
        let (_, _, h, w) = xs.dims4()?;
        if h % self.window != 0 || w % self.window != 0 {
            candle_core::bail!(
                "feature map {h}x{w} is not divisible by window size {}",
                self.window
            );
        }

        let windows = block_partition(&xs, self.window)?;
        let windows = Self::attend(&self.block_attn, &self.block_ff, windows, train)?;
        let xs = block_merge(&windows)?;

        let windows = grid_partition(&xs, self.window)?;
        let windows = Self::attend(&self.grid_attn, &self.grid_ff, windows, train)?;
        grid_merge(&windows)
    }
}

// ─── MaxViT ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct MaxViT {
    stem_conv: Conv2d,
    stem_refine: Conv2d,
    blocks: Vec<MaxVitBlock>,
    head_norm: LayerNorm,
    head: Linear,
    cond_hidden_dims: Vec<usize>,
    cfg: MaxVitConfig,
}

impl MaxViT {
    pub fn new(cfg: &MaxVitConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate().map_err(candle_core::Error::wrap)?;

        let stem_dim = cfg.stem_dim();
        let stem_cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let refine_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let stem_conv = conv2d(cfg.channels, stem_dim, 3, stem_cfg, vb.pp("conv_stem.0"))?;
        let stem_refine = conv2d(stem_dim, stem_dim, 3, refine_cfg, vb.pp("conv_stem.1"))?;

        let mut dims_in = vec![stem_dim];
        dims_in.extend(cfg.stage_dims());
        let vb_layers = vb.pp("layers");
        let mut blocks = Vec::with_capacity(cfg.depth.iter().sum());
        for (stage, &depth) in cfg.depth.iter().enumerate() {
            let (stage_in, stage_dim) = (dims_in[stage], dims_in[stage + 1]);
            for block in 0..depth {
                let is_first = block == 0;
                let dim_in = if is_first { stage_in } else { stage_dim };
                blocks.push(MaxVitBlock::new(
                    dim_in,
                    stage_dim,
                    is_first,
                    cfg,
                    vb_layers.pp(blocks.len()),
                )?);
            }
        }

        let embed_dim = cfg.embed_dim();
        let head_norm = layer_norm(embed_dim, vb.pp("mlp_head.1"))?;
        let head = linear(embed_dim, cfg.num_classes, vb.pp("mlp_head.2"))?;

        tracing::info!(
            stages = cfg.num_stages(),
            blocks = blocks.len(),
            embed_dim,
            window = cfg.window_size,
            "built MaxViT backbone"
        );

        Ok(Self {
            stem_conv,
            stem_refine,
            blocks,
            head_norm,
            head,
            cond_hidden_dims: cfg.cond_hidden_dims(),
            cfg: cfg.clone(),
        })
    }

    /// Channel width entering every block, in execution order.
    pub fn cond_hidden_dims(&self) -> &[usize] {
        &self.cond_hidden_dims
    }

    pub fn embed_dim(&self) -> usize {
        self.cfg.embed_dim()
    }

    pub fn config(&self) -> &MaxVitConfig {
        &self.cfg
    }

    /// `(b, channels, h, w)` → embeddings `(b, embed_dim, h', w')` or logits `(b, num_classes)`.
    ///
    /// With a cursor, one closure is taken per block; running out is an error.
    pub fn forward(
        &self,
        xs: &Tensor,
        mut cond: Option<&mut CondCursor<'_>>,
        return_embeddings: bool,
        train: bool,
    ) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        if c != self.cfg.channels {
            candle_core::bail!("expected {} input channels, got {c}", self.cfg.channels);
        }
        self.cfg
            .check_spatial(h, w)
            .map_err(candle_core::Error::wrap)?;
        tracing::debug!(batch = b, height = h, width = w, "maxvit forward");

        let mut xs = self.stem_refine.forward(&self.stem_conv.forward(xs)?)?;
        for block in &self.blocks {
            if let Some(cond_fn) = next_cond_fn(&mut cond)? {
                xs = cond_fn(&xs)?;
            }
            xs = block.forward(&xs, train)?;
        }

        if return_embeddings {
            return Ok(xs);
        }
        let pooled = xs.mean((2, 3))?;
        self.head.forward(&self.head_norm.forward(&pooled)?)
    }

    /// Unconditioned classification logits `(b, num_classes)`.
    pub fn classify(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.forward(xs, None, false, train)
    }
}
