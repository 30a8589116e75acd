//! HLTransformer: text-conditioned video → per-frame action-bin logits.
//!
//! ```text
//! video (b, c, f, h, w)
//!   → frames (b·f, c, h, w) → MaxViT embeddings   [sites 0..k, repeated per frame]
//!   → (b, f, d, h', w') → TokenLearner (b, f, d, n) → tokens (b, f·n, d)
//!   → + frame position embedding
//!   → block-causal Transformer                     [sites k..k+2·depth]
//!   → mean per frame (b, f, d) → LayerNorm → Linear → (b, f, actions, bins)
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use super::error::ModelError;
use super::max_vit::MaxViT;
use super::token_learner::TokenLearner;
use super::transformer::Transformer;
use crate::conditioning::{
    AttentionTextConditioner, ClassifierFreeGuidance, Conditioner, TextConditioner, TextEncoder,
    TextInput,
};
use crate::config::{ConditionerKind, ConfigError, HlTransformerConfig};
use crate::layers::{frame_causal_mask, layer_norm, posemb_sincos_1d, LayerNorm};

pub struct HLTransformer {
    vit: MaxViT,
    conditioner: Box<dyn Conditioner>,
    token_learner: TokenLearner,
    transformer: Transformer,
    logits_norm: LayerNorm,
    to_logits: Linear,
    num_vit_sites: usize,
    cfg: HlTransformerConfig,
}

impl HLTransformer {
    pub fn new(
        vit: MaxViT,
        cfg: &HlTransformerConfig,
        vb: VarBuilder,
    ) -> Result<Self, ModelError> {
        cfg.validate()?;
        let embed_dim = vit.embed_dim();
        let num_vit_sites = vit.cond_hidden_dims().len();
        let num_transformer_sites = cfg.num_transformer_cond_sites();

        let num_sites = num_vit_sites + num_transformer_sites;
        let mut hidden_dims = vit.cond_hidden_dims().to_vec();
        hidden_dims.resize(num_sites, embed_dim);
        let mut channel_first = vec![true; num_vit_sites];
        channel_first.resize(num_sites, false);

        let vb_cond = vb.pp("conditioner");
        let conditioner: Box<dyn Conditioner> = match cfg.conditioner_kind {
            ConditionerKind::Film => Box::new(TextConditioner::new(
                &hidden_dims,
                &channel_first,
                &cfg.conditioner,
                vb_cond,
            )?),
            ConditionerKind::Attention => Box::new(AttentionTextConditioner::new(
                &hidden_dims,
                &channel_first,
                &cfg.conditioner,
                vb_cond,
            )?),
        };

        let token_learner = TokenLearner::new(
            embed_dim,
            cfg.token_learner_ff_mult,
            cfg.token_learner_num_output_tokens,
            vb.pp("token_learner"),
        )?;
        let transformer = Transformer::new(
            embed_dim,
            cfg.dim_head,
            cfg.heads,
            cfg.depth,
            cfg.attn_dropout,
            cfg.ff_dropout,
            vb.pp("transformer"),
        )?;
        let logits_norm = layer_norm(embed_dim, vb.pp("to_logits.0"))?;
        let to_logits = linear(
            embed_dim,
            cfg.num_actions * cfg.action_bins,
            vb.pp("to_logits.1"),
        )?;

        tracing::info!(
            embed_dim,
            vit_sites = num_vit_sites,
            transformer_sites = num_transformer_sites,
            conditioner = ?cfg.conditioner_kind,
            learned_tokens = cfg.token_learner_num_output_tokens,
            actions = cfg.num_actions,
            bins = cfg.action_bins,
            "built HLTransformer"
        );

        Ok(Self {
            vit,
            conditioner,
            token_learner,
            transformer,
            logits_norm,
            to_logits,
            num_vit_sites,
            cfg: cfg.clone(),
        })
    }

    /// Attach the encoder used for raw-text instructions.
    pub fn with_text_encoder(
        mut self,
        encoder: Box<dyn TextEncoder>,
    ) -> Result<Self, ModelError> {
        self.conditioner.set_text_encoder(encoder)?;
        Ok(self)
    }

    pub fn vit(&self) -> &MaxViT {
        &self.vit
    }

    pub fn config(&self) -> &HlTransformerConfig {
        &self.cfg
    }

    /// Total conditioning sites: one per MaxViT block plus two per transformer layer.
    pub fn num_cond_sites(&self) -> usize {
        self.num_vit_sites + self.transformer.num_cond_sites()
    }

    pub fn num_learned_tokens(&self) -> usize {
        self.token_learner.num_output_tokens()
    }

    /// Encode raw instructions with the conditioner's text encoder.
    pub fn embed_texts(&self, texts: &[&str]) -> Result<Tensor, ModelError> {
        Ok(self.conditioner.embed_texts(texts)?)
    }

    /// `video (b, c, f, h, w)` → logits `(b, f, num_actions, action_bins)`.
    ///
    /// Exactly one of `texts` / `text_embeds` must be given. `cond_drop_prob`
    /// defaults to the configured value when training and to `0` otherwise.
    pub fn forward(
        &self,
        video: &Tensor,
        texts: Option<&[&str]>,
        text_embeds: Option<&Tensor>,
        cond_drop_prob: Option<f64>,
        train: bool,
    ) -> Result<Tensor, ModelError> {
        let text = TextInput::from_options(texts, text_embeds)?;
        self.forward_text(video, text, cond_drop_prob, train)
    }

    pub fn forward_text(
        &self,
        video: &Tensor,
        text: TextInput<'_>,
        cond_drop_prob: Option<f64>,
        train: bool,
    ) -> Result<Tensor, ModelError> {
        let cond_drop_prob = self.resolve_cond_drop_prob(cond_drop_prob, train)?;
        let (b, c, frames, h, w) = video.dims5()?;
        let text_batch = text.batch_size()?;
        if text_batch != b {
            return Err(ModelError::BatchMismatch {
                video: b,
                texts: text_batch,
            });
        }
        tracing::debug!(
            batch = b,
            frames,
            height = h,
            width = w,
            cond_drop_prob,
            "hl transformer forward"
        );

        let mut repeat_batch = vec![frames; self.num_vit_sites];
        repeat_batch.resize(self.num_cond_sites(), 1);
        let cond_fns = self
            .conditioner
            .condition(text, cond_drop_prob, &repeat_batch)?;
        let (mut vit_cond, mut transformer_cond) = cond_fns.split_at(self.num_vit_sites)?;

        let images = video
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?
            .reshape((b * frames, c, h, w))?;
        let embeddings = self.vit.forward(&images, Some(&mut vit_cond), true, train)?;
        let (_, dim, eh, ew) = embeddings.dims4()?;
        let embeddings = embeddings.reshape((b, frames, dim, eh, ew))?;

        let learned = self.token_learner.forward(&embeddings)?;
        let n = self.num_learned_tokens();
        let tokens = learned
            .permute((0, 1, 3, 2))?
            .contiguous()?
            .reshape((b, frames * n, dim))?;
        tracing::debug!(tokens = frames * n, dim, "learned tokens");

        let pos_emb = posemb_sincos_1d(frames, dim, tokens.dtype(), tokens.device())?
            .unsqueeze(1)?
            .broadcast_as((frames, n, dim))?
            .reshape((frames * n, dim))?;
        let tokens = tokens.broadcast_add(&pos_emb)?;

        let attn_mask = frame_causal_mask(frames, n, tokens.device())?;
        let attended =
            self.transformer
                .forward(&tokens, Some(&mut transformer_cond), Some(&attn_mask), train)?;

        let pooled = attended.reshape((b, frames, n, dim))?.mean(2)?;
        let logits = self.to_logits.forward(&self.logits_norm.forward(&pooled)?)?;
        Ok(logits.reshape((b, frames, self.cfg.num_actions, self.cfg.action_bins))?)
    }

    fn resolve_cond_drop_prob(
        &self,
        requested: Option<f64>,
        train: bool,
    ) -> Result<f64, ModelError> {
        let Some(p) = requested else {
            return Ok(if train { self.cfg.cond_drop_prob } else { 0.0 });
        };
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::Probability {
                name: "cond_drop_prob",
                value: p,
            }
            .into());
        }
        if !train && p > 0.0 && p < 1.0 {
            tracing::warn!(
                cond_drop_prob = p,
                "random condition dropout requested outside training"
            );
        }
        Ok(p)
    }
}

impl ClassifierFreeGuidance for HLTransformer {
    fn forward_cond(
        &self,
        video: &Tensor,
        text: TextInput<'_>,
        cond_drop_prob: f64,
    ) -> Result<Tensor, ModelError> {
        self.forward_text(video, text, Some(cond_drop_prob), false)
    }
}

impl std::fmt::Debug for HLTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HLTransformer")
            .field("vit", &self.vit)
            .field("num_cond_sites", &self.num_cond_sites())
            .field("token_learner", &self.token_learner)
            .field("transformer", &self.transformer)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}
