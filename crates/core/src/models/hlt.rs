use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::error::ModelError;
use super::hl_transformer::HLTransformer;
use super::max_vit::MaxViT;
use crate::conditioning::{ClassifierFreeGuidance, TextEncoder, TextInput};
use crate::config::HltConfig;

/// MaxViT backbone and HLTransformer built from one flat [`HltConfig`].
#[derive(Debug)]
pub struct HLT {
    hl_transformer: HLTransformer,
    cfg: HltConfig,
}

impl HLT {
    pub fn from_config(cfg: &HltConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        cfg.validate()?;
        let vit = MaxViT::new(&cfg.max_vit_config(), vb.pp("vit"))?;
        let hl_transformer =
            HLTransformer::new(vit, &cfg.hl_transformer_config(), vb.pp("hl_transformer"))?;
        Ok(Self {
            hl_transformer,
            cfg: cfg.clone(),
        })
    }

    pub fn with_text_encoder(
        mut self,
        encoder: Box<dyn TextEncoder>,
    ) -> Result<Self, ModelError> {
        self.hl_transformer = self.hl_transformer.with_text_encoder(encoder)?;
        Ok(self)
    }

    pub fn config(&self) -> &HltConfig {
        &self.cfg
    }

    pub fn hl_transformer(&self) -> &HLTransformer {
        &self.hl_transformer
    }

    /// `video (b, c, f, h, w)` with instruction embeddings `(b, tokens, text_embed_dim)`.
    pub fn forward(
        &self,
        video: &Tensor,
        instructions: &Tensor,
        train: bool,
    ) -> Result<Tensor, ModelError> {
        self.hl_transformer
            .forward(video, None, Some(instructions), None, train)
    }

    /// Raw-text entry point; needs a text encoder attached.
    pub fn forward_texts(
        &self,
        video: &Tensor,
        texts: &[&str],
        train: bool,
    ) -> Result<Tensor, ModelError> {
        self.hl_transformer
            .forward(video, Some(texts), None, None, train)
    }
}

impl ClassifierFreeGuidance for HLT {
    fn forward_cond(
        &self,
        video: &Tensor,
        text: TextInput<'_>,
        cond_drop_prob: f64,
    ) -> Result<Tensor, ModelError> {
        self.hl_transformer.forward_cond(video, text, cond_drop_prob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::testing::{tiny_hlt_config, varmap_builder, MockTextEncoder};
    use candle_core::{DType, Device};

    #[test]
    fn embeddings_entry_point() {
        let device = Device::Cpu;
        let cfg = tiny_hlt_config();
        let model = HLT::from_config(&cfg, VarBuilder::zeros(DType::F32, &device)).unwrap();
        let video = Tensor::randn(0f32, 1.0, (1, 3, 2, 16, 16), &device).unwrap();
        let instructions =
            Tensor::randn(0f32, 1.0, (1, 3, cfg.text_embed_dim), &device).unwrap();
        let out = model.forward(&video, &instructions, false).unwrap();
        assert_eq!(out.dims(), &[1, 2, cfg.num_actions, cfg.action_bins]);
    }

    #[test]
    fn text_entry_point_uses_the_encoder() {
        let device = Device::Cpu;
        let cfg = tiny_hlt_config();
        let (_varmap, vb) = varmap_builder(&device);
        let video = Tensor::randn(0f32, 1.0, (2, 3, 2, 16, 16), &device).unwrap();
        let texts = ["open the drawer", "push the red block left"];

        let bare = HLT::from_config(&cfg, vb.clone()).unwrap();
        assert!(bare.forward_texts(&video, &texts, false).is_err());

        let model = HLT::from_config(&cfg, vb)
            .unwrap()
            .with_text_encoder(Box::new(MockTextEncoder::new(cfg.text_embed_dim)))
            .unwrap();
        let out = model.forward_texts(&video, &texts, false).unwrap();
        assert_eq!(out.dims(), &[2, 2, cfg.num_actions, cfg.action_bins]);
    }

    #[test]
    fn encoder_width_must_match() {
        let device = Device::Cpu;
        let cfg = tiny_hlt_config();
        let model = HLT::from_config(&cfg, VarBuilder::zeros(DType::F32, &device)).unwrap();
        let wrong = MockTextEncoder::new(cfg.text_embed_dim + 2);
        assert!(model.with_text_encoder(Box::new(wrong)).is_err());
    }

    #[test]
    fn invalid_config_is_reported() {
        let cfg = HltConfig {
            dim: 10,
            dim_head: 4,
            ..tiny_hlt_config()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let err = HLT::from_config(&cfg, vb).unwrap_err();
        assert!(matches!(
            err,
            ModelError::InvalidConfig(ConfigError::HeadDimMismatch { dim: 10, .. })
        ));
    }
}
