use candle_core::Tensor;

use super::TextInput;
use crate::models::ModelError;

/// Classifier-free guidance over a text-conditioned model.
///
/// Implementors provide an evaluation-mode forward with an explicit
/// `cond_drop_prob`; guidance contrasts the fully conditioned pass (`0.0`)
/// with the fully unconditioned one (`1.0`).
pub trait ClassifierFreeGuidance {
    fn forward_cond(
        &self,
        video: &Tensor,
        text: TextInput<'_>,
        cond_drop_prob: f64,
    ) -> Result<Tensor, ModelError>;

    /// `null + (cond - null) * cond_scale`; a scale of 1 runs a single pass.
    fn forward_with_cond_scale(
        &self,
        video: &Tensor,
        text: TextInput<'_>,
        cond_scale: f64,
    ) -> Result<Tensor, ModelError> {
        let logits = self.forward_cond(video, text, 0.0)?;
        if cond_scale == 1.0 {
            return Ok(logits);
        }
        let null_logits = self.forward_cond(video, text, 1.0)?;
        let guided = ((logits - &null_logits)? * cond_scale)?;
        Ok((null_logits + guided)?)
    }
}
