//! Model stack: MaxViT backbone, token learner, temporal transformer and the
//! text-conditioned HLTransformer / HLT compositions.

mod error;
mod hl_transformer;
mod hlt;
mod max_vit;
mod mbconv;
mod state_policy;
mod token_learner;
mod transformer;

pub use error::ModelError;
pub use hl_transformer::HLTransformer;
pub use hlt::HLT;
pub use max_vit::MaxViT;
pub use mbconv::{MbConv, SqueezeExcitation};
pub use state_policy::StatePolicy;
pub use token_learner::TokenLearner;
pub use transformer::Transformer;
