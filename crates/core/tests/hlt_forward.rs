//! End-to-end forward passes through HLTransformer and HLT on CPU.
//!
//! Small configurations run by default; the full-size scenarios are ignored
//! and meant to be run explicitly with `--ignored`.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use hlt_core::{
    conditioning::{ClassifierFreeGuidance, TextInput, TokenEmbeddingTextEncoder},
    config::{
        ConditionerKind, HlTransformerConfig, HltConfig, MaxVitConfig, TextConditionerConfig,
    },
    models::{HLTransformer, MaxViT, ModelError, HLT},
    tokenizer::TokenizerWrapper,
};

const TEXT_DIM: usize = 16;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn small_vit_config() -> MaxVitConfig {
    MaxVitConfig {
        num_classes: 10,
        dim: 8,
        depth: vec![1, 1],
        dim_head: 4,
        dim_conv_stem: Some(8),
        window_size: 2,
        mbconv_expansion_rate: 2.0,
        mbconv_shrinkage_rate: 0.25,
        dropout: 0.0,
        ..MaxVitConfig::default()
    }
}

fn small_hl_config(kind: ConditionerKind) -> HlTransformerConfig {
    HlTransformerConfig {
        num_actions: 3,
        action_bins: 7,
        depth: 2,
        heads: 2,
        dim_head: 8,
        token_learner_num_output_tokens: 2,
        conditioner_kind: kind,
        conditioner: TextConditionerConfig {
            text_embed_dim: TEXT_DIM,
            film_hidden_mult: 2,
            attn_heads: 2,
            attn_dim_head: 4,
        },
        ..HlTransformerConfig::default()
    }
}

fn build(kind: ConditionerKind, vb: VarBuilder) -> HLTransformer {
    let vit = MaxViT::new(&small_vit_config(), vb.pp("vit")).unwrap();
    HLTransformer::new(vit, &small_hl_config(kind), vb).unwrap()
}

/// Give the zero-initialized conditioner outputs random weights so text matters.
fn randomize_conditioner(varmap: &VarMap) {
    let data = varmap.data().lock().unwrap();
    for (name, var) in data.iter() {
        let is_output = name.contains("net.2") || name.contains("to_out");
        if name.starts_with("conditioner.") && is_output {
            let value = Tensor::randn(0f32, 0.5, var.shape(), var.device()).unwrap();
            var.set(&value).unwrap();
        }
    }
}

fn video(batch: usize, frames: usize, side: usize) -> Tensor {
    Tensor::randn(0f32, 1.0, (batch, 3, frames, side, side), &Device::Cpu).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

fn all_finite(t: &Tensor) -> bool {
    t.flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .iter()
        .all(|v| v.is_finite())
}

// ─── Shapes and contracts ────────────────────────────────────────────────────

#[test]
fn logits_have_one_row_per_frame_and_action() {
    for kind in [ConditionerKind::Film, ConditionerKind::Attention] {
        let varmap = VarMap::new();
        let model = build(kind, VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu));
        let embeds = Tensor::randn(0f32, 1.0, (2, 4, TEXT_DIM), &Device::Cpu).unwrap();
        let out = model
            .forward(&video(2, 3, 16), None, Some(&embeds), None, false)
            .unwrap();
        assert_eq!(out.dims(), &[2, 3, 3, 7]);
        assert!(all_finite(&out));
    }
}

#[test]
fn exactly_one_instruction_form_is_required() {
    let model = build(
        ConditionerKind::Film,
        VarBuilder::zeros(DType::F32, &Device::Cpu),
    );
    let embeds = Tensor::ones((1, 2, TEXT_DIM), DType::F32, &Device::Cpu).unwrap();
    let texts = ["pick up the sponge"];
    let clip = video(1, 2, 16);

    assert!(matches!(
        model.forward(&clip, None, None, None, false),
        Err(ModelError::MissingCondition)
    ));
    assert!(matches!(
        model.forward(&clip, Some(&texts[..]), Some(&embeds), None, false),
        Err(ModelError::ConflictingCondition)
    ));
}

#[test]
fn indivisible_frames_are_rejected() {
    let model = build(
        ConditionerKind::Film,
        VarBuilder::zeros(DType::F32, &Device::Cpu),
    );
    let embeds = Tensor::ones((1, 2, TEXT_DIM), DType::F32, &Device::Cpu).unwrap();
    let err = model
        .forward(&video(1, 2, 20), None, Some(&embeds), None, false)
        .unwrap_err();
    assert!(err.to_string().contains("divisible"));
}

#[test]
fn training_pass_runs_with_dropout_and_batch_statistics() {
    let varmap = VarMap::new();
    let model = build(
        ConditionerKind::Film,
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
    );
    let embeds = Tensor::randn(0f32, 1.0, (2, 3, TEXT_DIM), &Device::Cpu).unwrap();
    let out = model
        .forward(&video(2, 2, 16), None, Some(&embeds), None, true)
        .unwrap();
    assert_eq!(out.dims(), &[2, 2, 3, 7]);
    assert!(all_finite(&out));
}

// ─── Causality ───────────────────────────────────────────────────────────────

#[test]
fn perturbing_a_frame_only_affects_it_and_later_frames() {
    let varmap = VarMap::new();
    let model = build(
        ConditionerKind::Film,
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
    );
    let embeds = Tensor::randn(0f32, 1.0, (1, 3, TEXT_DIM), &Device::Cpu).unwrap();
    let clip = video(1, 4, 16);
    let replacement = video(1, 1, 16);
    let changed = Tensor::cat(
        &[
            &clip.narrow(2, 0, 2).unwrap(),
            &replacement,
            &clip.narrow(2, 3, 1).unwrap(),
        ],
        2,
    )
    .unwrap();

    let a = model.forward(&clip, None, Some(&embeds), None, false).unwrap();
    let b = model
        .forward(&changed, None, Some(&embeds), None, false)
        .unwrap();
    let frames = |t: &Tensor, start, len| t.narrow(1, start, len).unwrap();
    assert!(max_abs_diff(&frames(&a, 0, 2), &frames(&b, 0, 2)) < 1e-4);
    assert!(max_abs_diff(&frames(&a, 2, 1), &frames(&b, 2, 1)) > 0.0);
}

// ─── Conditioning ────────────────────────────────────────────────────────────

#[test]
fn full_condition_drop_ignores_instruction_content() {
    for kind in [ConditionerKind::Film, ConditionerKind::Attention] {
        let varmap = VarMap::new();
        let model = build(kind, VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu));
        randomize_conditioner(&varmap);

        let clip = video(2, 2, 16);
        let first = Tensor::randn(0f32, 1.0, (2, 3, TEXT_DIM), &Device::Cpu).unwrap();
        let second = Tensor::randn(0f32, 1.0, (2, 3, TEXT_DIM), &Device::Cpu).unwrap();
        let run = |embeds: &Tensor, p: f64| {
            model
                .forward(&clip, None, Some(embeds), Some(p), false)
                .unwrap()
        };

        assert!(max_abs_diff(&run(&first, 1.0), &run(&second, 1.0)) < 1e-5);
        assert!(max_abs_diff(&run(&first, 0.0), &run(&second, 0.0)) > 1e-5);
    }
}

#[test]
fn guidance_interpolates_between_null_and_conditioned() {
    let varmap = VarMap::new();
    let model = build(
        ConditionerKind::Film,
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
    );
    randomize_conditioner(&varmap);
    let clip = video(1, 2, 16);
    let embeds = Tensor::randn(0f32, 1.0, (1, 3, TEXT_DIM), &Device::Cpu).unwrap();
    let text = TextInput::Embeds(&embeds);

    let cond = model.forward_cond(&clip, text, 0.0).unwrap();
    let null = model.forward_cond(&clip, text, 1.0).unwrap();
    let guided = model.forward_with_cond_scale(&clip, text, 2.0).unwrap();
    // scale 2: guided = 2 * cond - null
    let expected = ((&cond * 2.0).unwrap() - &null).unwrap();
    assert!(max_abs_diff(&guided, &expected) < 1e-4);
}

#[test]
fn raw_instructions_go_through_the_text_encoder() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let tokenizer =
        TokenizerWrapper::from_vocab(&["pick", "up", "the", "red", "block", "open", "drawer"])
            .unwrap();
    let encoder = TokenEmbeddingTextEncoder::new(tokenizer, TEXT_DIM, vb.pp("text")).unwrap();
    let model = build(ConditionerKind::Attention, vb)
        .with_text_encoder(Box::new(encoder))
        .unwrap();

    let texts = ["pick up the red block", "open the drawer"];
    let embeds = model.embed_texts(&texts).unwrap();
    assert_eq!(embeds.dims(), &[2, 5, TEXT_DIM]);

    let out = model
        .forward(&video(2, 2, 16), Some(&texts[..]), None, None, false)
        .unwrap();
    assert_eq!(out.dims(), &[2, 2, 3, 7]);
}

// ─── Full-size scenarios ─────────────────────────────────────────────────────

#[test]
#[ignore = "full MaxViT-T at 224px, two videos of 6 frames - run explicitly"]
fn maxvit_tiny_two_instructions_six_frames() {
    let device = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &device);
    let vit_cfg = MaxVitConfig::max_vit_tiny_224();
    let hl_cfg = HlTransformerConfig::default();
    let vit = MaxViT::new(&vit_cfg, vb.pp("vit")).unwrap();

    let words = [
        "bring", "me", "that", "apple", "sitting", "on", "the", "table", "please", "pass",
        "butter",
    ];
    let tokenizer = TokenizerWrapper::from_vocab(&words).unwrap();
    let encoder = TokenEmbeddingTextEncoder::new(tokenizer, 512, vb.pp("text")).unwrap();
    let model = HLTransformer::new(vit, &hl_cfg, vb)
        .unwrap()
        .with_text_encoder(Box::new(encoder))
        .unwrap();

    let video = Tensor::randn(0f32, 1.0, (2, 3, 6, 224, 224), &device).unwrap();
    let texts = [
        "bring me that apple sitting on the table",
        "please pass the butter",
    ];
    let out = model
        .forward(&video, Some(&texts[..]), None, None, false)
        .unwrap();
    assert_eq!(out.dims(), &[2, 6, 11, 256]);
}

#[test]
#[ignore = "three-stage HLT over 16 frames at 112px - run explicitly"]
fn hlt_small_with_instruction_embeddings_is_finite() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = HLT::from_config(&HltConfig::hlt_small(), vb).unwrap();

    let video = Tensor::randn(0f32, 1.0, (1, 3, 16, 112, 112), &device).unwrap();
    let instructions = Tensor::randn(0f32, 1.0, (1, 10, 512), &device).unwrap();
    let out = model.forward(&video, &instructions, false).unwrap();
    assert_eq!(out.dims(), &[1, 16, 11, 256]);
    assert!(all_finite(&out));
}
