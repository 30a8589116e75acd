use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use clap::{Args, Parser, Subcommand};

use hlt_cli::config::{CliConfig, RunSettings};
use hlt_cli::logging;
use hlt_core::conditioning::{ClassifierFreeGuidance, TextInput, TokenEmbeddingTextEncoder};
use hlt_core::config::HltConfig;
use hlt_core::models::HLT;
use hlt_core::tokenizer::TokenizerWrapper;

/// Token count of the random instruction embeddings used without `--instruction`.
const RANDOM_INSTRUCTION_TOKENS: usize = 8;

#[derive(Parser)]
#[command(name = "hlt", about = "Run HLT video-to-action models")]
struct Cli {
    /// Config file to read instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a randomly initialized model and run it on a random video
    Run {
        #[command(flatten)]
        settings: SettingsArgs,

        /// Instruction text; repeat once per video in the batch.
        #[arg(long = "instruction")]
        instructions: Vec<String>,
    },
    /// Inspect or persist the runner configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the merged configuration as TOML
    Show {
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Write the merged configuration to the config file
    Init {
        #[command(flatten)]
        settings: SettingsArgs,
    },
}

#[derive(Args)]
struct SettingsArgs {
    /// JSON model configuration (HltConfig). Defaults to the small HLT.
    #[arg(long)]
    model_config: Option<String>,

    /// tokenizer.json used for instructions.
    #[arg(long)]
    tokenizer: Option<String>,

    /// Frames per video.
    #[arg(long)]
    frames: Option<usize>,

    /// Frame height in pixels.
    #[arg(long)]
    height: Option<usize>,

    /// Frame width in pixels.
    #[arg(long)]
    width: Option<usize>,

    /// Batch size when no instructions are given.
    #[arg(long)]
    batch: Option<usize>,

    /// Classifier-free guidance scale (1.0 disables guidance).
    #[arg(long)]
    cond_scale: Option<f64>,

    /// Weight data type: f32, f16, bf16 (bf16 needs a CUDA device).
    #[arg(long)]
    dtype: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl From<SettingsArgs> for CliConfig {
    fn from(args: SettingsArgs) -> Self {
        CliConfig {
            model_config: args.model_config,
            tokenizer: args.tokenizer,
            frames: args.frames,
            height: args.height,
            width: args.width,
            batch: args.batch,
            cond_scale: args.cond_scale,
            dtype: args.dtype,
            log_level: args.log_level,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(CliConfig::default_path);
    let file_config = match &cli.config {
        Some(path) => CliConfig::load_from(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => CliConfig::load(),
    };

    match cli.command {
        Command::Run {
            settings,
            instructions,
        } => {
            let merged = merged_config(file_config, settings);
            let settings = merged.resolve();
            logging::init_with_level(&settings.log_level);
            if let Some(path) = config_path.as_deref().filter(|p| p.exists()) {
                tracing::info!(path = %path.display(), "loaded config");
            }
            run(&settings, &instructions)
        }
        Command::Config { action } => match action {
            ConfigAction::Show { settings } => {
                let merged = merged_config(file_config, settings);
                print!("{}", merged.to_toml()?);
                Ok(())
            }
            ConfigAction::Init { settings } => {
                let merged = merged_config(file_config, settings);
                let path = match &cli.config {
                    Some(path) => {
                        merged.save_to(path)?;
                        path.clone()
                    }
                    None => merged.save()?,
                };
                eprintln!("Wrote config to: {}", path.display());
                Ok(())
            }
        },
    }
}

fn merged_config(mut file_config: CliConfig, args: SettingsArgs) -> CliConfig {
    file_config.merge(&CliConfig::from(args));
    file_config
}

fn parse_dtype(name: &str, device: &Device) -> anyhow::Result<DType> {
    let dtype = match name.to_lowercase().as_str() {
        "f32" | "fp32" | "float32" => DType::F32,
        "f16" | "fp16" | "float16" => DType::F16,
        "bf16" | "bfloat16" => DType::BF16,
        other => anyhow::bail!("unsupported dtype {other:?} (expected f32, f16 or bf16)"),
    };
    // CPU matmul has no bf16 kernel
    if dtype == DType::BF16 && device.is_cpu() {
        anyhow::bail!("bf16 needs a CUDA device; use f32 or f16 on CPU");
    }
    Ok(dtype)
}

fn load_model_config(path: Option<&Path>) -> anyhow::Result<HltConfig> {
    match path {
        Some(path) => HltConfig::from_json_file(path)
            .with_context(|| format!("reading model config {}", path.display())),
        None => Ok(HltConfig::hlt_small()),
    }
}

fn build_tokenizer(
    path: Option<&Path>,
    instructions: &[String],
) -> anyhow::Result<TokenizerWrapper> {
    match path {
        Some(path) => TokenizerWrapper::from_file(path),
        None => {
            let words: Vec<&str> = instructions
                .iter()
                .flat_map(|text| text.split_whitespace())
                .collect();
            TokenizerWrapper::from_vocab(&words)
        }
    }
}

fn run(settings: &RunSettings, instructions: &[String]) -> anyhow::Result<()> {
    let device = Device::cuda_if_available(0)?;
    let dtype = parse_dtype(&settings.dtype, &device)?;
    let cfg = load_model_config(settings.model_config.as_deref())?;
    cfg.max_vit_config().check_spatial(settings.height, settings.width)?;
    anyhow::ensure!(settings.frames > 0, "--frames must be positive");

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, &device);

    let build_start = Instant::now();
    let mut model = HLT::from_config(&cfg, vb.pp("hlt"))?;
    let batch = if instructions.is_empty() {
        settings.batch
    } else {
        let tokenizer = build_tokenizer(settings.tokenizer.as_deref(), instructions)?;
        let encoder =
            TokenEmbeddingTextEncoder::new(tokenizer, cfg.text_embed_dim, vb.pp("text_encoder"))?;
        model = model.with_text_encoder(Box::new(encoder))?;
        instructions.len()
    };
    tracing::info!(
        elapsed_ms = build_start.elapsed().as_millis() as u64,
        ?dtype,
        ?device,
        "model initialized"
    );

    let video = Tensor::randn(
        0f32,
        1.0,
        (batch, 3, settings.frames, settings.height, settings.width),
        &device,
    )?
    .to_dtype(dtype)?;

    let texts: Vec<&str> = instructions.iter().map(String::as_str).collect();
    let random_embeds;
    let text = if texts.is_empty() {
        random_embeds = Tensor::randn(
            0f32,
            1.0,
            (batch, RANDOM_INSTRUCTION_TOKENS, cfg.text_embed_dim),
            &device,
        )?
        .to_dtype(dtype)?;
        TextInput::Embeds(&random_embeds)
    } else {
        TextInput::Texts(&texts)
    };

    let start = Instant::now();
    let logits = model.forward_with_cond_scale(&video, text, settings.cond_scale)?;
    let elapsed = start.elapsed();
    tracing::info!(
        shape = ?logits.dims(),
        cond_scale = settings.cond_scale,
        elapsed_ms = elapsed.as_millis() as u64,
        "forward complete"
    );

    let last_frame = logits.i((.., settings.frames - 1))?;
    let bins = last_frame.argmax(D::Minus1)?.to_vec2::<u32>()?;
    println!("logits shape: {:?}", logits.dims());
    println!("forward time: {:.1} ms", elapsed.as_secs_f64() * 1e3);
    for (i, row) in bins.iter().enumerate() {
        println!("video {i} last-frame action bins: {row:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dtype() {
        let cpu = Device::Cpu;
        assert_eq!(parse_dtype("f32", &cpu).unwrap(), DType::F32);
        assert_eq!(parse_dtype("FP16", &cpu).unwrap(), DType::F16);
        assert!(parse_dtype("int8", &cpu).is_err());
    }

    #[test]
    fn test_bf16_rejected_on_cpu() {
        let err = parse_dtype("bf16", &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("CUDA"));
    }
}
