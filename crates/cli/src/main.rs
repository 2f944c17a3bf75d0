mod config;
mod logging;

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use llava_reward_core::{
    conversation::ConversationTemplates,
    device::{parse_dtype, DeviceSpec},
    evaluate_with,
    models::{ModelRegistry, TransferMode},
    EvaluateRequest,
};

use crate::config::CliConfig;
use crate::logging::LogFormat;

#[derive(Parser)]
#[command(name = "llava-reward", about = "Score an image and prompt with a LLaVA reward model")]
struct Cli {
    /// Log level used when RUST_LOG is unset (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a checkpoint, convert it to a reward model and print one reward
    Score {
        /// Checkpoint directory or HuggingFace repo id [default: liuhaotian/llava-v1.5-7b]
        #[arg(long)]
        model_path: Option<String>,

        /// Local path or http(s) URL of the image.
        #[arg(long)]
        image_file: String,

        #[arg(long)]
        prompt: String,

        /// Compute device: cpu, cuda[:N], metal[:N] [default: cuda]
        #[arg(long)]
        device: Option<String>,

        /// Base checkpoint for projector-only releases.
        #[arg(long)]
        model_base: Option<String>,

        /// Conversation template; chosen from the model name when unset.
        #[arg(long)]
        conv_mode: Option<String>,

        /// tokenizer.json to use instead of the checkpoint's.
        #[arg(long)]
        tokenizer: Option<String>,

        /// Weight dtype: auto, fp32, fp16, bf16 [default: auto]
        #[arg(long)]
        dtype: Option<String>,

        /// Fail when any causal LM parameter has no reward model counterpart.
        #[arg(long)]
        strict_transfer: bool,
    },
    /// List the built-in conversation templates
    Templates,
    /// Manage the persistent config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config file contents
    Show,
    /// Write the given values into the config file
    Save {
        #[arg(long)]
        model_path: Option<String>,
        #[arg(long)]
        model_base: Option<String>,
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        dtype: Option<String>,
        #[arg(long)]
        conv_mode: Option<String>,
        #[arg(long)]
        tokenizer: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = CliConfig::load();
    let log_level = cli.log_level.clone().or_else(|| settings.log_level.clone());
    logging::init(log_level.as_deref(), LogFormat::from_env())?;
    if let Some(path) = CliConfig::default_path().filter(|p| p.exists()) {
        tracing::debug!(path = %path.display(), "loaded config file");
    }

    match cli.command {
        Command::Score {
            model_path,
            image_file,
            prompt,
            device,
            model_base,
            conv_mode,
            tokenizer,
            dtype,
            strict_transfer,
        } => {
            settings.merge(&CliConfig {
                model_path,
                model_base,
                device,
                dtype,
                conv_mode,
                tokenizer,
                log_level: None,
            });
            let reward = score(&settings, &image_file, &prompt, strict_transfer)?;
            println!("Reward value: {reward}");
        }
        Command::Templates => {
            for name in ConversationTemplates::builtin().names() {
                println!("{name}");
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                let path = CliConfig::default_path();
                match &path {
                    Some(p) => eprintln!("# {}", p.display()),
                    None => eprintln!("# no config directory on this platform"),
                }
                print!("{}", toml::to_string_pretty(&settings)?);
            }
            ConfigAction::Save {
                model_path,
                model_base,
                device,
                dtype,
                conv_mode,
                tokenizer,
            } => {
                settings.merge(&CliConfig {
                    model_path,
                    model_base,
                    device,
                    dtype,
                    conv_mode,
                    tokenizer,
                    log_level: cli.log_level,
                });
                let path = settings.save()?;
                eprintln!("Saved config to: {}", path.display());
            }
        },
    }
    Ok(())
}

fn score(
    settings: &CliConfig,
    image_file: &str,
    prompt: &str,
    strict_transfer: bool,
) -> anyhow::Result<f32> {
    let spec: DeviceSpec = settings.device_or_default().parse()?;
    let device = spec
        .open()
        .with_context(|| format!("failed to open device {spec}"))?;
    let dtype = parse_dtype(settings.dtype_or_default(), &device)?;
    tracing::info!(device = %spec, ?dtype, "scoring");

    let request = EvaluateRequest {
        model_path: settings.model_path_or_default(),
        model_base: settings.model_base.as_deref(),
        image: image_file,
        prompt,
        conv_mode: settings.conv_mode.as_deref(),
        tokenizer_path: settings.tokenizer.as_deref().map(Path::new),
        transfer_mode: if strict_transfer {
            TransferMode::Strict
        } else {
            TransferMode::Lenient
        },
    };
    let reward = evaluate_with(&request, &ModelRegistry::builtin(), &device, dtype)?;
    Ok(reward)
}
