//! Personalized text-to-video from the command line
//!
//! # Usage
//!
//! ```bash
//! animate --models ./models list
//! animate --models ./models generate \
//!     --base-model toonyou_beta3.safetensors \
//!     --motion-module mm_sd_v14.ckpt \
//!     --prompt "a girl under cherry blossoms"
//! animate --models ./models example 1
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use candle_animate::{
    generate::{Animator, GenerationRequest, SeedRequest, DEFAULT_NEGATIVE_PROMPT},
    pipeline::PreviewSampler,
    presets,
    queue::{RequestQueue, DEFAULT_CAPACITY},
    AnimateConfig, CheckpointStore,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Animate personalized text-to-image models with a motion module"
)]
struct Args {
    /// Models root holding DreamBooth_LoRA/, Motion_Module/ and StableDiffusion/
    #[arg(short, long, default_value = "models")]
    models: PathBuf,

    /// Directory the latest sample is written to
    #[arg(short, long, default_value = "samples")]
    output: PathBuf,

    /// Pretrained diffusers directory (defaults to <models>/StableDiffusion/stable-diffusion-v1-5)
    #[arg(long)]
    pretrained: Option<PathBuf>,

    /// JSON inference config overriding the built-in defaults
    #[arg(long)]
    inference_config: Option<PathBuf>,

    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,

    /// Use float16 precision
    #[arg(long)]
    f16: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available base models, motion modules and gallery presets
    List,

    /// Generate a clip from a prompt
    Generate {
        /// Base model file name (under DreamBooth_LoRA/)
        #[arg(long)]
        base_model: String,

        /// Motion module file name (under Motion_Module/)
        #[arg(long)]
        motion_module: String,

        #[arg(short, long)]
        prompt: String,

        #[arg(long, default_value = DEFAULT_NEGATIVE_PROMPT)]
        negative_prompt: String,

        /// Must be a multiple of 8
        #[arg(long, default_value_t = 512)]
        width: usize,

        /// Must be a multiple of 8
        #[arg(long, default_value_t = 512)]
        height: usize,

        /// Seed; zero or negative draws a random one
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        seed: String,

        #[arg(long, default_value_t = 16)]
        frames: usize,

        #[arg(long, default_value_t = 25)]
        steps: usize,

        #[arg(long, default_value_t = 8.0)]
        guidance_scale: f64,
    },

    /// Run a gallery preset by 1-based index or name
    Example { preset: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_animate=info".parse()?)
                .add_directive("animate=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = AnimateConfig::from_models_root(&args.models, &args.output);
    if let Some(pretrained) = &args.pretrained {
        config.pretrained_model_dir = pretrained.clone();
    }
    config.inference_config = args.inference_config.clone();
    config.cpu = args.cpu;
    config.f16 = args.f16;

    match args.command {
        Command::List => list(&config),
        Command::Generate {
            base_model,
            motion_module,
            prompt,
            negative_prompt,
            width,
            height,
            seed,
            frames,
            steps,
            guidance_scale,
        } => {
            let seed: SeedRequest = seed.parse().context("Invalid --seed")?;
            let request = GenerationRequest {
                prompt,
                negative_prompt,
                width,
                height,
                seed,
                video_length: frames,
                num_inference_steps: steps,
                guidance_scale,
            };
            run(config, &request, &base_model, &motion_module)
        }
        Command::Example { preset } => {
            let preset = presets::find(&preset)
                .with_context(|| format!("No gallery preset {preset:?} (try `animate list`)"))?;
            info!("Running preset {}", preset.name);
            let request = preset.request().context("Invalid preset")?;
            run(config, &request, preset.base_model, preset.motion_module)
        }
    }
}

fn list(config: &AnimateConfig) -> Result<()> {
    let store = CheckpointStore::new(&config.base_model_dir, &config.motion_module_dir);

    println!("Base models ({}):", config.base_model_dir.display());
    for record in store.list_base_models() {
        println!("  {}", record.name);
    }
    println!("Motion modules ({}):", config.motion_module_dir.display());
    for record in store.list_motion_modules() {
        println!("  {}", record.name);
    }
    println!("Gallery:");
    for (i, preset) in presets::gallery().iter().enumerate() {
        println!(
            "  {}. {} ({} + {})",
            i + 1,
            preset.name,
            preset.base_model,
            preset.motion_module
        );
    }
    Ok(())
}

fn run(config: AnimateConfig, request: &GenerationRequest, base_model: &str, motion_module: &str) -> Result<()> {
    info!("Prompt: {}", request.prompt);
    info!(
        "Video: {}x{} @ {} frames, {} steps, guidance {}",
        request.width, request.height, request.video_length, request.num_inference_steps, request.guidance_scale
    );

    let animator = Animator::new(config, Box::new(PreviewSampler::default()))
        .context("Failed to initialize animator")?;
    let queue = RequestQueue::spawn(animator, DEFAULT_CAPACITY);
    let result = queue
        .submit(request.clone(), base_model, motion_module)
        .context("Failed to enqueue request")?
        .wait()
        .context("Generation failed")?;
    queue.shutdown();

    info!("Seed: {}", result.metadata.seed);
    info!("Sample written to {}", result.artifact_path.display());
    println!("{}", serde_json::to_string_pretty(&result.metadata)?);
    Ok(())
}
