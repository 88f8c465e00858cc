//! Configuration structures for the animation front-end

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Directory layout and runtime switches for an [`Animator`](crate::generate::Animator)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimateConfig {
    /// Personalized base model checkpoints (LDM layout)
    pub base_model_dir: PathBuf,
    /// Motion module checkpoints (denoiser key space)
    pub motion_module_dir: PathBuf,
    /// Pretrained reference weights in diffusers layout (vae/, text_encoder/, unet/, tokenizer/)
    pub pretrained_model_dir: PathBuf,
    /// Where the most recent sample is written
    pub output_dir: PathBuf,
    /// Optional JSON file overriding [`InferenceConfig`]
    #[serde(default)]
    pub inference_config: Option<PathBuf>,
    /// Hub repository used when the pretrained directory has no tokenizer.json
    #[serde(default = "default_tokenizer_repo")]
    pub tokenizer_repo: String,
    /// Run on CPU even when CUDA is available
    #[serde(default)]
    pub cpu: bool,
    /// Keep module weights in float16
    #[serde(default)]
    pub f16: bool,
}

fn default_tokenizer_repo() -> String {
    "openai/clip-vit-large-patch14".to_string()
}

impl AnimateConfig {
    /// Standard layout under a single models root:
    /// `DreamBooth_LoRA/`, `Motion_Module/` and `StableDiffusion/stable-diffusion-v1-5/`.
    pub fn from_models_root(models_root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        let root = models_root.into();
        Self {
            base_model_dir: root.join("DreamBooth_LoRA"),
            motion_module_dir: root.join("Motion_Module"),
            pretrained_model_dir: root.join("StableDiffusion").join("stable-diffusion-v1-5"),
            output_dir: output_dir.into(),
            inference_config: None,
            tokenizer_repo: default_tokenizer_repo(),
            cpu: false,
            f16: false,
        }
    }
}

impl Default for AnimateConfig {
    fn default() -> Self {
        Self::from_models_root("models", "samples")
    }
}

/// Euler discrete noise schedule handed to the sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EulerSchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: String,
    pub steps_offset: usize,
    pub clip_sample: bool,
}

impl Default for EulerSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "linear".to_string(),
            steps_offset: 1,
            clip_sample: false,
        }
    }
}

/// Spatial layout of the 2D denoiser the motion layers are grafted onto
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenoiserLayoutConfig {
    /// Output channels of each down block (up blocks mirror it)
    pub block_out_channels: Vec<usize>,
    /// Resnets per down block; up blocks hold one more
    pub layers_per_block: usize,
    /// Spatial downsampling from pixels to latents
    pub vae_scale_factor: usize,
    /// Latent channels produced by the autoencoder
    pub latent_channels: usize,
}

impl Default for DenoiserLayoutConfig {
    fn default() -> Self {
        Self {
            block_out_channels: vec![320, 640, 1280, 1280],
            layers_per_block: 2,
            vae_scale_factor: 8,
            latent_channels: 4,
        }
    }
}

/// Temporal module hyper-parameters (`unet_additional_kwargs`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionModuleConfig {
    pub use_motion_module: bool,
    /// Block resolutions (1, 2, 4, 8 ...) that receive a motion module
    pub motion_module_resolutions: Vec<usize>,
    pub motion_module_mid_block: bool,
    pub motion_module_decoder_only: bool,
    pub num_attention_heads: usize,
    pub num_transformer_block: usize,
    pub attention_block_types: Vec<String>,
    pub temporal_position_encoding: bool,
    pub temporal_position_encoding_max_len: usize,
    pub temporal_attention_dim_div: usize,
}

impl Default for MotionModuleConfig {
    fn default() -> Self {
        Self {
            use_motion_module: true,
            motion_module_resolutions: vec![1, 2, 4, 8],
            motion_module_mid_block: false,
            motion_module_decoder_only: false,
            num_attention_heads: 8,
            num_transformer_block: 1,
            attention_block_types: vec!["Temporal_Self".to_string(), "Temporal_Self".to_string()],
            temporal_position_encoding: true,
            temporal_position_encoding_max_len: 24,
            temporal_attention_dim_div: 1,
        }
    }
}

/// Inference-time model configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default, rename = "noise_scheduler_kwargs")]
    pub noise_scheduler: EulerSchedulerConfig,
    #[serde(default, rename = "unet_additional_kwargs")]
    pub motion_module: MotionModuleConfig,
    #[serde(default)]
    pub denoiser: DenoiserLayoutConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid dimensions: height={height}, width={width}. Must be a positive multiple of {factor}")]
    InvalidDimensions {
        height: usize,
        width: usize,
        factor: usize,
    },
    #[error("Invalid frame count: {0}. Must be at least 1")]
    InvalidFrameCount(usize),
    #[error("Invalid step count: {0}. Must be at least 1")]
    InvalidStepCount(usize),
    #[error("Invalid seed: {0:?}")]
    InvalidSeed(String),
}
