//! Generation orchestrator
//!
//! [`Animator`] owns the model state and everything needed to turn a prompt
//! into a short clip: it reconciles the requested checkpoints, resolves the
//! seed, runs the sampler and writes the clip plus a metadata record to a
//! fixed location under the output directory.

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::config::{AnimateConfig, ConfigError, InferenceConfig};
use crate::convert::KeyTranslator;
use crate::loader::{load_model_config, LoaderError};
use crate::pipeline::{save_gif, save_video_frames, Sampler, SamplingParams, SamplingPipeline};
use crate::state::{ModelState, StateError};
use crate::store::{CheckpointStore, StoreError};
use crate::swap::{SwapController, SwapError};

/// Largest seed the generator accepts; positive requests are masked to it
pub const SEED_MASK: u64 = (1 << 63) - 1;

/// Frame rate of the written GIF
pub const OUTPUT_FPS: u32 = 8;

pub const DEFAULT_NEGATIVE_PROMPT: &str = "worst quality, low quality, nsfw, logo";

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to swap checkpoint")]
    Swap(#[from] SwapError),

    #[error("Failed to load pretrained state")]
    State(#[from] StateError),

    #[error("Failed to read inference config")]
    InferenceConfig(#[from] LoaderError),

    #[error("Sampling failed: {0}")]
    Sampling(#[source] candle_core::Error),

    #[error("Sampler returned frames of shape {actual:?}, expected {expected:?}")]
    FrameShape {
        expected: (usize, usize, usize, usize),
        actual: Vec<usize>,
    },

    #[error("Failed to write output: {0}")]
    Output(#[source] candle_core::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize metadata: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GenerateError>;

/// Requested seed, as typed by a user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeedRequest {
    /// Reproduce a previous run; only the low 63 bits are used
    Fixed(u64),
    /// Draw a fresh seed
    #[default]
    Random,
}

impl FromStr for SeedRequest {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let value: i128 = s
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidSeed(s.to_string()))?;
        if value > 0 {
            // Masking keeps only low bits, so truncation loses nothing
            Ok(SeedRequest::Fixed(value as u64))
        } else {
            Ok(SeedRequest::Random)
        }
    }
}

/// Turn a seed request into the seed actually used
pub fn resolve_seed(request: SeedRequest) -> u64 {
    match request {
        SeedRequest::Fixed(seed) => seed & SEED_MASK,
        SeedRequest::Random => rand::thread_rng().gen_range(1..=SEED_MASK),
    }
}

/// One text-to-video request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub seed: SeedRequest,
    pub video_length: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            width: 512,
            height: 512,
            seed: SeedRequest::Random,
            video_length: 16,
            num_inference_steps: 25,
            guidance_scale: 8.0,
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Check the request against the latent downsampling `factor`
    pub fn validate(&self, factor: usize) -> std::result::Result<(), ConfigError> {
        let factor = factor.max(1);
        if self.width == 0 || self.height == 0 || self.width % factor != 0 || self.height % factor != 0 {
            return Err(ConfigError::InvalidDimensions {
                height: self.height,
                width: self.width,
                factor,
            });
        }
        if self.video_length == 0 {
            return Err(ConfigError::InvalidFrameCount(self.video_length));
        }
        if self.num_inference_steps == 0 {
            return Err(ConfigError::InvalidStepCount(self.num_inference_steps));
        }
        Ok(())
    }
}

/// Record written next to every sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub prompt: String,
    #[serde(rename = "n_prompt")]
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub seed: u64,
    pub base_model: String,
    pub motion_module: String,
}

#[derive(Debug)]
pub struct GenerationResult {
    /// `(video_length, 3, height, width)` in `[0, 1]`
    pub frames: Tensor,
    pub artifact_path: PathBuf,
    pub metadata: GenerationMetadata,
}

/// Pick the CUDA device unless `cpu` is set or CUDA is unavailable
pub fn select_device(cpu: bool) -> Device {
    if cpu {
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            warn!("CUDA not available: {}, falling back to CPU", e);
            Device::Cpu
        }
    }
}

/// Owns the model state and serves generation requests one at a time
pub struct Animator {
    config: AnimateConfig,
    inference: InferenceConfig,
    store: CheckpointStore,
    swap: SwapController,
    state: ModelState,
    sampler: Box<dyn Sampler>,
}

impl Animator {
    /// Load the pretrained modules and select the first listed checkpoints
    pub fn new(config: AnimateConfig, sampler: Box<dyn Sampler>) -> Result<Self> {
        let inference: InferenceConfig = match &config.inference_config {
            Some(path) => load_model_config(path)?,
            None => InferenceConfig::default(),
        };

        let device = select_device(config.cpu);
        let dtype = if config.f16 { DType::F16 } else { DType::F32 };
        info!(device = ?device, dtype = ?dtype, "Loading model state");

        let state = ModelState::load_pretrained(&config, &inference, &device, dtype)?;
        let mut animator = Self::from_state(config, inference, state, sampler);

        if let Some(record) = animator.store.list_base_models().into_iter().next() {
            animator.swap.swap_base_model(&mut animator.state, &record)?;
        }
        if let Some(record) = animator.store.list_motion_modules().into_iter().next() {
            animator.swap.swap_motion_module(&mut animator.state, &record)?;
        }
        Ok(animator)
    }

    /// Wrap an already loaded state; nothing is swapped
    pub fn from_state(
        config: AnimateConfig,
        inference: InferenceConfig,
        state: ModelState,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        let store = CheckpointStore::new(&config.base_model_dir, &config.motion_module_dir);
        let swap = SwapController::new(KeyTranslator::new(inference.denoiser.layers_per_block));
        Self {
            config,
            inference,
            store,
            swap,
            state,
            sampler,
        }
    }

    pub fn config(&self) -> &AnimateConfig {
        &self.config
    }

    pub fn inference(&self) -> &InferenceConfig {
        &self.inference
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    /// Select a base model by file name
    pub fn select_base_model(&mut self, name: &str) -> Result<()> {
        let record = self.store.find_base_model(name)?;
        self.swap.swap_base_model(&mut self.state, &record)?;
        Ok(())
    }

    /// Select a motion module by file name
    pub fn select_motion_module(&mut self, name: &str) -> Result<()> {
        let record = self.store.find_motion_module(name)?;
        self.swap.swap_motion_module(&mut self.state, &record)?;
        Ok(())
    }

    /// Render `request` with the named checkpoints and persist the result
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
        base_model: &str,
        motion_module: &str,
    ) -> Result<GenerationResult> {
        request.validate(self.inference.denoiser.vae_scale_factor)?;

        self.select_base_model(base_model)?;
        self.select_motion_module(motion_module)?;

        let seed = resolve_seed(request.seed);
        info!(seed, base_model, motion_module, "Generating");

        let params = SamplingParams {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            width: request.width,
            height: request.height,
            video_length: request.video_length,
            num_inference_steps: request.num_inference_steps,
            guidance_scale: request.guidance_scale,
            seed,
        };

        let pipeline = SamplingPipeline::new(
            &self.state,
            &self.inference.noise_scheduler,
            &self.inference.denoiser,
        );
        let frames = self
            .sampler
            .sample(&pipeline, &params)
            .map_err(GenerateError::Sampling)?;

        let expected = (request.video_length, 3, request.height, request.width);
        if frames.dims4().ok() != Some(expected) {
            return Err(GenerateError::FrameShape {
                expected,
                actual: frames.dims().to_vec(),
            });
        }

        let metadata = GenerationMetadata {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            width: request.width,
            height: request.height,
            seed,
            base_model: base_model.to_string(),
            motion_module: motion_module.to_string(),
        };

        let artifact_path = persist(&self.config.output_dir, &frames, &metadata)?;
        info!("Saved sample to {}", artifact_path.display());

        Ok(GenerationResult {
            frames,
            artifact_path,
            metadata,
        })
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> GenerateError {
    let path = path.to_path_buf();
    move |source| GenerateError::Io { path, source }
}

/// Write `sample.gif`, `sample/frame_XXXX.png` and `sample.json`, replacing the previous sample
fn persist(output_dir: &Path, frames: &Tensor, metadata: &GenerationMetadata) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir).map_err(io_err(output_dir))?;

    let frame_dir = output_dir.join("sample");
    if frame_dir.exists() {
        debug!("Removing previous frames in {}", frame_dir.display());
        std::fs::remove_dir_all(&frame_dir).map_err(io_err(&frame_dir))?;
    }
    save_video_frames(frames, &frame_dir).map_err(GenerateError::Output)?;

    let gif_path = output_dir.join("sample.gif");
    save_gif(frames, &gif_path, OUTPUT_FPS).map_err(GenerateError::Output)?;

    let json_path = output_dir.join("sample.json");
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(&json_path, json).map_err(io_err(&json_path))?;

    Ok(gif_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_parsing() {
        assert_eq!("42".parse::<SeedRequest>().unwrap(), SeedRequest::Fixed(42));
        assert_eq!(" 7 ".parse::<SeedRequest>().unwrap(), SeedRequest::Fixed(7));
        assert_eq!("-1".parse::<SeedRequest>().unwrap(), SeedRequest::Random);
        assert_eq!("0".parse::<SeedRequest>().unwrap(), SeedRequest::Random);
        assert!("abc".parse::<SeedRequest>().is_err());
        assert!("".parse::<SeedRequest>().is_err());
    }

    #[test]
    fn test_gallery_seed_is_masked() {
        // Larger than i64::MAX, as in the example gallery
        let request: SeedRequest = "13204175718326964000".parse().unwrap();
        assert_eq!(resolve_seed(request), 13204175718326964000u64 & SEED_MASK);
    }

    #[test]
    fn test_seed_beyond_u64_keeps_low_bits() {
        let big = (1i128 << 64) + 5;
        let request: SeedRequest = big.to_string().parse().unwrap();
        assert_eq!(resolve_seed(request), 5);
    }

    #[test]
    fn test_random_seed_in_range() {
        for _ in 0..32 {
            let seed = resolve_seed(SeedRequest::Random);
            assert!(seed >= 1 && seed <= SEED_MASK);
        }
    }

    #[test]
    fn test_request_validation() {
        let mut request = GenerationRequest::new("a cat");
        assert!(request.validate(8).is_ok());

        request.width = 500;
        assert!(matches!(
            request.validate(8),
            Err(ConfigError::InvalidDimensions { width: 500, .. })
        ));

        request.width = 0;
        assert!(request.validate(8).is_err());

        request.width = 256;
        request.video_length = 0;
        assert!(matches!(request.validate(8), Err(ConfigError::InvalidFrameCount(0))));
    }

    #[test]
    fn test_metadata_json_field_names() {
        let metadata = GenerationMetadata {
            prompt: "a cat".to_string(),
            negative_prompt: "blurry".to_string(),
            width: 256,
            height: 128,
            seed: 3,
            base_model: "toon.safetensors".to_string(),
            motion_module: "mm.ckpt".to_string(),
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["n_prompt"], "blurry");
        assert_eq!(value["seed"], 3);
        assert!(value.get("negative_prompt").is_none());
    }
}
