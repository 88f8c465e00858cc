//! Sampling pipeline seam and frame persistence
//!
//! The denoising loop itself lives behind [`Sampler`]. A [`SamplingPipeline`]
//! binds the current model state (as `VarBuilder`s sharing the merged
//! weights), the tokenizer, and the fixed noise schedule for one run.

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::VarBuilder;
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, RgbImage};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::{DenoiserLayoutConfig, EulerSchedulerConfig};
use crate::state::ModelState;
use crate::utils::deterministic_rng::Pcg32;

/// Per-run sampling inputs
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub video_length: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    /// Resolved seed; the sampler must draw all of its noise from it
    pub seed: u64,
}

/// Model state bound for one sampling run
pub struct SamplingPipeline<'a> {
    pub vae: VarBuilder<'static>,
    pub text_encoder: VarBuilder<'static>,
    pub unet: VarBuilder<'static>,
    pub tokenizer: &'a Tokenizer,
    pub scheduler: &'a EulerSchedulerConfig,
    pub layout: &'a DenoiserLayoutConfig,
    device: Device,
    dtype: DType,
}

impl<'a> SamplingPipeline<'a> {
    pub fn new(
        state: &'a ModelState,
        scheduler: &'a EulerSchedulerConfig,
        layout: &'a DenoiserLayoutConfig,
    ) -> Self {
        Self {
            vae: state.autoencoder.var_builder(),
            text_encoder: state.text_encoder.var_builder(),
            unet: state.denoiser.var_builder(),
            tokenizer: &state.tokenizer,
            scheduler,
            layout,
            device: state.denoiser.device().clone(),
            dtype: state.denoiser.dtype(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Token ids of `text`, with special tokens
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| candle_core::Error::Msg(format!("Tokenization failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// A text-to-video sampler
pub trait Sampler: Send {
    /// Produce frames shaped `(video_length, 3, height, width)` with values in `[0, 1]`
    fn sample(&mut self, pipeline: &SamplingPipeline<'_>, params: &SamplingParams) -> Result<Tensor>;
}

/// Deterministic stand-in sampler
///
/// Renders seeded latent noise (`latent_channels` wide, previewed through its
/// first three channels), tinted by the prompt tokens, at the requested size. Useful to exercise model swaps and the output path without a
/// denoising network; the step count is ignored.
#[derive(Debug, Clone)]
pub struct PreviewSampler {
    /// How much of each frame is drawn from the shared first-frame noise
    pub temporal_coherence: f32,
}

impl Default for PreviewSampler {
    fn default() -> Self {
        Self {
            temporal_coherence: 0.75,
        }
    }
}

impl PreviewSampler {
    /// Per-channel tint in [-0.5, 0.5) derived from token ids
    fn tint(ids: &[u32], channels: usize) -> Vec<f32> {
        (0..channels)
            .map(|c| {
                let h = ids.iter().fold(c as u64 + 1, |acc, &id| {
                    acc.wrapping_mul(31).wrapping_add(id as u64)
                });
                (h % 256) as f32 / 256.0 - 0.5
            })
            .collect()
    }
}

impl Sampler for PreviewSampler {
    fn sample(&mut self, pipeline: &SamplingPipeline<'_>, params: &SamplingParams) -> Result<Tensor> {
        let factor = pipeline.layout.vae_scale_factor.max(1);
        let (h, w) = (params.height / factor, params.width / factor);
        let frames = params.video_length;
        let device = pipeline.device();

        info!(
            frames,
            height = params.height,
            width = params.width,
            seed = params.seed,
            "Preview sampling"
        );

        let channels = pipeline.layout.latent_channels;
        if channels < 3 {
            candle_core::bail!("Preview needs at least 3 latent channels, got {channels}");
        }

        let mut rng = Pcg32::from_seed(params.seed);
        let shared = rng.randn((1, channels, h, w), device)?;
        let per_frame = rng.randn((frames, channels, h, w), device)?;
        let a = self.temporal_coherence.clamp(0.0, 1.0) as f64;
        // The first three latent channels stand in for RGB
        let latents = (shared * a)?
            .broadcast_add(&(per_frame * (1.0 - a))?)?
            .narrow(1, 0, 3)?;

        let positive = Self::tint(&pipeline.tokenize(&params.prompt)?, 3);
        let negative = Self::tint(&pipeline.tokenize(&params.negative_prompt)?, 3);
        let strength = (params.guidance_scale / 10.0).clamp(0.0, 1.0) as f32;
        let tint: Vec<f32> = positive
            .iter()
            .zip(&negative)
            .map(|(p, n)| (p - 0.5 * n) * strength)
            .collect();
        let tint = Tensor::from_vec(tint, (1, 3, 1, 1), device)?;

        let frames_out = latents
            .affine(0.25, 0.5)?
            .broadcast_add(&tint)?
            .clamp(0f32, 1f32)?
            .upsample_nearest2d(params.height, params.width)?;
        debug!(shape = ?frames_out.dims(), "Preview frames");
        Ok(frames_out)
    }
}

/// Convert frame `f` of `(F, 3, H, W)` values in [0, 1] to an RGB image
fn frame_to_image(frames: &Tensor, f: usize) -> Result<RgbImage> {
    let (_, _, height, width) = frames.dims4()?;
    let frame = frames
        .i(f)?
        .to_dtype(DType::F32)?
        .clamp(0f32, 1f32)?
        .affine(255.0, 0.0)?
        .round()?
        .to_dtype(DType::U8)?;
    let data: Vec<u8> = frame.permute((1, 2, 0))?.flatten_all()?.to_vec1()?;

    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| candle_core::Error::Msg("Failed to create image".to_string()))
}

/// Save each frame as `frame_XXXX.png` under `output_dir`
pub fn save_video_frames(frames: &Tensor, output_dir: impl AsRef<Path>) -> Result<()> {
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir)
        .map_err(|e| candle_core::Error::Msg(format!("Failed to create output dir: {e}")))?;

    let (num_frames, _, _, _) = frames.dims4()?;
    for f in 0..num_frames {
        let img = frame_to_image(frames, f)?;
        let path = output_dir.join(format!("frame_{f:04}.png"));
        img.save(&path)
            .map_err(|e| candle_core::Error::Msg(format!("Failed to save frame: {e}")))?;
    }
    Ok(())
}

/// Save the frames as a looping animated GIF
pub fn save_gif(frames: &Tensor, path: impl AsRef<Path>, fps: u32) -> Result<()> {
    let path = path.as_ref();
    let file = std::fs::File::create(path)
        .map_err(|e| candle_core::Error::Msg(format!("Failed to create {}: {e}", path.display())))?;

    let mut encoder = GifEncoder::new(file);
    encoder
        .set_repeat(Repeat::Infinite)
        .map_err(|e| candle_core::Error::Msg(format!("Failed to write GIF: {e}")))?;

    let delay = Delay::from_numer_denom_ms(1000, fps.max(1));
    let (num_frames, _, _, _) = frames.dims4()?;
    for f in 0..num_frames {
        let rgba = DynamicImage::ImageRgb8(frame_to_image(frames, f)?).to_rgba8();
        encoder
            .encode_frame(Frame::from_parts(rgba, 0, 0, delay))
            .map_err(|e| candle_core::Error::Msg(format!("Failed to write GIF frame: {e}")))?;
    }
    Ok(())
}
