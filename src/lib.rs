//! Candle-Animate: personalized text-to-video on Candle.
//!
//! Merges personalized base-model checkpoints (LDM layout) and motion-module
//! checkpoints into a pretrained diffusers-layout model state, then drives a
//! sampler to render short clips.

pub mod config;
pub mod convert;
pub mod generate;
pub mod loader;
pub mod pipeline;
pub mod presets;
pub mod queue;
pub mod state;
pub mod store;
pub mod swap;
pub mod temporal;
pub mod utils;
pub mod weights;

pub use config::{AnimateConfig, InferenceConfig};
pub use convert::{KeyTranslator, ModuleKind};
pub use generate::{
    Animator, GenerateError, GenerationMetadata, GenerationRequest, GenerationResult, SeedRequest,
};
pub use pipeline::{PreviewSampler, Sampler, SamplingParams, SamplingPipeline};
pub use queue::{QueueError, RequestQueue};
pub use state::ModelState;
pub use store::{CheckpointKind, CheckpointRecord, CheckpointStore};
pub use swap::{SwapController, SwapError, SwapOutcome};
pub use weights::{LoadMode, ModuleWeights};
