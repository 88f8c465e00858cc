//! The in-memory model state
//!
//! Owns the three weight modules, the tokenizer, and the record of which
//! base model and motion module are currently merged into them. There is no
//! global instance: callers own a `ModelState` and lend it to the swap and
//! generation operations.

use crate::config::{AnimateConfig, InferenceConfig};
use crate::convert::ModuleKind;
use crate::loader::find_weight_file;
use crate::store::{BaseModelRecord, MotionModuleRecord};
use crate::temporal::declare_temporal_layers;
use crate::weights::{ModuleWeights, WeightsError};
use candle_core::{DType, Device};
use hf_hub::api::sync::Api;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Pretrained {component} weights not found under {dir}")]
    MissingComponent { component: &'static str, dir: PathBuf },

    #[error("Tokenizer unavailable: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Weights(#[from] WeightsError),
}

/// Currently loaded modules plus what has been merged into them
pub struct ModelState {
    pub autoencoder: ModuleWeights,
    pub text_encoder: ModuleWeights,
    pub denoiser: ModuleWeights,
    pub tokenizer: Tokenizer,
    pub(crate) base_model: Option<BaseModelRecord>,
    pub(crate) motion_module: Option<MotionModuleRecord>,
}

impl std::fmt::Debug for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelState")
            .field("autoencoder", &self.autoencoder)
            .field("text_encoder", &self.text_encoder)
            .field("denoiser", &self.denoiser)
            .field("base_model", &self.base_model.as_ref().map(|r| &r.name))
            .field("motion_module", &self.motion_module.as_ref().map(|r| &r.name))
            .finish()
    }
}

impl ModelState {
    /// Assemble a state from already loaded modules; nothing is merged yet
    pub fn from_parts(
        autoencoder: ModuleWeights,
        text_encoder: ModuleWeights,
        denoiser: ModuleWeights,
        tokenizer: Tokenizer,
    ) -> Self {
        Self {
            autoencoder,
            text_encoder,
            denoiser,
            tokenizer,
            base_model: None,
            motion_module: None,
        }
    }

    /// Load the pretrained reference modules from a diffusers directory
    ///
    /// The denoiser additionally declares the zero-initialized temporal
    /// layers described by `inference.motion_module`.
    pub fn load_pretrained(
        config: &AnimateConfig,
        inference: &InferenceConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, StateError> {
        let dir = &config.pretrained_model_dir;
        let prefer_fp16 = dtype == DType::F16;

        let component = |sub: &'static str, stem: &str| {
            find_weight_file(dir.join(sub), stem, prefer_fp16).ok_or_else(|| {
                StateError::MissingComponent {
                    component: sub,
                    dir: dir.clone(),
                }
            })
        };

        let vae_path = component("vae", "diffusion_pytorch_model")?;
        let text_encoder_path = component("text_encoder", "model")?;
        let unet_path = component("unet", "diffusion_pytorch_model")?;

        info!("Loading pretrained modules from {}", dir.display());
        info!("  VAE: {}", vae_path.display());
        info!("  Text encoder: {}", text_encoder_path.display());
        info!("  UNet: {}", unet_path.display());

        let autoencoder = ModuleWeights::from_file(ModuleKind::Autoencoder, &vae_path, dtype, device)?;
        let text_encoder =
            ModuleWeights::from_file(ModuleKind::TextEncoder, &text_encoder_path, dtype, device)?;
        let mut denoiser = ModuleWeights::from_file(ModuleKind::Denoiser, &unet_path, dtype, device)?;

        let declared =
            declare_temporal_layers(&mut denoiser, &inference.denoiser, &inference.motion_module)?;
        info!(
            spatial = denoiser.len() - declared,
            temporal = declared,
            "Denoiser key space ready"
        );

        let tokenizer = load_tokenizer(&dir.join("tokenizer"), &config.tokenizer_repo)?;

        Ok(Self::from_parts(autoencoder, text_encoder, denoiser, tokenizer))
    }

    /// Base model currently merged into the modules
    pub fn base_model(&self) -> Option<&BaseModelRecord> {
        self.base_model.as_ref()
    }

    /// Motion module currently merged into the denoiser
    pub fn motion_module(&self) -> Option<&MotionModuleRecord> {
        self.motion_module.as_ref()
    }

    pub fn module(&self, kind: ModuleKind) -> &ModuleWeights {
        match kind {
            ModuleKind::Autoencoder => &self.autoencoder,
            ModuleKind::TextEncoder => &self.text_encoder,
            ModuleKind::Denoiser => &self.denoiser,
        }
    }

    pub fn module_mut(&mut self, kind: ModuleKind) -> &mut ModuleWeights {
        match kind {
            ModuleKind::Autoencoder => &mut self.autoencoder,
            ModuleKind::TextEncoder => &mut self.text_encoder,
            ModuleKind::Denoiser => &mut self.denoiser,
        }
    }
}

/// Read `tokenizer.json` from `dir`, or fetch it from the hub
fn load_tokenizer(dir: &Path, repo: &str) -> Result<Tokenizer, StateError> {
    let local = dir.join("tokenizer.json");
    let path = if local.is_file() {
        local
    } else {
        info!("No tokenizer.json in {}, fetching from {}", dir.display(), repo);
        let api = Api::new().map_err(|e| StateError::Tokenizer(e.to_string()))?;
        api.model(repo.to_string())
            .get("tokenizer.json")
            .map_err(|e| StateError::Tokenizer(e.to_string()))?
    };

    Tokenizer::from_file(&path).map_err(|e| StateError::Tokenizer(format!("{}: {e}", path.display())))
}
