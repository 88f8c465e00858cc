//! Key-space translation for LDM-style checkpoints
//!
//! Personalized base models are distributed as single files in the original
//! latent-diffusion layout (`model.diffusion_model.*`, `first_stage_model.*`,
//! `cond_stage_model.transformer.*`). The in-memory modules use the diffusers
//! layout. Translation is purely structural: keys are renamed, and the 1x1
//! convolution attention weights of the autoencoder are viewed as linear
//! weights. Keys a module kind does not recognize are dropped.

mod clip;
mod unet;
mod vae;

use crate::loader::StateDict;
use candle_core::Result;
use std::fmt;

/// The three modules a base model checkpoint feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Autoencoder,
    TextEncoder,
    Denoiser,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 3] = [
        ModuleKind::Autoencoder,
        ModuleKind::TextEncoder,
        ModuleKind::Denoiser,
    ];

    /// Key prefix of this module inside an LDM checkpoint
    pub fn ldm_prefix(self) -> &'static str {
        match self {
            ModuleKind::Autoencoder => vae::LDM_PREFIX,
            ModuleKind::TextEncoder => clip::LDM_PREFIX,
            ModuleKind::Denoiser => unet::LDM_PREFIX,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Autoencoder => write!(f, "autoencoder"),
            ModuleKind::TextEncoder => write!(f, "text encoder"),
            ModuleKind::Denoiser => write!(f, "denoiser"),
        }
    }
}

/// Translates LDM checkpoint keys into the diffusers key space
#[derive(Debug, Clone)]
pub struct KeyTranslator {
    layers_per_block: usize,
}

impl Default for KeyTranslator {
    fn default() -> Self {
        Self::new(2)
    }
}

impl KeyTranslator {
    /// `layers_per_block` is the number of resnets per denoiser down block
    pub fn new(layers_per_block: usize) -> Self {
        Self { layers_per_block }
    }

    pub fn layers_per_block(&self) -> usize {
        self.layers_per_block
    }

    /// Extract and rename the tensors of `kind` from a raw checkpoint
    pub fn translate(&self, raw: &StateDict, kind: ModuleKind) -> Result<StateDict> {
        match kind {
            ModuleKind::Autoencoder => vae::convert(raw),
            ModuleKind::TextEncoder => Ok(clip::convert(raw)),
            ModuleKind::Denoiser => Ok(unet::convert(raw, self.layers_per_block)),
        }
    }
}

// =============================================================================
// Shared key helpers
// =============================================================================

/// Rewrite the first matching prefix
fn rename_prefix(rules: &[(&str, &str)], key: &str) -> Option<String> {
    rules.iter().find_map(|(from, to)| {
        key.strip_prefix(from)
            .map(|rest| format!("{to}{rest}"))
    })
}

/// Apply every substring replacement in order
fn replace_all(rules: &[(&str, &str)], key: &str) -> String {
    rules
        .iter()
        .fold(key.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// Strip `head.` and parse `n` numeric segments that follow it
///
/// `split_indexed("input_blocks.4.1.norm.weight", "input_blocks", 2)`
/// returns `([4, 1], "norm.weight")`.
fn split_indexed<'a>(key: &'a str, head: &str, n: usize) -> Option<(Vec<usize>, &'a str)> {
    let mut rest = key.strip_prefix(head)?.strip_prefix('.')?;
    let mut indices = Vec::with_capacity(n);
    for _ in 0..n {
        let (index, tail) = rest.split_once('.')?;
        indices.push(index.parse().ok()?);
        rest = tail;
    }
    Some((indices, rest))
}
