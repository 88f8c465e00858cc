//! Raw checkpoint reading
//!
//! Reads every tensor of a checkpoint file into a [`StateDict`] without any
//! renaming. Two on-disk formats are recognized:
//!
//! - `.safetensors` files
//! - PyTorch pickles (`.ckpt`, `.pt`, `.pth`, `.bin`), either a flat state dict
//!   or one nested under a `state_dict` entry
//!
//! Also hosts the JSON config loader and a few inspection helpers.

use candle_core::{Device, Tensor};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Tensor name → tensor, as stored in (or converted from) a checkpoint
pub type StateDict = HashMap<String, Tensor>;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while reading checkpoints
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Checkpoint not found: {path}")]
    NotFound { path: String },

    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported checkpoint extension: {path}")]
    UnsupportedFormat { path: String },

    #[error("Invalid safetensors file: {path}")]
    InvalidSafetensors {
        path: String,
        #[source]
        source: safetensors::SafeTensorError,
    },

    #[error("Failed to decode checkpoint {path}")]
    Decode {
        path: String,
        #[source]
        source: candle_core::Error,
    },
}

// =============================================================================
// Checkpoint formats
// =============================================================================

/// On-disk checkpoint encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    SafeTensors,
    Pickle,
}

impl CheckpointFormat {
    /// Detect the format from the file extension
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "safetensors" => Some(Self::SafeTensors),
            "ckpt" | "pt" | "pth" | "bin" => Some(Self::Pickle),
            _ => None,
        }
    }
}

/// Read every tensor of a checkpoint onto `device`
///
/// Tensors keep the dtype they were stored with; the partial load converts
/// them to the target module's dtype.
pub fn read_checkpoint(path: impl AsRef<Path>, device: &Device) -> Result<StateDict, LoaderError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(LoaderError::NotFound {
            path: path.display().to_string(),
        });
    }

    let format = CheckpointFormat::detect(path).ok_or_else(|| LoaderError::UnsupportedFormat {
        path: path.display().to_string(),
    })?;

    let decode = |source| LoaderError::Decode {
        path: path.display().to_string(),
        source,
    };

    let state: StateDict = match format {
        CheckpointFormat::SafeTensors => {
            candle_core::safetensors::load(path, device).map_err(decode)?
        }
        CheckpointFormat::Pickle => {
            let mut tensors = candle_core::pickle::read_all(path).map_err(decode)?;
            if tensors.is_empty() {
                // Lightning-style checkpoints nest the weights
                tensors = candle_core::pickle::read_all_with_key(path, Some("state_dict"))
                    .map_err(decode)?;
            }
            tensors
                .into_iter()
                .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
                .collect::<candle_core::Result<_>>()
                .map_err(decode)?
        }
    };

    debug!(path = %path.display(), ?format, tensors = state.len(), "Read checkpoint");
    Ok(state)
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Pick the weight file of a diffusers component directory
///
/// `stem` is the file name without extension (`diffusion_pytorch_model`,
/// `model`). When `prefer_fp16` is set, `<stem>.fp16.safetensors` wins over
/// `<stem>.safetensors` if present.
pub fn find_weight_file(dir: impl AsRef<Path>, stem: &str, prefer_fp16: bool) -> Option<PathBuf> {
    let dir = dir.as_ref();
    let fp16 = dir.join(format!("{stem}.fp16.safetensors"));
    let full = dir.join(format!("{stem}.safetensors"));

    if prefer_fp16 && fp16.is_file() {
        Some(fp16)
    } else if full.is_file() {
        Some(full)
    } else if fp16.is_file() {
        Some(fp16)
    } else {
        None
    }
}

/// Load a JSON configuration file and deserialize it
///
/// # Example
/// ```no_run
/// use candle_animate::loader::load_model_config;
/// use candle_animate::config::InferenceConfig;
///
/// let config: InferenceConfig = load_model_config("configs/inference.json").unwrap();
/// ```
pub fn load_model_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, LoaderError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| LoaderError::JsonParse {
        path: path.display().to_string(),
        source: e,
    })
}

/// List all tensor names in a safetensors file, sorted
///
/// Only the header is interpreted; useful for inspecting an unknown checkpoint.
pub fn list_tensor_names(path: impl AsRef<Path>) -> Result<Vec<String>, LoaderError> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;

    let tensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
        LoaderError::InvalidSafetensors {
            path: path.display().to_string(),
            source: e,
        }
    })?;

    let mut names: Vec<String> = tensors.names().into_iter().map(|s| s.to_string()).collect();
    names.sort();
    Ok(names)
}

// =============================================================================
// Tests
// =============================================================================
