//! Checkpoint discovery
//!
//! Lists the base model and motion module files available on disk. Every call
//! rescans its directory, so newly dropped files show up without a restart.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which directory a checkpoint was discovered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointKind {
    BaseModel,
    MotionModule,
}

impl CheckpointKind {
    /// File extensions (lowercase, without dot) recognized for this kind
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            CheckpointKind::BaseModel => &["safetensors", "ckpt"],
            CheckpointKind::MotionModule => &["ckpt", "safetensors"],
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointKind::BaseModel => write!(f, "base model"),
            CheckpointKind::MotionModule => write!(f, "motion module"),
        }
    }
}

/// A checkpoint file found by a directory scan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointRecord {
    pub kind: CheckpointKind,
    /// File name, e.g. `toonyou_beta3.safetensors`
    pub name: String,
    pub path: PathBuf,
}

pub type BaseModelRecord = CheckpointRecord;
pub type MotionModuleRecord = CheckpointRecord;

impl CheckpointRecord {
    /// Build a record for an explicit file
    pub fn from_path(kind: CheckpointKind, path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_str()?.to_string();
        Some(Self { kind, name, path })
    }

    /// File name without extension, e.g. `toonyou_beta3`
    pub fn stem(&self) -> &str {
        self.name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Unknown {kind} {name:?} (available: {available:?})")]
    NotFound {
        kind: CheckpointKind,
        name: String,
        available: Vec<String>,
    },
}

/// Directory-backed listing of base models and motion modules
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    base_model_dir: PathBuf,
    motion_module_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(base_model_dir: impl Into<PathBuf>, motion_module_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_model_dir: base_model_dir.into(),
            motion_module_dir: motion_module_dir.into(),
        }
    }

    pub fn base_model_dir(&self) -> &Path {
        &self.base_model_dir
    }

    pub fn motion_module_dir(&self) -> &Path {
        &self.motion_module_dir
    }

    /// Base model checkpoints currently on disk
    pub fn list_base_models(&self) -> Vec<BaseModelRecord> {
        scan(&self.base_model_dir, CheckpointKind::BaseModel)
    }

    /// Motion module checkpoints currently on disk
    pub fn list_motion_modules(&self) -> Vec<MotionModuleRecord> {
        scan(&self.motion_module_dir, CheckpointKind::MotionModule)
    }

    /// Resolve a base model by file name
    pub fn find_base_model(&self, name: &str) -> Result<BaseModelRecord, StoreError> {
        find(self.list_base_models(), CheckpointKind::BaseModel, name)
    }

    /// Resolve a motion module by file name
    pub fn find_motion_module(&self, name: &str) -> Result<MotionModuleRecord, StoreError> {
        find(self.list_motion_modules(), CheckpointKind::MotionModule, name)
    }
}

fn find(
    mut records: Vec<CheckpointRecord>,
    kind: CheckpointKind,
    name: &str,
) -> Result<CheckpointRecord, StoreError> {
    match records.iter().position(|r| r.name == name) {
        Some(i) => Ok(records.swap_remove(i)),
        None => Err(StoreError::NotFound {
            kind,
            name: name.to_string(),
            available: records.into_iter().map(|r| r.name).collect(),
        }),
    }
}

/// Scan `dir` for files of `kind`, sorted by file name
///
/// A missing or unreadable directory yields an empty list.
fn scan(dir: &Path, kind: CheckpointKind) -> Vec<CheckpointRecord> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Checkpoint directory unavailable");
            return Vec::new();
        }
    };

    let mut records: Vec<CheckpointRecord> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_extension(path, kind.extensions()))
        .filter_map(|path| CheckpointRecord::from_path(kind, path))
        .collect();

    records.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(dir = %dir.display(), %kind, count = records.len(), "Scanned checkpoints");
    records
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}
