//! Base model and motion module swapping
//!
//! Both transitions short-circuit when the requested checkpoint is already
//! merged, so repeated selections cost no I/O. The selection is cleared
//! before the first weight is written and only committed after the last, so a
//! swap that fails halfway is retried in full.
//!
//! Base models are merged leniently: the LDM → diffusers conversion is lossy,
//! so keys the modules do not know are reported and skipped. Motion modules
//! are merged strictly on the unexpected side: a single key outside the
//! denoiser's key space aborts the swap before any weight is touched.

use crate::convert::{KeyTranslator, ModuleKind};
use crate::loader::{read_checkpoint, LoaderError, StateDict};
use crate::state::ModelState;
use crate::store::{BaseModelRecord, CheckpointKind, CheckpointRecord, MotionModuleRecord};
use crate::weights::{LoadPlan, LoadReport, WeightsError};
use candle_core::Device;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("{name} is a {actual}, expected a {expected}")]
    WrongKind {
        name: String,
        expected: CheckpointKind,
        actual: CheckpointKind,
    },

    #[error("Motion module {name} has {} keys outside the denoiser (first: {:?})", .unexpected.len(), .unexpected.first())]
    UnexpectedMotionKeys {
        name: String,
        unexpected: Vec<String>,
    },

    #[error("Failed to read checkpoint")]
    Loader(#[from] LoaderError),

    #[error("Failed to translate checkpoint: {0}")]
    Translate(#[source] candle_core::Error),

    #[error(transparent)]
    Weights(#[from] WeightsError),
}

pub type Result<T> = std::result::Result<T, SwapError>;

/// What a swap did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The record was already merged; nothing was read or written
    Unchanged,
    /// Weights were replaced; one report per touched module
    Swapped(Vec<(ModuleKind, LoadReport)>),
}

impl SwapOutcome {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, SwapOutcome::Unchanged)
    }
}

/// Applies checkpoints to a [`ModelState`]
#[derive(Debug, Clone, Default)]
pub struct SwapController {
    translator: KeyTranslator,
}

impl SwapController {
    pub fn new(translator: KeyTranslator) -> Self {
        Self { translator }
    }

    /// Merge a personalized base model into all three modules
    pub fn swap_base_model(&self, state: &mut ModelState, record: &BaseModelRecord) -> Result<SwapOutcome> {
        expect_kind(record, CheckpointKind::BaseModel)?;
        if state.base_model.as_ref() == Some(record) {
            debug!(name = %record.name, "Base model already selected");
            return Ok(SwapOutcome::Unchanged);
        }

        info!(name = %record.name, "Swapping base model");
        let raw = read_checkpoint(&record.path, &Device::Cpu)?;
        self.merge_base_model(state, record, raw)
    }

    fn merge_base_model(&self, state: &mut ModelState, record: &BaseModelRecord, raw: StateDict) -> Result<SwapOutcome> {
        // Translate and plan every module before writing any of them
        let mut staged: Vec<(ModuleKind, StateDict, LoadPlan)> = Vec::with_capacity(3);
        for kind in ModuleKind::ALL {
            let translated = self
                .translator
                .translate(&raw, kind)
                .map_err(SwapError::Translate)?;
            if translated.is_empty() {
                warn!(
                    name = %record.name,
                    %kind,
                    prefix = kind.ldm_prefix(),
                    "Checkpoint has no weights for module"
                );
            }
            let plan = state.module(kind).plan(&translated)?;
            staged.push((kind, translated, plan));
        }
        drop(raw);

        state.base_model = None;
        let mut reports = Vec::with_capacity(staged.len());
        for (kind, translated, plan) in staged {
            let loaded = state.module_mut(kind).apply(&plan, &translated)?;
            if !plan.unexpected.is_empty() {
                debug!(%kind, unexpected = ?plan.unexpected, "Skipped keys unknown to module");
            }
            info!(
                %kind,
                loaded,
                missing = plan.missing.len(),
                unexpected = plan.unexpected.len(),
                "Merged base model weights"
            );
            reports.push((
                kind,
                LoadReport {
                    loaded,
                    missing: plan.missing,
                    unexpected: plan.unexpected,
                },
            ));
        }

        state.base_model = Some(record.clone());
        Ok(SwapOutcome::Swapped(reports))
    }

    /// Graft a motion module onto the denoiser
    pub fn swap_motion_module(&self, state: &mut ModelState, record: &MotionModuleRecord) -> Result<SwapOutcome> {
        expect_kind(record, CheckpointKind::MotionModule)?;
        if state.motion_module.as_ref() == Some(record) {
            debug!(name = %record.name, "Motion module already selected");
            return Ok(SwapOutcome::Unchanged);
        }

        info!(name = %record.name, "Swapping motion module");
        let raw = read_checkpoint(&record.path, &Device::Cpu)?;
        self.merge_motion_module(state, record, raw)
    }

    fn merge_motion_module(&self, state: &mut ModelState, record: &MotionModuleRecord, raw: StateDict) -> Result<SwapOutcome> {
        let plan = state.denoiser.plan(&raw)?;
        if !plan.unexpected.is_empty() {
            return Err(SwapError::UnexpectedMotionKeys {
                name: record.name.clone(),
                unexpected: plan.unexpected,
            });
        }

        let spatial = plan
            .overwrite
            .iter()
            .filter(|name| !name.contains(".motion_modules."))
            .count();
        if spatial > 0 {
            warn!(name = %record.name, spatial, "Motion module overwrites spatial weights");
        }

        state.motion_module = None;
        let loaded = state.denoiser.apply(&plan, &raw)?;
        info!(name = %record.name, loaded, "Merged motion module");

        state.motion_module = Some(record.clone());
        Ok(SwapOutcome::Swapped(vec![(
            ModuleKind::Denoiser,
            LoadReport {
                loaded,
                missing: plan.missing,
                unexpected: Vec::new(),
            },
        )]))
    }
}

fn expect_kind(record: &CheckpointRecord, expected: CheckpointKind) -> Result<()> {
    if record.kind != expected {
        return Err(SwapError::WrongKind {
            name: record.name.clone(),
            expected,
            actual: record.kind,
        });
    }
    Ok(())
}
