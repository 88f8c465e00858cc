//! Named module weights and partial state loading
//!
//! A [`ModuleWeights`] owns one [`Var`] per parameter of a network module.
//! Networks are built from [`ModuleWeights::var_builder`], which shares the
//! var storage, so overwriting a var in place is visible to every network
//! built from it.
//!
//! Loading a state dict is a two step mapping diff:
//!
//! 1. [`ModuleWeights::plan`] classifies every key: present on both sides is
//!    overwritten, present only in the module keeps its value (missing),
//!    present only in the incoming state is rejected (unexpected). Shape
//!    mismatches fail the plan.
//! 2. [`ModuleWeights::apply`] writes the overwrite set.
//!
//! Nothing is mutated until a plan has been accepted.

use crate::convert::ModuleKind;
use crate::loader::{read_checkpoint, StateDict};
use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::VarBuilder;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum WeightsError {
    #[error("{kind}: shape mismatch for {name}: module has {expected:?}, checkpoint has {actual:?}")]
    ShapeMismatch {
        kind: ModuleKind,
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{kind}: strict load refused ({} missing, {} unexpected)", .missing.len(), .unexpected.len())]
    Strict {
        kind: ModuleKind,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("{kind}: duplicate parameter {name}")]
    Duplicate { kind: ModuleKind, name: String },

    #[error("Failed to read weights")]
    Loader(#[from] crate::loader::LoaderError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, WeightsError>;

/// How keys outside the overwrite set are treated by [`ModuleWeights::load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Missing or unexpected keys refuse the load
    Strict,
    /// Missing keys keep their values, unexpected keys are reported and skipped
    NonStrict,
}

/// Classification of an incoming state dict against a module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadPlan {
    /// Keys known to the module and present in the state
    pub overwrite: Vec<String>,
    /// Module keys absent from the state; their values are kept
    pub missing: Vec<String>,
    /// State keys the module does not know; never applied
    pub unexpected: Vec<String>,
}

impl LoadPlan {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Outcome of an applied load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// Parameters of one network module, keyed by diffusers-style names
pub struct ModuleWeights {
    kind: ModuleKind,
    vars: BTreeMap<String, Var>,
    dtype: DType,
    device: Device,
}

impl std::fmt::Debug for ModuleWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleWeights")
            .field("kind", &self.kind)
            .field("params", &self.vars.len())
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish()
    }
}

impl ModuleWeights {
    /// An empty module; parameters are added with [`declare`](Self::declare)
    /// or [`insert`](Self::insert)
    pub fn new(kind: ModuleKind, dtype: DType, device: &Device) -> Self {
        Self {
            kind,
            vars: BTreeMap::new(),
            dtype,
            device: device.clone(),
        }
    }

    /// A module holding every tensor of `state`
    ///
    /// Float tensors are converted to `dtype`; integer buffers keep theirs.
    pub fn from_state(kind: ModuleKind, state: StateDict, dtype: DType, device: &Device) -> Result<Self> {
        let mut module = Self::new(kind, dtype, device);
        for (name, tensor) in state {
            module.insert(name, &tensor)?;
        }
        Ok(module)
    }

    /// A module initialized from a diffusers component file
    pub fn from_file(kind: ModuleKind, path: impl AsRef<Path>, dtype: DType, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let state = read_checkpoint(path, device)?;
        let module = Self::from_state(kind, state, dtype, device)?;
        debug!(%kind, path = %path.display(), params = module.len(), "Loaded module weights");
        Ok(module)
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Parameter names in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(|k| k.as_str())
    }

    /// Current value of a parameter
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.vars.get(name).map(|v| v.as_tensor())
    }

    pub fn shape(&self, name: &str) -> Option<&Shape> {
        self.vars.get(name).map(|v| v.shape())
    }

    /// Add a parameter holding a copy of `tensor`
    pub fn insert(&mut self, name: impl Into<String>, tensor: &Tensor) -> Result<()> {
        let name = name.into();
        if self.vars.contains_key(&name) {
            return Err(WeightsError::Duplicate {
                kind: self.kind,
                name,
            });
        }
        let tensor = self.cast(tensor)?;
        self.vars.insert(name, Var::from_tensor(&tensor)?);
        Ok(())
    }

    /// Declare a zero-initialized parameter unless it already exists
    ///
    /// Returns whether a new parameter was added.
    pub fn declare(&mut self, name: impl Into<String>, shape: impl Into<Shape>) -> Result<bool> {
        let name = name.into();
        if self.vars.contains_key(&name) {
            return Ok(false);
        }
        let var = Var::zeros(shape, self.dtype, &self.device)?;
        self.vars.insert(name, var);
        Ok(true)
    }

    /// Classify `state` against this module without mutating anything
    pub fn plan(&self, state: &StateDict) -> Result<LoadPlan> {
        let mut plan = LoadPlan::default();

        for (name, tensor) in state {
            match self.vars.get(name) {
                Some(var) if var.shape() != tensor.shape() => {
                    return Err(WeightsError::ShapeMismatch {
                        kind: self.kind,
                        name: name.clone(),
                        expected: var.dims().to_vec(),
                        actual: tensor.dims().to_vec(),
                    });
                }
                Some(_) => plan.overwrite.push(name.clone()),
                None => plan.unexpected.push(name.clone()),
            }
        }

        plan.missing = self
            .vars
            .keys()
            .filter(|name| !state.contains_key(name.as_str()))
            .cloned()
            .collect();

        plan.overwrite.sort();
        plan.unexpected.sort();
        Ok(plan)
    }

    /// Overwrite every parameter in `plan.overwrite` with its value in `state`
    pub fn apply(&mut self, plan: &LoadPlan, state: &StateDict) -> Result<usize> {
        let mut loaded = 0;
        for name in &plan.overwrite {
            let (Some(var), Some(tensor)) = (self.vars.get(name), state.get(name)) else {
                continue;
            };
            let tensor = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
            var.set(&tensor)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Plan and apply in one step
    pub fn load(&mut self, state: &StateDict, mode: LoadMode) -> Result<LoadReport> {
        let plan = self.plan(state)?;
        if mode == LoadMode::Strict && !plan.is_exact() {
            return Err(WeightsError::Strict {
                kind: self.kind,
                missing: plan.missing,
                unexpected: plan.unexpected,
            });
        }

        let loaded = self.apply(&plan, state)?;
        debug!(
            kind = %self.kind,
            loaded,
            missing = plan.missing.len(),
            unexpected = plan.unexpected.len(),
            ?mode,
            "Partial load"
        );
        Ok(LoadReport {
            loaded,
            missing: plan.missing,
            unexpected: plan.unexpected,
        })
    }

    /// A `VarBuilder` sharing this module's storage
    pub fn var_builder(&self) -> VarBuilder<'static> {
        let tensors: HashMap<String, Tensor> = self
            .vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        VarBuilder::from_tensors(tensors, self.dtype, &self.device)
    }

    fn cast(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        let tensor = tensor.to_device(&self.device)?;
        if tensor.dtype().is_float() {
            tensor.to_dtype(self.dtype)
        } else {
            Ok(tensor)
        }
    }
}
