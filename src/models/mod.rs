//! Parameter-holding model handle
//!
//! candle keeps trainable parameters in a `VarMap`; layers are built from a
//! `VarBuilder` over that map. `Model` pairs the map with the device its
//! variables live on so it can be moved, checkpointed and restored as a unit.
use std::collections::HashMap;
use std::fmt;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::{Result, XtError};

pub mod loader;

/// Parameter path (`encoder.layer0.weight`) to tensor
pub type StateDict = HashMap<String, Tensor>;

/// Anything whose parameters can be exported to and restored from a `StateDict`
pub trait StateDictModule {
    /// Snapshot of the current parameter values
    fn state_dict(&self) -> Result<StateDict>;

    /// Overwrite the live parameters with `state_dict`
    ///
    /// Fails with `XtError::ShapeMismatch` when names or shapes disagree.
    fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()>;
}

/// VarMap-backed model
///
/// Layers constructed before `to_device` keep tensors on the old device;
/// build them again from `var_builder` after moving.
#[derive(Clone)]
pub struct Model {
    varmap: VarMap,
    device: Device,
}

impl Model {
    /// Create an empty model whose parameters will live on `device`
    pub fn new(device: Device) -> Self {
        Self {
            varmap: VarMap::new(),
            device,
        }
    }

    /// Wrap an existing VarMap whose variables are on `device`
    pub fn from_varmap(varmap: VarMap, device: Device) -> Self {
        Self { varmap, device }
    }

    /// VarBuilder that registers new parameters in this model
    pub fn var_builder(&self, dtype: DType) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, dtype, &self.device)
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameters sorted by name
    ///
    /// The order is stable across models with the same layout, which is what
    /// lets optimizer state saved from one model be restored into another.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let vars = self.lock()?;
        let mut named: Vec<(String, Var)> = vars
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    /// Parameters in `named_vars` order, ready for an optimizer
    pub fn vars(&self) -> Result<Vec<Var>> {
        Ok(self.named_vars()?.into_iter().map(|(_, var)| var).collect())
    }

    /// Total number of scalar parameters
    pub fn num_parameters(&self) -> Result<usize> {
        let vars = self.lock()?;
        Ok(vars
            .values()
            .map(|var| crate::utils::count_parameters(var.as_tensor()))
            .sum())
    }

    /// Move every parameter to `device`
    ///
    /// The moved model gets its own `VarMap`. Clones taken before the move
    /// keep sharing the old map and stay on the old device.
    pub fn to_device(self, device: &Device) -> Result<Self> {
        if self.device.same_device(device) {
            return Ok(self);
        }

        let varmap = VarMap::new();
        {
            let vars = self.lock()?;
            let mut moved = varmap
                .data()
                .lock()
                .map_err(|e| XtError::Model(format!("parameter map lock poisoned: {}", e)))?;
            for (name, var) in vars.iter() {
                let tensor = var.as_tensor().to_device(device)?;
                moved.insert(name.clone(), Var::from_tensor(&tensor)?);
            }
        }

        log::debug!("Moved model from {:?} to {:?}", self.device, device);
        Ok(Self {
            varmap,
            device: device.clone(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
        self.varmap
            .data()
            .lock()
            .map_err(|e| XtError::Model(format!("parameter map lock poisoned: {}", e)))
    }
}

impl StateDictModule for Model {
    fn state_dict(&self) -> Result<StateDict> {
        let vars = self.lock()?;
        let mut state_dict = StateDict::with_capacity(vars.len());
        for (name, var) in vars.iter() {
            // Copy so later optimizer steps don't alias the snapshot
            state_dict.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(state_dict)
    }

    fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        let vars = self.lock()?;

        let mut missing: Vec<&str> = vars
            .keys()
            .filter(|name| !state_dict.contains_key(*name))
            .map(String::as_str)
            .collect();
        let mut unexpected: Vec<&str> = state_dict
            .keys()
            .filter(|name| !vars.contains_key(*name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            missing.sort_unstable();
            unexpected.sort_unstable();
            return Err(XtError::ShapeMismatch(format!(
                "missing keys {:?}, unexpected keys {:?}",
                missing, unexpected
            )));
        }

        // Check every shape before touching any parameter
        for (name, var) in vars.iter() {
            let src = &state_dict[name];
            if src.dims() != var.dims() {
                return Err(XtError::ShapeMismatch(format!(
                    "parameter '{}' expects {:?}, checkpoint has {:?}",
                    name,
                    var.dims(),
                    src.dims()
                )));
            }
        }

        for (name, var) in vars.iter() {
            let src = state_dict[name]
                .to_device(var.device())?
                .to_dtype(var.dtype())?;
            var.set(&src)?;
        }

        log::debug!("Loaded {} parameters into model", vars.len());
        Ok(())
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parameters = self.varmap.data().lock().map(|v| v.len()).unwrap_or(0);
        f.debug_struct("Model")
            .field("device", &self.device)
            .field("parameters", &parameters)
            .finish()
    }
}
