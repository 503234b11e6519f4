/// Training checkpoints in a single safetensors file
///
/// A checkpoint stores model weights plus, optionally, optimizer state, the
/// learning rate and the iteration counter. Tensors are namespaced by field
/// (`state_dict.fc.weight`, `optimizer.state.0.exp_avg`, ...) and scalar fields
/// travel in the safetensors header metadata.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use safetensors::tensor::SafeTensors;

use crate::device::parallel::{from_parallel, unwrap_parallel};
use crate::models::{StateDict, StateDictModule};
use crate::training::optimizer::AdamW;
use crate::{Result, XtError};

/// Value of the `format` metadata entry
pub const CHECKPOINT_FORMAT: &str = "train-xt/checkpoint";

const FIELD_STATE_DICT: &str = "state_dict";
const FIELD_MODEL: &str = "model";
const FIELD_OPTIMIZER: &str = "optimizer";
const FIELD_LEARNING_RATE: &str = "learning_rate";
const FIELD_ITERATION: &str = "iteration";

/// Model checkpoint
///
/// Every field is optional on read. `save_checkpoint` always writes
/// `state_dict`; `model` is only read, for checkpoints that stored the whole
/// model under that name.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    /// Model parameters
    pub state_dict: Option<StateDict>,
    /// Model parameters stored under the `model` field
    pub model: Option<StateDict>,
    /// Optimizer state (see `AdamW::state_dict`)
    pub optimizer: Option<StateDict>,
    /// Learning rate at checkpoint
    pub learning_rate: Option<f64>,
    /// Training iteration at checkpoint
    pub iteration: Option<usize>,
}

/// One entry of what `load_checkpoint` restored, in restore order
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedObject {
    Model,
    Optimizer,
    LearningRate(f64),
    Iteration(usize),
}

/// Outcome of `load_checkpoint`
///
/// The model (and optimizer, if restored) are updated in place; this records
/// which fields were applied and carries the scalar values.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub optimizer_restored: bool,
    pub learning_rate: Option<f64>,
    pub iteration: Option<usize>,
}

impl Loaded {
    /// Restored objects in order: model, optimizer, learning rate, iteration
    pub fn objects(&self) -> Vec<LoadedObject> {
        let mut objects = vec![LoadedObject::Model];
        if self.optimizer_restored {
            objects.push(LoadedObject::Optimizer);
        }
        if let Some(lr) = self.learning_rate {
            objects.push(LoadedObject::LearningRate(lr));
        }
        if let Some(iteration) = self.iteration {
            objects.push(LoadedObject::Iteration(iteration));
        }
        objects
    }

    /// True when only the model weights were restored
    pub fn is_model_only(&self) -> bool {
        !self.optimizer_restored && self.learning_rate.is_none() && self.iteration.is_none()
    }
}

impl Checkpoint {
    /// Create new checkpoint from model weights
    pub fn new(state_dict: StateDict) -> Self {
        Self {
            state_dict: Some(state_dict),
            ..Default::default()
        }
    }

    pub fn with_optimizer(mut self, optimizer: StateDict) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = Some(learning_rate);
        self
    }

    pub fn with_iteration(mut self, iteration: usize) -> Self {
        self.iteration = Some(iteration);
        self
    }

    /// Names of the present fields, in schema order
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.state_dict.is_some() {
            fields.push(FIELD_STATE_DICT);
        }
        if self.model.is_some() {
            fields.push(FIELD_MODEL);
        }
        if self.optimizer.is_some() {
            fields.push(FIELD_OPTIMIZER);
        }
        if self.learning_rate.is_some() {
            fields.push(FIELD_LEARNING_RATE);
        }
        if self.iteration.is_some() {
            fields.push(FIELD_ITERATION);
        }
        fields
    }

    /// Model weights: `state_dict` if present, else `model`
    pub fn weights(&self) -> Option<&StateDict> {
        self.state_dict.as_ref().or(self.model.as_ref())
    }

    /// Take the model weights out of the checkpoint, same preference as `weights`
    pub fn take_weights(&mut self) -> Option<StateDict> {
        self.state_dict.take().or_else(|| self.model.take())
    }

    /// Save checkpoint to file
    ///
    /// # Arguments
    /// * `path` - Path to save checkpoint; an existing file is overwritten
    ///
    /// # Returns
    /// `XtError::Storage` if the file cannot be serialized or written
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let storage = |reason: String| XtError::Storage {
            path: path.to_path_buf(),
            reason,
        };

        let mut tensors: Vec<(String, Tensor)> = Vec::new();
        let sections = [
            (FIELD_STATE_DICT, &self.state_dict),
            (FIELD_MODEL, &self.model),
            (FIELD_OPTIMIZER, &self.optimizer),
        ];
        for (field, section) in sections {
            if let Some(section) = section {
                for (key, tensor) in section.iter() {
                    let tensor = tensor.to_device(&Device::Cpu).map_err(|e| storage(e.to_string()))?;
                    tensors.push((format!("{}.{}", field, key), tensor));
                }
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), CHECKPOINT_FORMAT.to_string());
        metadata.insert("fields".to_string(), self.fields().join(","));
        if let Some(lr) = self.learning_rate {
            metadata.insert(FIELD_LEARNING_RATE.to_string(), lr.to_string());
        }
        if let Some(iteration) = self.iteration {
            metadata.insert(FIELD_ITERATION.to_string(), iteration.to_string());
        }

        safetensors::serialize_to_file(tensors, &Some(metadata), path)
            .map_err(|e| storage(e.to_string()))?;

        log::debug!("Wrote checkpoint fields [{}] to {}", self.fields().join(", "), path.display());
        Ok(())
    }

    /// Load checkpoint from file
    ///
    /// Tensors are loaded on CPU. Files that lack the `fields` metadata entry
    /// (safetensors written by other tools) get their fields inferred from key
    /// prefixes.
    ///
    /// # Arguments
    /// * `path` - Path to checkpoint file
    ///
    /// # Returns
    /// `XtError::NotFound` if `path` is not a regular file,
    /// `XtError::InvalidFormat` if it is not a readable safetensors file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(XtError::NotFound(path.to_path_buf()));
        }

        let data = std::fs::read(path)?;
        let invalid = |reason: String| XtError::InvalidFormat {
            path: path.to_path_buf(),
            reason,
        };

        let (_, header) = SafeTensors::read_metadata(&data).map_err(|e| invalid(e.to_string()))?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = candle_core::safetensors::load_buffer(&data, &Device::Cpu)
            .map_err(|e| invalid(e.to_string()))?;

        let mut sections: HashMap<&'static str, StateDict> = HashMap::new();
        for (key, tensor) in tensors {
            let field = [FIELD_STATE_DICT, FIELD_MODEL, FIELD_OPTIMIZER]
                .into_iter()
                .find(|field| key.starts_with(&format!("{}.", field)));
            match field {
                Some(field) => {
                    let name = key[field.len() + 1..].to_string();
                    sections.entry(field).or_default().insert(name, tensor);
                }
                None => log::debug!("Ignoring tensor '{}' outside checkpoint fields", key),
            }
        }

        // Declared fields win; otherwise a field exists if any tensor uses its prefix
        let declared: Option<Vec<&str>> = metadata
            .get("fields")
            .map(|fields| fields.split(',').filter(|f| !f.is_empty()).collect());
        let mut section = |field: &'static str| -> Option<StateDict> {
            let found = sections.remove(field);
            match &declared {
                Some(declared) if declared.contains(&field) => Some(found.unwrap_or_default()),
                Some(_) => None,
                None => found,
            }
        };
        let state_dict = section(FIELD_STATE_DICT);
        let model = section(FIELD_MODEL);
        let optimizer = section(FIELD_OPTIMIZER);

        let learning_rate = metadata
            .get(FIELD_LEARNING_RATE)
            .map(|v| v.parse::<f64>())
            .transpose()
            .map_err(|e| invalid(format!("bad learning_rate: {}", e)))?;
        let iteration = metadata
            .get(FIELD_ITERATION)
            .map(|v| v.parse::<usize>())
            .transpose()
            .map_err(|e| invalid(format!("bad iteration: {}", e)))?;

        Ok(Self {
            state_dict,
            model,
            optimizer,
            learning_rate,
            iteration,
        })
    }
}

/// Save a training checkpoint
///
/// # Arguments
/// * `path` - Destination file, overwritten if it exists
/// * `model` - Model (or data-parallel wrapper) whose weights are saved
/// * `optimizer` - Optimizer whose state is saved alongside
/// * `learning_rate` - Current learning rate
/// * `iteration` - Current iteration
/// * `verbose` - Log the destination at info level
pub fn save_checkpoint<P, M>(
    path: P,
    model: &M,
    optimizer: Option<&AdamW>,
    learning_rate: Option<f64>,
    iteration: Option<usize>,
    verbose: bool,
) -> Result<()>
where
    P: AsRef<Path>,
    M: StateDictModule + ?Sized,
{
    let path = path.as_ref();

    let mut checkpoint = Checkpoint::new(model.state_dict()?);
    if let Some(optimizer) = optimizer {
        checkpoint = checkpoint.with_optimizer(optimizer.state_dict()?);
    }
    checkpoint.learning_rate = learning_rate;
    checkpoint.iteration = iteration;

    checkpoint.save(path)?;

    if verbose {
        log::info!("Saving checkpoint to {}", path.display());
    }
    Ok(())
}

/// Load a training checkpoint into `model` and, if given, `optimizer`
///
/// Weights written from a data-parallel model have their `module.` prefix
/// stripped before loading.
///
/// # Arguments
/// * `path` - Checkpoint file
/// * `model` - Model receiving the weights
/// * `optimizer` - Optimizer receiving the saved state, if the file has one
/// * `verbose` - Log the source at info level
///
/// # Returns
/// Which fields were restored, with the learning rate and iteration values
pub fn load_checkpoint<P, M>(
    path: P,
    model: &mut M,
    optimizer: Option<&mut AdamW>,
    verbose: bool,
) -> Result<Loaded>
where
    P: AsRef<Path>,
    M: StateDictModule + ?Sized,
{
    let path = path.as_ref();
    let mut checkpoint = Checkpoint::load(path)?;

    let mut state_dict = checkpoint.take_weights().ok_or_else(|| XtError::InvalidFormat {
        path: path.to_path_buf(),
        reason: "no model weights found in checkpoint".to_string(),
    })?;

    if from_parallel(&state_dict) {
        log::debug!("Stripping data-parallel prefix from checkpoint weights");
        state_dict = unwrap_parallel(state_dict);
    }

    // Nothing is written until both the weights and the optimizer state check out
    let prepared = match (checkpoint.optimizer.as_ref(), optimizer) {
        (Some(saved), Some(optimizer)) => Some((optimizer.prepare_state(saved)?, optimizer)),
        _ => None,
    };

    model.load_state_dict(&state_dict)?;

    let optimizer_restored = prepared.is_some();
    if let Some((state, optimizer)) = prepared {
        optimizer.commit_state(state);
    }

    if verbose {
        log::info!("Loaded checkpoint from {}", path.display());
    }

    Ok(Loaded {
        optimizer_restored,
        learning_rate: checkpoint.learning_rate,
        iteration: checkpoint.iteration,
    })
}

/// Default file name for a checkpoint taken at `step` inside `dir`
pub fn checkpoint_file(dir: &Path, step: usize) -> PathBuf {
    dir.join(format!("checkpoint_step_{}.safetensors", step))
}
