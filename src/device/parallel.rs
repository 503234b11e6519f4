//! Data-parallel wrapping
//!
//! A data-parallel model keeps one master copy of its parameters on the
//! primary device, replicates them onto every device for a step and splits
//! each batch between the replicas. Parameter names exported from the wrapper
//! carry the `module.` prefix, so checkpoints written from a wrapped model
//! need `unwrap_parallel` before they fit an unwrapped one.
use std::collections::HashMap;

use candle_core::{Device, DeviceLocation, Tensor};

use crate::models::{Model, StateDict, StateDictModule};
use crate::{Result, XtError};

/// Key prefix added to parameter names by data-parallel wrapping
pub const PARALLEL_PREFIX: &str = "module.";

/// True if any key carries the data-parallel prefix
pub fn from_parallel<V>(state_dict: &HashMap<String, V>) -> bool {
    state_dict.keys().any(|key| key.contains(PARALLEL_PREFIX))
}

/// Strip the first `module.` occurrence from every key
///
/// Keys that collide after stripping are not detected; the last one wins.
pub fn unwrap_parallel<V>(state_dict: HashMap<String, V>) -> HashMap<String, V> {
    state_dict
        .into_iter()
        .map(|(key, value)| (key.replacen(PARALLEL_PREFIX, "", 1), value))
        .collect()
}

/// Prefix every key with `module.`
pub fn wrap_parallel<V>(state_dict: HashMap<String, V>) -> HashMap<String, V> {
    state_dict
        .into_iter()
        .map(|(key, value)| (format!("{}{}", PARALLEL_PREFIX, key), value))
        .collect()
}

/// Model replicated across several devices
#[derive(Debug, Clone)]
pub struct DataParallel {
    module: Model,
    devices: Vec<Device>,
}

impl DataParallel {
    /// Wrap `module` over the given zero-based CUDA ordinals
    ///
    /// The first ordinal becomes the primary device and the module is moved
    /// onto it.
    pub fn cuda(module: Model, ordinals: &[usize]) -> Result<Self> {
        let devices = ordinals
            .iter()
            .map(|&ordinal| Ok(Device::new_cuda(ordinal)?))
            .collect::<Result<Vec<_>>>()?;
        Self::with_devices(module, devices)
    }

    /// Wrap `module` over an explicit device list
    pub fn with_devices(module: Model, devices: Vec<Device>) -> Result<Self> {
        let primary = devices
            .first()
            .cloned()
            .ok_or_else(|| XtError::Config("data-parallel needs at least one device".to_string()))?;

        let module = module.to_device(&primary)?;
        log::debug!("Wrapped model for data-parallel over {} devices", devices.len());

        Ok(Self { module, devices })
    }

    pub fn module(&self) -> &Model {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Model {
        &mut self.module
    }

    /// Drop the wrapper, keeping the model on the primary device
    pub fn into_inner(self) -> Model {
        self.module
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn primary_device(&self) -> &Device {
        self.module.device()
    }

    /// Zero-based CUDA ordinals of the replica devices (CPU replicas are skipped)
    pub fn device_ids(&self) -> Vec<usize> {
        self.devices
            .iter()
            .filter_map(|device| match device.location() {
                DeviceLocation::Cuda { gpu_id } => Some(gpu_id),
                _ => None,
            })
            .collect()
    }

    /// Copy the current parameters onto every replica device
    pub fn replicate(&self) -> Result<Vec<StateDict>> {
        let master = self.module.state_dict()?;
        self.devices
            .iter()
            .map(|device| {
                master
                    .iter()
                    .map(|(name, tensor)| Ok((name.clone(), tensor.to_device(device)?)))
                    .collect::<Result<StateDict>>()
            })
            .collect()
    }

    /// Split a batch along dim 0, one chunk per device
    ///
    /// Batches smaller than the device count yield fewer chunks.
    pub fn scatter(&self, batch: &Tensor) -> Result<Vec<Tensor>> {
        let chunks = batch.chunk(self.devices.len(), 0)?;
        chunks
            .iter()
            .zip(self.devices.iter())
            .map(|(chunk, device)| Ok(chunk.to_device(device)?))
            .collect()
    }

    /// Concatenate per-replica outputs along dim 0 on the primary device
    pub fn gather(&self, outputs: &[Tensor]) -> Result<Tensor> {
        let primary = self.primary_device();
        let outputs = outputs
            .iter()
            .map(|output| Ok(output.to_device(primary)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&outputs, 0)?)
    }
}

impl StateDictModule for DataParallel {
    fn state_dict(&self) -> Result<StateDict> {
        Ok(wrap_parallel(self.module.state_dict()?))
    }

    /// Accepts names with or without the `module.` prefix
    fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        if from_parallel(state_dict) {
            let plain = unwrap_parallel(state_dict.clone());
            self.module.load_state_dict(&plain)
        } else {
            self.module.load_state_dict(state_dict)
        }
    }
}
