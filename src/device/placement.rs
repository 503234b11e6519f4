/// Recursive device placement
///
/// `set_device` walks a `Placeable` value and relocates every tensor and model
/// leaf according to a `DeviceSpec`, keeping lists as lists and tuples as
/// tuples. Leaves it does not know about are handed back untouched.
use std::any::Any;
use std::fmt;

use candle_core::{Device, Tensor};

use super::parallel::DataParallel;
use super::spec::{DeviceSpec, Placement};
use crate::models::Model;
use crate::Result;

/// A value that `set_device` can walk
pub enum Placeable {
    Tensor(Tensor),
    Model(Model),
    Parallel(DataParallel),
    List(Vec<Placeable>),
    Tuple(Vec<Placeable>),
    /// Opaque leaf, returned unchanged
    Other(Box<dyn Any + Send>),
}

impl Placeable {
    pub fn into_tensor(self) -> Option<Tensor> {
        match self {
            Placeable::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn into_model(self) -> Option<Model> {
        match self {
            Placeable::Model(model) => Some(model),
            _ => None,
        }
    }

    pub fn into_parallel(self) -> Option<DataParallel> {
        match self {
            Placeable::Parallel(dp) => Some(dp),
            _ => None,
        }
    }

    /// Elements of a list or tuple
    pub fn into_items(self) -> Option<Vec<Placeable>> {
        match self {
            Placeable::List(items) | Placeable::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

impl From<Tensor> for Placeable {
    fn from(tensor: Tensor) -> Self {
        Placeable::Tensor(tensor)
    }
}

impl From<Model> for Placeable {
    fn from(model: Model) -> Self {
        Placeable::Model(model)
    }
}

impl From<DataParallel> for Placeable {
    fn from(dp: DataParallel) -> Self {
        Placeable::Parallel(dp)
    }
}

impl fmt::Debug for Placeable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placeable::Tensor(tensor) => f.debug_tuple("Tensor").field(&tensor.device()).finish(),
            Placeable::Model(model) => f.debug_tuple("Model").field(model).finish(),
            Placeable::Parallel(dp) => f.debug_tuple("Parallel").field(&dp.devices()).finish(),
            Placeable::List(items) => f.debug_tuple("List").field(items).finish(),
            Placeable::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Placeable::Other(_) => f.write_str("Other(..)"),
        }
    }
}

/// Relocate every leaf of `value` according to `spec`
///
/// # Arguments
/// * `value` - Tensor, model, wrapper, or nested list/tuple of them
/// * `spec` - Device specification
///
/// # Returns
/// A value with the same shape whose tensors and models live on the requested
/// devices. Models under a multi-device spec come back as `Placeable::Parallel`.
pub fn set_device(value: Placeable, spec: &DeviceSpec) -> Result<Placeable> {
    let placement = spec.placement();
    let device = placement.primary_device()?;
    place(value, &placement, &device)
}

fn place(value: Placeable, placement: &Placement, device: &Device) -> Result<Placeable> {
    match value {
        Placeable::Tensor(tensor) => Ok(Placeable::Tensor(tensor.to_device(device)?)),
        Placeable::Model(model) => place_model_on(model, placement, device),
        // Re-place the inner model so a new spec can add or drop the wrapper
        Placeable::Parallel(dp) => place_model_on(dp.into_inner(), placement, device),
        Placeable::List(items) => Ok(Placeable::List(place_items(items, placement, device)?)),
        Placeable::Tuple(items) => Ok(Placeable::Tuple(place_items(items, placement, device)?)),
        Placeable::Other(other) => Ok(Placeable::Other(other)),
    }
}

fn place_items(items: Vec<Placeable>, placement: &Placement, device: &Device) -> Result<Vec<Placeable>> {
    items
        .into_iter()
        .map(|item| place(item, placement, device))
        .collect()
}

fn place_model_on(model: Model, placement: &Placement, device: &Device) -> Result<Placeable> {
    match placement {
        Placement::DataParallel(ordinals) => {
            log::debug!("Wrapping model for data-parallel on GPUs {:?}", ordinals);
            let devices = ordinals
                .iter()
                .map(|&ordinal| Ok(Device::new_cuda(ordinal)?))
                .collect::<Result<Vec<_>>>()?;
            Ok(Placeable::Parallel(DataParallel::with_devices(model, devices)?))
        }
        Placement::Cuda(_) | Placement::Cpu => Ok(Placeable::Model(model.to_device(device)?)),
    }
}

/// Move a single tensor according to `spec`
pub fn place_tensor(tensor: &Tensor, spec: &DeviceSpec) -> Result<Tensor> {
    let device = spec.placement().primary_device()?;
    Ok(tensor.to_device(&device)?)
}

/// Move a model according to `spec`, wrapping it when several GPUs are given
pub fn place_model(model: Model, spec: &DeviceSpec) -> Result<Placeable> {
    set_device(Placeable::Model(model), spec)
}
