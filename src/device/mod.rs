//! Device placement for tensors and models
//!
//! - `spec`: the integer device list and the placement it resolves to
//! - `placement`: `set_device` over nested tensors / models / sequences
//! - `parallel`: data-parallel wrapping and the `module.` key prefix

pub mod parallel;
pub mod placement;
pub mod spec;

pub use parallel::{from_parallel, unwrap_parallel, wrap_parallel, DataParallel, PARALLEL_PREFIX};
pub use placement::{place_model, place_tensor, set_device, Placeable};
pub use spec::{DeviceSpec, Placement};
