//! train-xt - training helpers for candle
//!
//! Small, independent utilities that sit around a candle training loop:
//!
//! - **Device placement**: move tensors and models to CPU, a single GPU, or
//!   wrap them for data-parallel execution across several GPUs
//! - **Checkpoints**: save and restore model weights, optimizer state,
//!   learning rate and iteration in one safetensors file
//! - **Parallel unwrapping**: strip the `module.` prefix that data-parallel
//!   wrapping adds to parameter names
//! - **Loss tracking**: weighted running average of a scalar loss
//!
//! # Example
//!
//! ```ignore
//! use train_xt::{DeviceSpec, Model, training::{AdamW, save_checkpoint, load_checkpoint}};
//!
//! let model = Model::new(candle_core::Device::Cpu);
//! let model = train_xt::device::place_model(model, &"1".parse::<DeviceSpec>()?)?;
//! save_checkpoint("ckpt.safetensors", &model, Some(&optimizer), Some(3e-4), Some(1000), true)?;
//! ```

pub mod config;
pub mod device;
pub mod models;
pub mod training;
pub mod utils;

use std::path::PathBuf;

// Re-export commonly used items
pub use config::RunConfig;
pub use device::{DataParallel, DeviceSpec, Placeable, Placement};
pub use models::{Model, StateDict, StateDictModule};
pub use training::{AdamW, Checkpoint, Loaded, LossMeter};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum XtError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Checkpoint not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid checkpoint {}: {reason}", path.display())]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Storage error at {}: {reason}", path.display())]
    Storage { path: PathBuf, reason: String },

    #[error("Division by zero: loss meter has no accumulated weight")]
    DivisionByZero,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, XtError>;
