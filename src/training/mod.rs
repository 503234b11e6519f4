//! Training infrastructure: checkpoints, optimizer state and loss tracking
pub mod checkpoint;
pub mod meter;
pub mod optimizer;

pub use checkpoint::{checkpoint_file, load_checkpoint, save_checkpoint, Checkpoint, Loaded, LoadedObject};
pub use meter::LossMeter;
pub use optimizer::{AdamW, AdamWConfig};
