/// Weight loading from checkpoint files
use std::path::Path;

use crate::device::parallel::{from_parallel, unwrap_parallel};
use crate::training::checkpoint::Checkpoint;
use crate::{Result, XtError};

use super::StateDict;

/// Load only the model weights from a checkpoint
///
/// Reads the `state_dict` field (falling back to `model`) and strips the
/// data-parallel prefix when present. Tensors are returned on CPU.
///
/// # Arguments
/// * `path` - Checkpoint file written by `save_checkpoint`, or any
///   safetensors file using the same field prefixes
///
/// # Returns
/// Parameter name to tensor
pub fn load_weights<P: AsRef<Path>>(path: P) -> Result<StateDict> {
    let path = path.as_ref();
    let mut checkpoint = Checkpoint::load(path)?;

    let state_dict = checkpoint.take_weights().ok_or_else(|| XtError::InvalidFormat {
        path: path.to_path_buf(),
        reason: "no model weights found in checkpoint".to_string(),
    })?;

    if from_parallel(&state_dict) {
        Ok(unwrap_parallel(state_dict))
    } else {
        Ok(state_dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DataParallel;
    use crate::models::{Model, StateDictModule};
    use crate::training::save_checkpoint;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    #[test]
    fn test_load_weights_from_parallel_checkpoint() -> crate::Result<()> {
        let model = Model::new(Device::Cpu);
        model
            .var_builder(DType::F32)
            .get_with_hints((2, 3), "head.weight", Init::Const(0.25))?;
        let dp = DataParallel::with_devices(model, vec![Device::Cpu, Device::Cpu])?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dp.safetensors");
        save_checkpoint(&path, &dp, None, None, Some(3), false)?;

        let weights = load_weights(&path)?;
        assert_eq!(weights.len(), 1);
        let weight = weights["head.weight"].flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(weight, vec![0.25; 6]);
        assert!(weights["head.weight"].device().is_cpu());
        Ok(())
    }

    #[test]
    fn test_load_weights_missing_file() {
        let result = load_weights("does/not/exist.safetensors");
        assert!(matches!(result, Err(XtError::NotFound(_))));
    }

    #[test]
    fn test_load_weights_keeps_plain_names() -> crate::Result<()> {
        let model = Model::new(Device::Cpu);
        model
            .var_builder(DType::F32)
            .get_with_hints(4, "norm.scale", Init::Const(1.0))?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("plain.safetensors");
        save_checkpoint(&path, &model, None, None, None, false)?;

        let weights = load_weights(&path)?;
        assert_eq!(
            weights.keys().collect::<Vec<_>>(),
            model.state_dict()?.keys().collect::<Vec<_>>()
        );
        Ok(())
    }
}
