/// Run configuration for device placement and checkpointing
///
/// Typically read from a JSON file next to the training script:
///
/// ```json
/// { "device": [1, 2], "checkpoint_dir": "runs/exp1", "save_every": 500, "verbose": true }
/// ```
use std::path::{Path, PathBuf};

use crate::device::DeviceSpec;
use crate::training::checkpoint::checkpoint_file;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Device list: `[0]` for CPU, `[i]` for GPU `i - 1`, several for data-parallel
    pub device: DeviceSpec,

    /// Directory receiving periodic checkpoints
    pub checkpoint_dir: PathBuf,

    /// Save a checkpoint every N iterations
    pub save_every: usize,

    /// Log every checkpoint save/load at info level
    pub verbose: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            device: DeviceSpec::cpu(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            save_every: 1000,
            verbose: false,
        }
    }
}

impl RunConfig {
    /// Read and validate a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.save_every == 0 {
            return Err(crate::XtError::Config(
                "save_every must be > 0".to_string(),
            ));
        }

        if self.checkpoint_dir.as_os_str().is_empty() {
            return Err(crate::XtError::Config(
                "checkpoint_dir must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether iteration `step` is a checkpoint step
    pub fn should_save(&self, step: usize) -> bool {
        step > 0 && step % self.save_every == 0
    }

    /// Checkpoint path for iteration `step`
    pub fn checkpoint_path(&self, step: usize) -> PathBuf {
        checkpoint_file(&self.checkpoint_dir, step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Placement;

    #[test]
    fn test_default_is_valid_cpu() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.placement(), Placement::Cpu);
    }

    #[test]
    fn test_partial_json_uses_defaults() -> crate::Result<()> {
        let config: RunConfig = serde_json::from_str(r#"{ "device": [1, 2], "verbose": true }"#)?;
        assert_eq!(config.device.placement(), Placement::DataParallel(vec![0, 1]));
        assert!(config.verbose);
        assert_eq!(config.save_every, 1000);
        assert_eq!(config.checkpoint_dir, PathBuf::from("checkpoints"));
        Ok(())
    }

    #[test]
    fn test_invalid_device_list_rejected() {
        let result = serde_json::from_str::<RunConfig>(r#"{ "device": [0, 3] }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_save_every_rejected() {
        let config = RunConfig {
            save_every: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(crate::XtError::Config(_))));
    }

    #[test]
    fn test_from_json_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{ "device": [2], "checkpoint_dir": "runs/a", "save_every": 50 }"#)?;

        let config = RunConfig::from_json_file(&path)?;
        assert_eq!(config.device.placement(), Placement::Cuda(1));
        assert_eq!(config.checkpoint_path(100), PathBuf::from("runs/a").join("checkpoint_step_100.safetensors"));
        Ok(())
    }

    #[test]
    fn test_should_save() {
        let config = RunConfig {
            save_every: 10,
            ..Default::default()
        };
        assert!(!config.should_save(0));
        assert!(!config.should_save(5));
        assert!(config.should_save(10));
        assert!(config.should_save(30));
    }
}
