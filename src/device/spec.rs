//! Device specification
//!
//! A device spec is an ordered list of small integers where `0` means
//! "no GPU" and `i > 0` names physical GPU `i - 1`:
//!
//! | spec        | placement                         |
//! |-------------|-----------------------------------|
//! | `[]`, `[0]` | CPU                               |
//! | `[3]`       | GPU 2                             |
//! | `[1, 2]`    | data-parallel over GPUs 0 and 1   |
use std::fmt;
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::{Result, XtError};

/// Ordered list of 1-based GPU indices (`0` = CPU)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct DeviceSpec(Vec<usize>);

/// Where a device spec puts tensors and models
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Cpu,
    /// Single GPU, zero-based ordinal
    Cuda(usize),
    /// Data-parallel replication over zero-based ordinals; the first is primary
    DataParallel(Vec<usize>),
}

impl DeviceSpec {
    /// Validate and wrap a raw index list
    ///
    /// Multi-device lists may not contain `0`, since that would name GPU `-1`.
    pub fn new(indices: Vec<usize>) -> Result<Self> {
        if indices.len() > 1 && indices.contains(&0) {
            return Err(XtError::Config(format!(
                "device list {:?} mixes CPU (0) with GPU indices",
                indices
            )));
        }
        Ok(Self(indices))
    }

    /// The CPU-only spec `[0]`
    pub fn cpu() -> Self {
        Self(vec![0])
    }

    /// Single GPU by 1-based index
    pub fn gpu(index: usize) -> Self {
        Self(vec![index])
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Resolve the spec into a placement
    pub fn placement(&self) -> Placement {
        match self.0.as_slice() {
            [] | [0] => Placement::Cpu,
            [index] => Placement::Cuda(index - 1),
            indices => Placement::DataParallel(indices.iter().map(|i| i - 1).collect()),
        }
    }

    pub fn uses_gpu(&self) -> bool {
        self.placement() != Placement::Cpu
    }
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self::cpu()
    }
}

impl TryFrom<Vec<usize>> for DeviceSpec {
    type Error = XtError;

    fn try_from(indices: Vec<usize>) -> Result<Self> {
        Self::new(indices)
    }
}

impl From<DeviceSpec> for Vec<usize> {
    fn from(spec: DeviceSpec) -> Self {
        spec.0
    }
}

impl FromStr for DeviceSpec {
    type Err = XtError;

    /// Parse `"cpu"`, `""`, `"0"`, `"2"` or a comma separated list like `"1,2,3"`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("cpu") {
            return Ok(Self::cpu());
        }

        let indices = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|e| XtError::Config(format!("invalid device index '{}': {}", part.trim(), e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(indices)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl Placement {
    /// Zero-based ordinal of the primary GPU, `None` on CPU
    pub fn primary_ordinal(&self) -> Option<usize> {
        match self {
            Placement::Cpu => None,
            Placement::Cuda(ordinal) => Some(*ordinal),
            Placement::DataParallel(ordinals) => ordinals.first().copied(),
        }
    }

    /// Device that tensors land on under this placement
    pub fn primary_device(&self) -> Result<Device> {
        match self.primary_ordinal() {
            None => Ok(Device::Cpu),
            Some(ordinal) => Ok(Device::new_cuda(ordinal)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_specs() {
        assert_eq!(DeviceSpec::new(vec![]).unwrap().placement(), Placement::Cpu);
        assert_eq!(DeviceSpec::cpu().placement(), Placement::Cpu);
        assert!(!DeviceSpec::default().uses_gpu());
    }

    #[test]
    fn test_single_gpu_is_decremented() {
        assert_eq!(DeviceSpec::gpu(1).placement(), Placement::Cuda(0));
        assert_eq!(DeviceSpec::gpu(4).placement(), Placement::Cuda(3));
        assert_eq!(DeviceSpec::gpu(4).placement().primary_ordinal(), Some(3));
    }

    #[test]
    fn test_multi_gpu_keeps_order() {
        let spec = DeviceSpec::new(vec![3, 1, 2]).unwrap();
        assert_eq!(spec.placement(), Placement::DataParallel(vec![2, 0, 1]));
        assert_eq!(spec.placement().primary_ordinal(), Some(2));
        assert!(spec.uses_gpu());
    }

    #[test]
    fn test_zero_in_multi_device_list_rejected() {
        assert!(matches!(DeviceSpec::new(vec![0, 1]), Err(XtError::Config(_))));
    }

    #[test]
    fn test_parse() {
        assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::cpu());
        assert_eq!("".parse::<DeviceSpec>().unwrap(), DeviceSpec::cpu());
        assert_eq!("2".parse::<DeviceSpec>().unwrap(), DeviceSpec::gpu(2));
        assert_eq!(
            " 1, 2 ".parse::<DeviceSpec>().unwrap().indices(),
            &[1, 2]
        );
        assert!("1,x".parse::<DeviceSpec>().is_err());
        assert!("0,1".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let spec = DeviceSpec::new(vec![1, 2, 4]).unwrap();
        assert_eq!(spec.to_string(), "1,2,4");
        assert_eq!(spec.to_string().parse::<DeviceSpec>().unwrap(), spec);
    }

    #[test]
    fn test_serde_validates() {
        let spec: DeviceSpec = serde_json::from_str("[1,2]").unwrap();
        assert_eq!(spec.indices(), &[1, 2]);
        assert!(serde_json::from_str::<DeviceSpec>("[0,2]").is_err());
        assert_eq!(serde_json::to_string(&spec).unwrap(), "[1,2]");
    }

    #[test]
    fn test_cpu_primary_device() {
        assert!(Placement::Cpu.primary_device().unwrap().is_cpu());
    }
}
