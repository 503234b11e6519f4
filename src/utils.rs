/// Utility functions for parameter bookkeeping
use candle_core::{DType, Tensor};

use crate::models::StateDict;
use crate::{Result, XtError};

/// Calculate the number of parameters in a tensor
pub fn count_parameters(tensor: &Tensor) -> usize {
    tensor.dims().iter().product()
}

/// Total number of scalar parameters in a state dict
pub fn count_state_dict(state_dict: &StateDict) -> usize {
    state_dict.values().map(count_parameters).sum()
}

/// Largest absolute element-wise difference between two tensors
///
/// Compared in F64. Returns 0 for empty tensors.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f64> {
    if a.dims() != b.dims() {
        return Err(XtError::ShapeMismatch(format!(
            "cannot compare {:?} with {:?}",
            a.dims(),
            b.dims()
        )));
    }

    let a = a.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let b = b.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max))
}
