/// AdamW optimizer with exportable state
///
/// Adam with decoupled weight decay regularization. Unlike candle-nn's
/// built-in optimizers, the moment estimates can be exported to a `StateDict`
/// and restored, so a checkpoint can resume training exactly.
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

use crate::models::{Model, StateDict};
use crate::{Result, XtError};

/// AdamW optimizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for computing running averages of gradient (beta1)
    pub beta1: f64,
    /// Coefficient for computing running averages of squared gradient (beta2)
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// Parameter state for AdamW
#[derive(Debug, Clone)]
struct ParamState {
    /// First moment estimate (exponential moving average of gradients)
    exp_avg: Tensor,
    /// Second moment estimate (exponential moving average of squared gradients)
    exp_avg_sq: Tensor,
    /// Step counter
    step: usize,
}

/// Checked optimizer state, not yet applied
pub(crate) struct PreparedState {
    config: AdamWConfig,
    states: HashMap<usize, ParamState>,
}

#[derive(Default)]
struct PartialState {
    exp_avg: Option<Tensor>,
    exp_avg_sq: Option<Tensor>,
    step: Option<usize>,
}

/// AdamW optimizer
///
/// Implements Adam with decoupled weight decay as described in
/// "Decoupled Weight Decay Regularization" (Loshchilov & Hutter, 2019).
/// State is keyed by parameter position, so the optimizer restoring a
/// checkpoint must be built over the parameters in the same order
/// (`Model::vars` guarantees this for identically laid out models).
pub struct AdamW {
    config: AdamWConfig,
    vars: Vec<Var>,
    states: HashMap<usize, ParamState>,
}

impl AdamW {
    /// Optimizer over all parameters of `model`
    pub fn from_model(model: &Model, config: AdamWConfig) -> Result<Self> {
        Ok(<Self as Optimizer>::new(model.vars()?, config)?)
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Get reference to parameters
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Number of update steps taken for parameter `index`
    pub fn param_step(&self, index: usize) -> usize {
        self.states.get(&index).map(|s| s.step).unwrap_or(0)
    }

    /// Export hyper-parameters and per-parameter moments
    ///
    /// Keys: `param_groups.{lr,beta1,beta2,eps,weight_decay}` and
    /// `state.<index>.{exp_avg,exp_avg_sq,step}`. Scalars are rank-0 F64 tensors.
    pub fn state_dict(&self) -> Result<StateDict> {
        let mut state_dict = StateDict::new();

        let hyper = [
            ("lr", self.config.lr),
            ("beta1", self.config.beta1),
            ("beta2", self.config.beta2),
            ("eps", self.config.eps),
            ("weight_decay", self.config.weight_decay),
        ];
        for (name, value) in hyper {
            state_dict.insert(format!("param_groups.{}", name), Tensor::new(value, &Device::Cpu)?);
        }

        for (index, state) in self.states.iter() {
            state_dict.insert(format!("state.{}.exp_avg", index), state.exp_avg.copy()?);
            state_dict.insert(format!("state.{}.exp_avg_sq", index), state.exp_avg_sq.copy()?);
            state_dict.insert(
                format!("state.{}.step", index),
                Tensor::new(state.step as f64, &Device::Cpu)?,
            );
        }

        Ok(state_dict)
    }

    /// Restore state exported by `state_dict`
    ///
    /// All-or-nothing: on error the optimizer is left unchanged.
    pub fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        let prepared = self.prepare_state(state_dict)?;
        self.commit_state(prepared);
        Ok(())
    }

    /// Check `state_dict` against the optimized parameters without touching them
    pub(crate) fn prepare_state(&self, state_dict: &StateDict) -> Result<PreparedState> {
        let mut config = self.config.clone();
        let mut partial: HashMap<usize, PartialState> = HashMap::new();

        for (key, tensor) in state_dict.iter() {
            if let Some(name) = key.strip_prefix("param_groups.") {
                let value = scalar(tensor)?;
                match name {
                    "lr" => config.lr = value,
                    "beta1" => config.beta1 = value,
                    "beta2" => config.beta2 = value,
                    "eps" => config.eps = value,
                    "weight_decay" => config.weight_decay = value,
                    _ => return Err(unexpected_key(key)),
                }
                continue;
            }

            let (index, field) = key
                .strip_prefix("state.")
                .and_then(|rest| rest.split_once('.'))
                .and_then(|(index, field)| index.parse::<usize>().ok().map(|i| (i, field)))
                .ok_or_else(|| unexpected_key(key))?;

            let var = self.vars.get(index).ok_or_else(|| {
                XtError::ShapeMismatch(format!(
                    "optimizer state for parameter {} but only {} parameters are optimized",
                    index,
                    self.vars.len()
                ))
            })?;

            let entry = partial.entry(index).or_default();
            match field {
                "exp_avg" => entry.exp_avg = Some(moment_for(var, tensor, key)?),
                "exp_avg_sq" => entry.exp_avg_sq = Some(moment_for(var, tensor, key)?),
                "step" => entry.step = Some(step_count(tensor, key)?),
                _ => return Err(unexpected_key(key)),
            }
        }

        let mut states = HashMap::with_capacity(partial.len());
        for (index, state) in partial {
            match (state.exp_avg, state.exp_avg_sq, state.step) {
                (Some(exp_avg), Some(exp_avg_sq), Some(step)) => {
                    states.insert(index, ParamState { exp_avg, exp_avg_sq, step });
                }
                _ => {
                    return Err(XtError::ShapeMismatch(format!(
                        "incomplete optimizer state for parameter {}",
                        index
                    )))
                }
            }
        }

        Ok(PreparedState { config, states })
    }

    pub(crate) fn commit_state(&mut self, prepared: PreparedState) {
        log::debug!("Restored optimizer state for {} parameters", prepared.states.len());
        self.config = prepared.config;
        self.states = prepared.states;
    }
}

impl Optimizer for AdamW {
    type Config = AdamWConfig;

    fn new(vars: Vec<Var>, config: AdamWConfig) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .collect();
        Ok(Self {
            config,
            vars,
            states: HashMap::new(),
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let cfg = &self.config;

        for (i, var) in self.vars.iter().enumerate() {
            let grad = match grads.get(var) {
                Some(grad) => grad,
                None => continue,
            };

            let state = match self.states.entry(i) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(ParamState {
                    exp_avg: var.zeros_like()?,
                    exp_avg_sq: var.zeros_like()?,
                    step: 0,
                }),
            };

            state.step += 1;

            // m = beta1 * m + (1 - beta1) * grad
            state.exp_avg = ((&state.exp_avg * cfg.beta1)? + (grad * (1.0 - cfg.beta1))?)?;

            // v = beta2 * v + (1 - beta2) * grad^2
            state.exp_avg_sq = ((&state.exp_avg_sq * cfg.beta2)? + (grad.sqr()? * (1.0 - cfg.beta2))?)?;

            // Bias correction
            let m_hat = (&state.exp_avg / (1.0 - cfg.beta1.powi(state.step as i32)))?;
            let v_hat = (&state.exp_avg_sq / (1.0 - cfg.beta2.powi(state.step as i32)))?;

            // lr * m_hat / (sqrt(v_hat) + eps)
            let update = ((m_hat / (v_hat.sqrt()? + cfg.eps)?)? * cfg.lr)?;

            // Decoupled weight decay: param = param * (1 - lr * weight_decay)
            let decayed = (var.as_tensor() * (1.0 - cfg.lr * cfg.weight_decay))?;

            var.set(&(decayed - update)?)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

fn scalar(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

fn step_count(tensor: &Tensor, key: &str) -> Result<usize> {
    let value = scalar(tensor)?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(XtError::ShapeMismatch(format!(
            "optimizer state '{}' holds invalid step count {}",
            key, value
        )));
    }
    Ok(value as usize)
}

fn moment_for(var: &Var, tensor: &Tensor, key: &str) -> Result<Tensor> {
    if tensor.dims() != var.dims() {
        return Err(XtError::ShapeMismatch(format!(
            "optimizer state '{}' has shape {:?}, parameter has {:?}",
            key,
            tensor.dims(),
            var.dims()
        )));
    }
    Ok(tensor.to_device(var.device())?.to_dtype(var.dtype())?)
}

fn unexpected_key(key: &str) -> XtError {
    XtError::ShapeMismatch(format!("unexpected optimizer state key '{}'", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Init;

    fn model(init: f64) -> crate::Result<Model> {
        let model = Model::new(Device::Cpu);
        let vb = model.var_builder(DType::F32);
        vb.get_with_hints((2, 2), "a.weight", Init::Const(init))?;
        vb.get_with_hints(2, "b.bias", Init::Const(init))?;
        Ok(model)
    }

    fn loss(model: &Model) -> crate::Result<Tensor> {
        let mut total = Tensor::new(0f32, &Device::Cpu)?;
        for var in model.vars()? {
            total = (total + var.as_tensor().sqr()?.sum_all()?)?;
        }
        Ok(total)
    }

    #[test]
    fn test_adamw_creation() -> crate::Result<()> {
        let optimizer = AdamW::from_model(&model(1.0)?, AdamWConfig::default())?;
        assert_eq!(optimizer.learning_rate(), 1e-3);
        assert_eq!(optimizer.vars().len(), 2);
        Ok(())
    }

    #[test]
    fn test_adamw_step_reduces_loss() -> crate::Result<()> {
        let model = model(3.0)?;
        let config = AdamWConfig {
            lr: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut optimizer = AdamW::from_model(&model, config)?;

        let before = loss(&model)?.to_scalar::<f32>()?;
        for _ in 0..10 {
            optimizer.backward_step(&loss(&model)?)?;
        }
        let after = loss(&model)?.to_scalar::<f32>()?;

        assert!(after < before, "loss {} did not drop below {}", after, before);
        assert_eq!(optimizer.param_step(0), 10);
        Ok(())
    }

    #[test]
    fn test_adamw_lr_scheduling() -> crate::Result<()> {
        let mut optimizer = AdamW::from_model(&model(1.0)?, AdamWConfig::default())?;
        optimizer.set_learning_rate(5e-4);
        assert_eq!(optimizer.learning_rate(), 5e-4);
        assert_eq!(optimizer.config().lr, 5e-4);
        Ok(())
    }

    #[test]
    fn test_state_dict_round_trip() -> crate::Result<()> {
        let source_model = model(2.0)?;
        let mut source = AdamW::from_model(&source_model, AdamWConfig { lr: 0.05, ..Default::default() })?;
        for _ in 0..3 {
            source.backward_step(&loss(&source_model)?)?;
        }

        let mut target = AdamW::from_model(&model(2.0)?, AdamWConfig::default())?;
        target.load_state_dict(&source.state_dict()?)?;

        assert_eq!(target.config(), source.config());
        assert_eq!(target.param_step(0), 3);
        assert_eq!(target.param_step(1), 3);

        let a = source.state_dict()?;
        let b = target.state_dict()?;
        assert_eq!(a.len(), b.len());
        for (key, tensor) in a.iter() {
            assert!(crate::utils::max_abs_diff(tensor, &b[key])? < 1e-7, "{} differs", key);
        }
        Ok(())
    }

    #[test]
    fn test_load_rejects_wrong_shape() -> crate::Result<()> {
        let mut optimizer = AdamW::from_model(&model(1.0)?, AdamWConfig::default())?;
        let mut state_dict = StateDict::new();
        state_dict.insert("state.0.exp_avg".to_string(), Tensor::zeros(3, DType::F32, &Device::Cpu)?);

        let result = optimizer.load_state_dict(&state_dict);
        assert!(matches!(result, Err(XtError::ShapeMismatch(_))));
        Ok(())
    }

    #[test]
    fn test_load_rejects_unknown_parameter_index() -> crate::Result<()> {
        let mut optimizer = AdamW::from_model(&model(1.0)?, AdamWConfig::default())?;
        let mut state_dict = StateDict::new();
        state_dict.insert("state.9.step".to_string(), Tensor::new(1f64, &Device::Cpu)?);

        assert!(matches!(
            optimizer.load_state_dict(&state_dict),
            Err(XtError::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_load_rejects_incomplete_state() -> crate::Result<()> {
        let mut optimizer = AdamW::from_model(&model(1.0)?, AdamWConfig::default())?;
        let mut state_dict = StateDict::new();
        state_dict.insert("state.0.step".to_string(), Tensor::new(4f64, &Device::Cpu)?);

        assert!(optimizer.load_state_dict(&state_dict).is_err());
        assert_eq!(optimizer.param_step(0), 0);
        Ok(())
    }

    #[test]
    fn test_load_rejects_bad_step_count() -> crate::Result<()> {
        let source_model = model(1.0)?;
        let mut source = AdamW::from_model(&source_model, AdamWConfig::default())?;
        source.backward_step(&loss(&source_model)?)?;

        for bad in [-1f64, f64::NAN, 2.5] {
            let mut state_dict = source.state_dict()?;
            state_dict.insert("state.0.step".to_string(), Tensor::new(bad, &Device::Cpu)?);

            let mut target = AdamW::from_model(&model(1.0)?, AdamWConfig::default())?;
            assert!(matches!(
                target.load_state_dict(&state_dict),
                Err(XtError::ShapeMismatch(_))
            ));
            assert_eq!(target.param_step(0), 0);
        }
        Ok(())
    }
}
