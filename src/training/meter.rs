/// Weighted running average of a scalar loss
use crate::{Result, XtError};

/// Accumulates `value * weight` between resets
///
/// `weight` is usually the batch size, so `average` is the per-sample loss
/// over everything added since the last `reset`. `iteration` counts every
/// `add` over the meter's lifetime and is not cleared by `reset`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossMeter {
    iteration: usize,
    sum: f64,
    count: usize,
}

impl LossMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the running sum and count
    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    /// Add `value` observed over `weight` samples
    pub fn add(&mut self, value: f64, weight: usize) {
        self.sum += value * weight as f64;
        self.count += weight;
        self.iteration += 1;
    }

    /// Average since the last reset
    ///
    /// Fails with `XtError::DivisionByZero` when no weight has been added.
    pub fn average(&self) -> Result<f64> {
        if self.count == 0 {
            return Err(XtError::DivisionByZero);
        }
        Ok(self.sum / self.count as f64)
    }

    /// Number of `add` calls since construction
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_average() -> Result<()> {
        let mut meter = LossMeter::new();
        meter.add(2.0, 3);
        meter.add(4.0, 1);

        assert!((meter.average()? - 2.5).abs() < 1e-12);
        assert_eq!(meter.count(), 4);
        assert!((meter.sum() - 10.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_fresh_meter_has_no_average() {
        let meter = LossMeter::new();
        assert!(matches!(meter.average(), Err(XtError::DivisionByZero)));
    }

    #[test]
    fn test_reset_keeps_iteration() -> Result<()> {
        let mut meter = LossMeter::new();
        meter.add(1.0, 8);
        meter.add(3.0, 8);
        assert_eq!(meter.iteration(), 2);

        meter.reset();
        assert_eq!(meter.iteration(), 2);
        assert!(matches!(meter.average(), Err(XtError::DivisionByZero)));

        meter.add(5.0, 2);
        assert_eq!(meter.iteration(), 3);
        assert!((meter.average()? - 5.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_zero_weight_counts_iteration_only() {
        let mut meter = LossMeter::new();
        meter.add(7.0, 0);
        assert_eq!(meter.iteration(), 1);
        assert!(matches!(meter.average(), Err(XtError::DivisionByZero)));
    }
}
