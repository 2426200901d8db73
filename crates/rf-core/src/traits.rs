//! Core traits for rarefit
//!
//! Objective strategies (fits and interval searches) only see a likelihood through
//! [`LikelihoodModel`], so the orchestrator and the minimizers live in separate crates.

use std::collections::BTreeMap;

use crate::types::Direction;
use crate::{CancelToken, Result};

/// A differentiable `-2 log L` over a fixed, ordered parameter vector.
pub trait LikelihoodModel: Send + Sync {
    /// Parameter names, in registry order.
    fn parameter_names(&self) -> Vec<String>;

    /// Number of parameters
    fn n_parameters(&self) -> usize {
        self.parameter_names().len()
    }

    /// Parameter bounds (min, max); unbounded ends are infinite.
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// `-2 log L` and its gradient w.r.t. every parameter whose index is not in `omit`.
    ///
    /// `params` is always the full vector; the gradient skips omitted positions.
    fn minus_ll_grad(&self, params: &[f64], omit: &[usize]) -> Result<(f64, Vec<f64>)>;

    /// `-2 log L`, its gradient and its Hessian over the non-omitted parameters.
    fn minus_ll_grad_hessian(
        &self,
        params: &[f64],
        omit: &[usize],
    ) -> Result<(f64, Vec<f64>, Vec<Vec<f64>>)>;

    /// Token checked by long-running objective strategies.
    fn cancel_token(&self) -> Option<&CancelToken> {
        None
    }
}

/// Input of a best-fit minimization.
pub struct BestfitProblem<'a> {
    /// Likelihood to minimize.
    pub model: &'a dyn LikelihoodModel,
    /// Starting point (full vector). Fixed parameters hold their fixed values.
    pub guess: Vec<f64>,
    /// Indices of parameters held at their `guess` value.
    pub fixed: Vec<usize>,
    /// Convergence tolerance on `-2 log L`.
    pub llr_tolerance: f64,
    /// Take a Newton step from the guess before the quasi-Newton iterations.
    pub use_hessian: bool,
    /// Add `error_<name>` entries from the inverse Hessian at the minimum.
    pub return_errors: bool,
    /// Value substituted for non-finite objective values during minimization.
    pub nan_val: f64,
}

/// Strategy finding the maximum-likelihood point.
pub trait BestfitObjective: Send + Sync {
    /// Minimize and return every parameter by name, plus optional `error_<name>` keys.
    fn minimize(&self, problem: &BestfitProblem<'_>) -> Result<BTreeMap<String, f64>>;

    /// Strategy name, used in log messages.
    fn name(&self) -> &str;
}

/// Input of a one-sided profile-likelihood limit search.
pub struct IntervalProblem<'a> {
    /// Likelihood to profile.
    pub model: &'a dyn LikelihoodModel,
    /// Index of the parameter the limit is set on.
    pub target: usize,
    /// Side of the best fit on which the limit lies.
    pub direction: Direction,
    /// Global best fit (full vector).
    pub bestfit: Vec<f64>,
    /// Optional starting value for the target parameter.
    pub guess: Option<f64>,
    /// Indices of parameters held at their best-fit values while profiling.
    pub fixed: Vec<usize>,
    /// Search range for the target parameter.
    pub bound: (Option<f64>, Option<f64>),
    /// Quantile handed to the critical value function.
    pub critical_quantile: f64,
    /// Scale of the first bracketing step.
    pub sigma_guess: f64,
    /// Critical value of the test statistic.
    pub critical_value: &'a dyn CriticalValue,
    /// Tolerance on `(t - t_crit)^2`.
    pub llr_tolerance: f64,
}

/// Strategy solving `t(x) = t_crit(x)` for one parameter.
pub trait IntervalObjective: Send + Sync {
    /// Return the parameters at the limit; the target's entry is the limit itself.
    fn minimize(&self, problem: &IntervalProblem<'_>) -> Result<BTreeMap<String, f64>>;

    /// Strategy name, used in log messages.
    fn name(&self) -> &str;
}

/// Critical value of the profile test statistic at parameter value `x`.
pub trait CriticalValue: Send + Sync {
    /// `t_crit(x, quantile)`.
    fn value(&self, x: f64, quantile: f64) -> f64;

    /// `d t_crit / d x`, used by interval searches that take Newton steps on `t - t_crit`.
    fn derivative(&self, _x: f64, _quantile: f64) -> f64 {
        0.0
    }
}

/// Asymptotic critical value for one profiled parameter: `Phi^-1(q)^2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WilksCriticalValue;

impl CriticalValue for WilksCriticalValue {
    fn value(&self, _x: f64, quantile: f64) -> f64 {
        // Phi^-1(q) = -sqrt(2) erfc^-1(2q)
        let z = -std::f64::consts::SQRT_2 * statrs::function::erf::erfc_inv(2.0 * quantile);
        z * z
    }
}

/// Critical value given by a pair of closures (value, derivative).
pub struct FnCriticalValue<F, G> {
    value: F,
    derivative: G,
}

impl<F, G> FnCriticalValue<F, G>
where
    F: Fn(f64, f64) -> f64 + Send + Sync,
    G: Fn(f64, f64) -> f64 + Send + Sync,
{
    /// Wrap `value(x, q)` and `derivative(x, q)`.
    pub fn new(value: F, derivative: G) -> Self {
        Self { value, derivative }
    }
}

impl<F, G> CriticalValue for FnCriticalValue<F, G>
where
    F: Fn(f64, f64) -> f64 + Send + Sync,
    G: Fn(f64, f64) -> f64 + Send + Sync,
{
    fn value(&self, x: f64, quantile: f64) -> f64 {
        (self.value)(x, quantile)
    }

    fn derivative(&self, x: f64, quantile: f64) -> f64 {
        (self.derivative)(x, quantile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_wilks_critical_value() {
        let w = WilksCriticalValue;
        assert_relative_eq!(w.value(0.0, 0.5), 0.0, epsilon = 1e-12);
        // one-sided 1 sigma
        assert_relative_eq!(w.value(0.0, 0.841_344_746_068_542_9), 1.0, epsilon = 1e-8);
        assert_relative_eq!(w.value(3.0, 0.9), 1.281_551_565_545 * 1.281_551_565_545, epsilon = 1e-8);
        // symmetric in q <-> 1 - q
        assert_relative_eq!(w.value(0.0, 0.05), w.value(0.0, 0.95), epsilon = 1e-9);
        assert_eq!(w.derivative(1.0, 0.9), 0.0);
    }

    #[test]
    fn test_fn_critical_value() {
        let c = FnCriticalValue::new(|x, q| x * q, |_, q| q);
        assert_relative_eq!(c.value(2.0, 0.5), 1.0);
        assert_relative_eq!(c.derivative(2.0, 0.5), 0.5);
    }

    struct Quadratic;

    impl LikelihoodModel for Quadratic {
        fn parameter_names(&self) -> Vec<String> {
            vec!["x".into(), "y".into()]
        }

        fn parameter_bounds(&self) -> Vec<(f64, f64)> {
            vec![(f64::NEG_INFINITY, f64::INFINITY); 2]
        }

        fn minus_ll_grad(&self, p: &[f64], omit: &[usize]) -> Result<(f64, Vec<f64>)> {
            let grad = [2.0 * p[0], 2.0 * p[1]]
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !omit.contains(i))
                .map(|(_, g)| g)
                .collect();
            Ok((p[0] * p[0] + p[1] * p[1], grad))
        }

        fn minus_ll_grad_hessian(
            &self,
            p: &[f64],
            omit: &[usize],
        ) -> Result<(f64, Vec<f64>, Vec<Vec<f64>>)> {
            let (v, g) = self.minus_ll_grad(p, omit)?;
            let n = g.len();
            let h = (0..n).map(|i| (0..n).map(|j| if i == j { 2.0 } else { 0.0 }).collect()).collect();
            Ok((v, g, h))
        }
    }

    #[test]
    fn test_model_trait_defaults() {
        let m = Quadratic;
        assert_eq!(m.n_parameters(), 2);
        assert!(m.cancel_token().is_none());
        let (v, g) = m.minus_ll_grad(&[1.0, 2.0], &[0]).unwrap();
        assert_relative_eq!(v, 5.0);
        assert_eq!(g, vec![4.0]);
    }
}
