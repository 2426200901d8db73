//! Optimization algorithms
//!
//! This module wraps argmin's L-BFGS with a More-Thuente line search, and adapts a
//! [`LikelihoodModel`] into an objective over its free parameters.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use rf_core::{Error, LikelihoodModel, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Configuration for the L-BFGS minimizer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizerConfig {
    /// Maximum number of iterations
    pub max_iter: u64,
    /// Number of corrections to approximate inverse Hessian
    pub m: usize,
    /// Convergence tolerance for the gradient norm
    pub tol_grad: f64,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, m: 10, tol_grad: 1e-6 }
    }
}

/// Result of optimization
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best-fit parameters
    pub parameters: Vec<f64>,
    /// Function value at minimum
    pub fval: f64,
    /// Number of iterations
    pub n_iter: u64,
    /// Number of objective (cost) evaluations.
    pub n_fev: usize,
    /// Number of gradient evaluations.
    pub n_gev: usize,
    /// Convergence status
    pub converged: bool,
    /// Termination message
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, n_gev={}, converged={})",
            self.fval, self.n_iter, self.n_fev, self.n_gev, self.converged
        )
    }
}

/// Objective function trait for optimization
pub trait ObjectiveFunction: Send + Sync {
    /// Evaluate function at given parameters
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at given parameters
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>>;
}

/// Wrapper to make ObjectiveFunction compatible with argmin
struct ArgminProblem<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [(f64, f64)],
    counts: Arc<FuncCounts>,
}

pub(crate) fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds.iter()).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

#[derive(Default)]
struct FuncCounts {
    cost: AtomicUsize,
    grad: AtomicUsize,
}

impl CostFunction for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.counts.cost.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        self.objective.eval(&clamped).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        self.counts.grad.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        let mut g = self
            .objective
            .gradient(&clamped)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;

        // At a bound, drop gradient components pointing further out.
        const EPS: f64 = 1e-12;
        for (i, (&x, &(lo, hi))) in clamped.iter().zip(self.bounds.iter()).enumerate() {
            if x <= lo + EPS && g[i] > 0.0 {
                g[i] = 0.0;
            }
            if x >= hi - EPS && g[i] < 0.0 {
                g[i] = 0.0;
            }
        }

        Ok(g)
    }
}

/// L-BFGS minimizer with box constraints applied by clamping
#[derive(Debug, Clone, Default)]
pub struct LbfgsMinimizer {
    config: MinimizerConfig,
}

impl LbfgsMinimizer {
    /// Create a minimizer with given configuration
    pub fn new(config: MinimizerConfig) -> Self {
        Self { config }
    }

    /// Configuration
    pub fn config(&self) -> &MinimizerConfig {
        &self.config
    }

    /// Minimize `objective` from `init_params` within `bounds`.
    ///
    /// Stops when the cost changes by less than `tol_cost` between iterations, when the
    /// gradient norm drops below the configured tolerance, or at `max_iter`.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init_params: &[f64],
        bounds: &[(f64, f64)],
        tol_cost: f64,
    ) -> Result<OptimizationResult> {
        if init_params.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "Parameter and bounds length mismatch: {} != {}",
                init_params.len(),
                bounds.len()
            )));
        }

        let init_clamped = clamp_params(init_params, bounds);
        if init_clamped.is_empty() {
            let fval = objective.eval(&init_clamped)?;
            return Ok(OptimizationResult {
                parameters: init_clamped,
                fval,
                n_iter: 0,
                n_fev: 1,
                n_gev: 0,
                converged: true,
                message: "no free parameters".into(),
            });
        }

        let counts = Arc::new(FuncCounts::default());
        let problem = ArgminProblem { objective, bounds, counts: counts.clone() };

        let linesearch = MoreThuenteLineSearch::new();
        let solver = LBFGS::new(linesearch, self.config.m)
            .with_tolerance_grad(self.config.tol_grad)
            .map_err(|e| Error::Config(format!("Invalid minimizer configuration (tol_grad): {e}")))?
            .with_tolerance_cost(tol_cost.max(0.0))
            .map_err(|e| Error::Config(format!("Invalid minimizer configuration (tol_cost): {e}")))?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(init_clamped).max_iters(self.config.max_iter))
            .run()
            .map_err(|e| Error::Optimizer(format!("Optimization failed: {e}")))?;

        let state = res.state();
        let best_params_unclamped = state
            .get_best_param()
            .ok_or_else(|| Error::Optimizer("No best parameters found".to_string()))?
            .clone();
        let parameters = clamp_params(&best_params_unclamped, bounds);
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );

        Ok(OptimizationResult {
            parameters,
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev: counts.cost.load(Ordering::Relaxed),
            n_gev: counts.grad.load(Ordering::Relaxed),
            converged,
            message: termination.to_string(),
        })
    }
}

#[derive(Default)]
struct Cache {
    params: Vec<f64>,
    value: f64,
    grad: Vec<f64>,
    valid: bool,
}

/// `-2 log L` of a [`LikelihoodModel`] as a function of its free parameters.
///
/// Parameters outside `free` stay at their values in `base`. Non-finite values are replaced
/// by `nan_val`, non-finite gradient components by zero. Value and gradient come from one
/// model call and are cached for the point last evaluated.
pub struct FreeParamObjective<'a> {
    model: &'a dyn LikelihoodModel,
    base: Vec<f64>,
    free: Vec<usize>,
    fixed: Vec<usize>,
    nan_val: f64,
    cache: Mutex<Cache>,
}

impl<'a> FreeParamObjective<'a> {
    /// Objective over every parameter of `model` not in `fixed`.
    pub fn new(model: &'a dyn LikelihoodModel, base: Vec<f64>, fixed: &[usize], nan_val: f64) -> Self {
        let mut fixed = fixed.to_vec();
        fixed.sort_unstable();
        fixed.dedup();
        let free = (0..base.len()).filter(|i| fixed.binary_search(i).is_err()).collect();
        Self { model, base, free, fixed, nan_val, cache: Mutex::new(Cache::default()) }
    }

    /// Indices of the free parameters, ascending.
    pub fn free(&self) -> &[usize] {
        &self.free
    }

    /// Current values of the free parameters.
    pub fn free_values(&self) -> Vec<f64> {
        self.free.iter().map(|&i| self.base[i]).collect()
    }

    /// Bounds of the free parameters.
    pub fn free_bounds(&self) -> Vec<(f64, f64)> {
        let all = self.model.parameter_bounds();
        self.free.iter().map(|&i| all[i]).collect()
    }

    /// Full parameter vector with the free parameters set to `x`.
    pub fn expand(&self, x: &[f64]) -> Vec<f64> {
        let mut full = self.base.clone();
        for (&i, &v) in self.free.iter().zip(x) {
            full[i] = v;
        }
        full
    }

    fn ensure(&self, x: &[f64]) -> Result<std::sync::MutexGuard<'_, Cache>> {
        let mut cache =
            self.cache.lock().map_err(|_| Error::Computation("objective cache poisoned".into()))?;
        if cache.valid && cache.params == x {
            return Ok(cache);
        }
        if let Some(token) = self.model.cancel_token() {
            token.check()?;
        }
        let (mut value, mut grad) = self.model.minus_ll_grad(&self.expand(x), &self.fixed)?;
        if !value.is_finite() {
            log::warn!("non-finite -2 log L ({value}) at {x:?}, using {}", self.nan_val);
            value = self.nan_val;
        }
        for g in grad.iter_mut().filter(|g| !g.is_finite()) {
            *g = 0.0;
        }
        *cache = Cache { params: x.to_vec(), value, grad, valid: true };
        Ok(cache)
    }
}

impl ObjectiveFunction for FreeParamObjective<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        Ok(self.ensure(params)?.value)
    }

    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        Ok(self.ensure(params)?.grad.clone())
    }
}

/// Minimize `-2 log L` over the parameters of `model` not in `fixed`, starting from `start`.
///
/// Returns the full parameter vector and the minimizer result (over the free subset).
pub(crate) fn profile_minimum(
    minimizer: &LbfgsMinimizer,
    model: &dyn LikelihoodModel,
    start: &[f64],
    fixed: &[usize],
    tol_cost: f64,
    nan_val: f64,
) -> Result<(Vec<f64>, OptimizationResult)> {
    let objective = FreeParamObjective::new(model, start.to_vec(), fixed, nan_val);
    let res = minimizer.minimize(&objective, &objective.free_values(), &objective.free_bounds(), tol_cost);
    let res = match res {
        Err(_) if model.cancel_token().is_some_and(|t| t.is_cancelled()) => return Err(Error::Cancelled),
        other => other?,
    };
    Ok((objective.expand(&res.parameters), res))
}
