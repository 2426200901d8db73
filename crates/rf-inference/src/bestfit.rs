//! Maximum-likelihood fits via L-BFGS.

use crate::optimizer::{LbfgsMinimizer, MinimizerConfig, clamp_params, profile_minimum};
use nalgebra::DMatrix;
use rf_core::{BestfitObjective, BestfitProblem, Error, LikelihoodModel, Result};
use std::collections::BTreeMap;

/// Covariance `2 * inverse(H)` from the Hessian of `-2 log L`.
///
/// Prefers a Cholesky solve; falls back to LU. `None` when singular or when a variance is
/// not positive.
pub fn covariance_from_hessian(hessian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = hessian.nrows();
    let inv = match nalgebra::linalg::Cholesky::new(hessian.clone()) {
        Some(chol) => chol.solve(&DMatrix::identity(n, n)),
        None => hessian.clone().lu().try_inverse()?,
    };
    let cov = inv * 2.0;
    (0..n).all(|i| cov[(i, i)].is_finite() && cov[(i, i)] > 0.0).then_some(cov)
}

/// Best fit by L-BFGS over the non-fixed parameters, with an optional Newton step first.
#[derive(Debug, Clone, Default)]
pub struct LbfgsBestfit {
    minimizer: LbfgsMinimizer,
}

impl LbfgsBestfit {
    /// Create with the given minimizer configuration.
    pub fn new(config: MinimizerConfig) -> Self {
        Self { minimizer: LbfgsMinimizer::new(config) }
    }

    // One Newton step from the guess, kept only if it lowers -2 log L.
    fn newton_start(&self, problem: &BestfitProblem<'_>) -> Result<Vec<f64>> {
        let model = problem.model;
        let guess = &problem.guess;
        let free: Vec<usize> =
            (0..guess.len()).filter(|i| !problem.fixed.contains(i)).collect();
        if free.is_empty() {
            return Ok(guess.clone());
        }
        let (v0, g, h) = model.minus_ll_grad_hessian(guess, &problem.fixed)?;
        let k = free.len();
        let h = DMatrix::from_fn(k, k, |i, j| h[i][j]);
        let Some(chol) = nalgebra::linalg::Cholesky::new(h) else {
            log::debug!("Hessian at the guess is not positive definite, skipping the Newton step");
            return Ok(guess.clone());
        };
        let step = chol.solve(&nalgebra::DVector::from_column_slice(&g));

        let bounds = model.parameter_bounds();
        let mut candidate = guess.clone();
        for (k, &i) in free.iter().enumerate() {
            candidate[i] -= step[k];
        }
        let candidate = clamp_params(&candidate, &bounds);
        let (v1, _) = model.minus_ll_grad(&candidate, &(0..guess.len()).collect::<Vec<_>>())?;
        if v1.is_finite() && v1 < v0 {
            log::debug!("Newton step lowered -2 log L from {v0} to {v1}");
            Ok(candidate)
        } else {
            log::debug!("Newton step rejected (-2 log L {v0} -> {v1})");
            Ok(guess.clone())
        }
    }
}

impl BestfitObjective for LbfgsBestfit {
    fn minimize(&self, problem: &BestfitProblem<'_>) -> Result<BTreeMap<String, f64>> {
        let model = problem.model;
        let names = model.parameter_names();
        if problem.guess.len() != names.len() {
            return Err(Error::Invocation(format!(
                "guess has {} values for {} parameters",
                problem.guess.len(),
                names.len()
            )));
        }

        let start = if problem.use_hessian { self.newton_start(problem)? } else { problem.guess.clone() };
        let (best, res) = profile_minimum(
            &self.minimizer,
            model,
            &start,
            &problem.fixed,
            0.1 * problem.llr_tolerance,
            problem.nan_val,
        )?;
        if res.converged {
            log::debug!("bestfit: {res}");
        } else {
            log::warn!("bestfit did not converge: {} ({})", res.message, res);
        }

        let mut out: BTreeMap<String, f64> = names.iter().cloned().zip(best.iter().copied()).collect();
        if problem.return_errors {
            for (name, err) in errors(model, &best, &problem.fixed, &names)? {
                out.insert(format!("error_{name}"), err);
            }
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "lbfgs"
    }
}

fn errors(
    model: &dyn LikelihoodModel,
    best: &[f64],
    fixed: &[usize],
    names: &[String],
) -> Result<Vec<(String, f64)>> {
    let free: Vec<usize> = (0..best.len()).filter(|i| !fixed.contains(i)).collect();
    if free.is_empty() {
        return Ok(Vec::new());
    }
    let (_, _, h) = model.minus_ll_grad_hessian(best, fixed)?;
    let k = free.len();
    let h = DMatrix::from_fn(k, k, |i, j| h[i][j]);
    let cov = covariance_from_hessian(&h)
        .ok_or_else(|| Error::Computation("Hessian at the best fit is not invertible".into()))?;
    Ok(free.iter().enumerate().map(|(k, &i)| (names[i].clone(), cov[(k, k)].sqrt())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_covariance_from_hessian() {
        // H(-2 log L) = 2 / sigma^2 for a Gaussian
        let h = DMatrix::from_row_slice(2, 2, &[2.0 / 4.0, 0.0, 0.0, 2.0 / 9.0]);
        let cov = covariance_from_hessian(&h).unwrap();
        assert_relative_eq!(cov[(0, 0)], 4.0, epsilon = 1e-12);
        assert_relative_eq!(cov[(1, 1)], 9.0, epsilon = 1e-12);
        let neg = DMatrix::from_row_slice(1, 1, &[-1.0]);
        assert!(covariance_from_hessian(&neg).is_none());
    }
}
