//! One-sided profile-likelihood limits by bracketing and safeguarded Newton bisection.
//!
//! The test statistic at a trial value `x` of the target is
//!
//! ```text
//! t(x) = min_nuisance (-2 log L)(x, nuisance) - (-2 log L)(bestfit)
//! ```
//!
//! and the limit is where `t(x)` crosses the critical value `t_crit(x, q)`.

use crate::optimizer::{LbfgsMinimizer, MinimizerConfig, profile_minimum};
use rf_core::{Direction, Error, IntervalObjective, IntervalProblem, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Settings of the bracketing and bisection search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalSearchConfig {
    /// Maximum bisection iterations.
    pub max_iter: usize,
    /// Maximum step doublings while bracketing.
    pub max_expansions: usize,
    /// Stop bisecting once the bracket is narrower than `rtol * sigma_guess`.
    pub rtol: f64,
}

impl Default for IntervalSearchConfig {
    fn default() -> Self {
        Self { max_iter: 60, max_expansions: 50, rtol: 1e-4 }
    }
}

/// Profile-likelihood limit search.
#[derive(Debug, Clone, Default)]
pub struct ProfileBisection {
    minimizer: LbfgsMinimizer,
    search: IntervalSearchConfig,
}

impl ProfileBisection {
    /// Create with explicit minimizer and search settings.
    pub fn new(minimizer: MinimizerConfig, search: IntervalSearchConfig) -> Self {
        Self { minimizer: LbfgsMinimizer::new(minimizer), search }
    }
}

// Profile evaluations sharing a warm start.
struct Profile<'p, 'a> {
    problem: &'p IntervalProblem<'a>,
    minimizer: &'p LbfgsMinimizer,
    fixed: Vec<usize>,
    reference: f64,
    current: Vec<f64>,
    tol_cost: f64,
}

// `t(x) - t_crit(x)` at a trial point and its slope in `x`.
#[derive(Debug, Clone, Copy)]
struct Excess {
    x: f64,
    f: f64,
    slope: f64,
}

impl Excess {
    // Newton step, if it lands strictly inside `(a, b)`.
    fn newton(&self, a: f64, b: f64) -> Option<f64> {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let x = self.x - self.f / self.slope;
        (x.is_finite() && x > lo && x < hi).then_some(x)
    }
}

impl Profile<'_, '_> {
    fn excess(&mut self, x: f64) -> Result<Excess> {
        if let Some(token) = self.problem.model.cancel_token() {
            token.check()?;
        }
        let target = self.problem.target;
        let mut start = self.current.clone();
        start[target] = x;
        let (params, res) =
            profile_minimum(self.minimizer, self.problem.model, &start, &self.fixed, self.tol_cost, f64::INFINITY)?;
        if !res.converged {
            log::warn!("profile fit at {x} did not converge: {}", res.message);
        }
        // the nuisance parameters sit at their minimum, so dt/dx is the partial derivative
        let others: Vec<usize> = (0..params.len()).filter(|&i| i != target).collect();
        let (_, grad) = self.problem.model.minus_ll_grad(&params, &others)?;
        self.current = params;

        let q = self.problem.critical_quantile;
        let t = res.fval - self.reference;
        let f = t - self.problem.critical_value.value(x, q);
        let slope = grad.first().copied().unwrap_or(f64::NAN)
            - self.problem.critical_value.derivative(x, q);
        Ok(Excess { x, f, slope })
    }
}

impl IntervalObjective for ProfileBisection {
    fn minimize(&self, problem: &IntervalProblem<'_>) -> Result<BTreeMap<String, f64>> {
        let model = problem.model;
        let names = model.parameter_names();
        let target = problem.target;
        if target >= names.len() || problem.bestfit.len() != names.len() {
            return Err(Error::Invocation(format!(
                "target {target} and best fit of length {} do not match {} parameters",
                problem.bestfit.len(),
                names.len()
            )));
        }
        if !(problem.sigma_guess.is_finite() && problem.sigma_guess > 0.0) {
            return Err(Error::Invocation(format!(
                "sigma_guess must be positive, got {}",
                problem.sigma_guess
            )));
        }

        let all: Vec<usize> = (0..names.len()).collect();
        let (reference, _) = model.minus_ll_grad(&problem.bestfit, &all)?;
        let mut fixed = problem.fixed.clone();
        fixed.push(target);

        let sign = problem.direction.sign();
        let x_best = problem.bestfit[target];
        let far = match problem.direction {
            Direction::Up => problem.bound.1,
            Direction::Down => problem.bound.0,
        };
        let clip = |x: f64| match far {
            Some(b) if sign * (x - b) > 0.0 => b,
            _ => x,
        };

        let mut profile = Profile {
            problem,
            minimizer: &self.minimizer,
            fixed,
            reference,
            current: problem.bestfit.clone(),
            tol_cost: 0.1 * problem.llr_tolerance,
        };
        let done = |x: f64, profile: &Profile<'_, '_>| {
            let mut out: BTreeMap<String, f64> =
                names.iter().cloned().zip(profile.current.iter().copied()).collect();
            out.insert(names[target].clone(), x);
            out
        };

        // Bracket: `inside` has t < t_crit, `outside` has t >= t_crit.
        let mut inside = x_best;
        let mut step = problem.sigma_guess;
        let mut trial = match problem.guess {
            Some(g) if sign * (g - x_best) > 0.0 => clip(g),
            Some(g) => {
                log::debug!("ignoring guess {g} on the wrong side of the best fit {x_best}");
                clip(x_best + sign * step)
            }
            None => clip(x_best + sign * step),
        };
        let mut outside = None;
        for _ in 0..=self.search.max_expansions {
            let e = profile.excess(trial)?;
            log::debug!("bracketing {}: t - t_crit = {} at {trial}", names[target], e.f);
            if e.f >= 0.0 {
                outside = Some(e);
                break;
            }
            if far.is_some_and(|b| trial == b) {
                log::debug!("limit on {} reaches the bound {trial}", names[target]);
                return Ok(done(trial, &profile));
            }
            inside = trial;
            step *= 2.0;
            trial = clip(inside + sign * step);
        }
        let Some(mut last) = outside else {
            return Err(Error::Optimizer(format!(
                "could not bracket the limit on {} within {} expansions",
                names[target], self.search.max_expansions
            )));
        };
        let mut outside = last.x;

        // Newton steps inside the bracket, bisection when a step leaves it or stalls.
        let min_width = self.search.rtol * problem.sigma_guess;
        let mut bisect_next = false;
        let mut mid = 0.5 * (inside + outside);
        for _ in 0..self.search.max_iter {
            let width = (outside - inside).abs();
            mid = match last.newton(inside, outside) {
                Some(x) if !bisect_next => x,
                _ => 0.5 * (inside + outside),
            };
            last = profile.excess(mid)?;
            if last.f * last.f < problem.llr_tolerance {
                return Ok(done(mid, &profile));
            }
            if last.f < 0.0 {
                inside = mid;
            } else {
                outside = mid;
            }
            let new_width = (outside - inside).abs();
            if new_width < min_width {
                return Ok(done(0.5 * (inside + outside), &profile));
            }
            bisect_next = new_width > 0.5 * width;
        }
        log::warn!(
            "interval search on {} stopped after {} iterations",
            names[target], self.search.max_iter
        );
        Ok(done(mid, &profile))
    }

    fn name(&self) -> &str {
        "profile-bisection"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rf_core::{FnCriticalValue, LikelihoodModel, WilksCriticalValue};

    // -2 log L = (x / 2)^2 + (y - x)^2, x >= 0
    struct Correlated;

    impl LikelihoodModel for Correlated {
        fn parameter_names(&self) -> Vec<String> {
            vec!["x".into(), "y".into()]
        }

        fn parameter_bounds(&self) -> Vec<(f64, f64)> {
            vec![(0.0, f64::INFINITY), (f64::NEG_INFINITY, f64::INFINITY)]
        }

        fn minus_ll_grad(&self, p: &[f64], omit: &[usize]) -> Result<(f64, Vec<f64>)> {
            let (x, y) = (p[0], p[1]);
            let full = [x / 2.0 - 2.0 * (y - x), 2.0 * (y - x)];
            let grad = (0..2).filter(|i| !omit.contains(i)).map(|i| full[i]).collect();
            Ok(((x / 2.0).powi(2) + (y - x).powi(2), grad))
        }

        fn minus_ll_grad_hessian(
            &self,
            p: &[f64],
            omit: &[usize],
        ) -> Result<(f64, Vec<f64>, Vec<Vec<f64>>)> {
            let (v, g) = self.minus_ll_grad(p, omit)?;
            let full = [[2.5, -2.0], [-2.0, 2.0]];
            let keep: Vec<usize> = (0..2).filter(|i| !omit.contains(i)).collect();
            let h = keep.iter().map(|&i| keep.iter().map(|&j| full[i][j]).collect()).collect();
            Ok((v, g, h))
        }
    }

    fn problem(direction: Direction, q: f64, bound: (Option<f64>, Option<f64>)) -> IntervalProblem<'static> {
        IntervalProblem {
            model: &Correlated,
            target: 0,
            direction,
            bestfit: vec![0.0, 0.0],
            guess: None,
            fixed: vec![],
            bound,
            critical_quantile: q,
            sigma_guess: 1.0,
            critical_value: &WilksCriticalValue,
            llr_tolerance: 1e-8,
        }
    }

    #[test]
    fn test_profiled_upper_limit() {
        // profiling y = x leaves t(x) = (x / 2)^2, so the limit is 2 z_q
        let res = ProfileBisection::default().minimize(&problem(Direction::Up, 0.9, (Some(0.0), None))).unwrap();
        assert_relative_eq!(res["x"], 2.0 * 1.281_551_565_545, epsilon = 1e-3);
        assert_relative_eq!(res["y"], res["x"], epsilon = 1e-3);
    }

    #[test]
    fn test_limit_stops_at_bound() {
        let res = ProfileBisection::default()
            .minimize(&problem(Direction::Down, 0.1, (Some(0.0), Some(0.0))))
            .unwrap();
        assert_eq!(res["x"], 0.0);
    }

    #[test]
    fn test_guess_and_bad_sigma() {
        let mut p = problem(Direction::Up, 0.9, (Some(0.0), None));
        p.guess = Some(2.5);
        let res = ProfileBisection::default().minimize(&p).unwrap();
        assert_relative_eq!(res["x"], 2.563, epsilon = 1e-3);

        p.sigma_guess = 0.0;
        assert!(matches!(ProfileBisection::default().minimize(&p), Err(Error::Invocation(_))));
    }

    #[test]
    fn test_sloped_critical_value() {
        // (x / 2)^2 = 1 + x / 2  =>  x = 1 + sqrt(5)
        let cv = FnCriticalValue::new(|x, _| 1.0 + 0.5 * x, |_, _| 0.5);
        let p = IntervalProblem {
            critical_value: &cv,
            ..problem(Direction::Up, 0.9, (Some(0.0), None))
        };
        let res = ProfileBisection::default().minimize(&p).unwrap();
        assert_relative_eq!(res["x"], 1.0 + 5.0_f64.sqrt(), epsilon = 1e-3);
    }

    #[test]
    fn test_newton_step_stays_in_bracket() {
        let e = Excess { x: 2.0, f: 1.0, slope: 0.5 };
        assert_eq!(e.newton(1.0, 3.0), None);
        assert_eq!(e.newton(3.0, -1.0), Some(0.0));
        let flat = Excess { slope: 0.0, ..e };
        assert_eq!(flat.newton(-10.0, 10.0), None);
    }
}
