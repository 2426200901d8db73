//! Log-constraint terms added once per likelihood evaluation.

use crate::source::{ParamValues, param};
use rf_ad::{Tape, Var};
use rf_core::{Error, Result};

/// Additive `log` penalty on the likelihood's parameters.
pub trait LogConstraint: Send + Sync {
    /// Parameters the constraint reads; each must exist in the registry.
    fn parameters(&self) -> Vec<String>;

    /// Record the log-constraint for the named parameter values.
    fn record(&self, tape: &mut Tape, params: &ParamValues<Var>) -> Result<Var>;
}

/// The identity constraint: contributes exactly zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConstraint;

impl LogConstraint for NoConstraint {
    fn parameters(&self) -> Vec<String> {
        Vec::new()
    }

    fn record(&self, tape: &mut Tape, _params: &ParamValues<Var>) -> Result<Var> {
        Ok(tape.constant(0.0))
    }
}

/// Independent Gaussian penalties `-0.5 ((x - mean) / sigma)^2`.
#[derive(Debug, Clone, Default)]
pub struct GaussianConstraint {
    terms: Vec<(String, f64, f64)>,
}

impl GaussianConstraint {
    /// Empty constraint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a penalty on `name`.
    pub fn with(mut self, name: &str, mean: f64, sigma: f64) -> Result<Self> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(Error::Config(format!(
                "Gaussian constraint on '{name}' requires sigma > 0, got {sigma}"
            )));
        }
        if !mean.is_finite() {
            return Err(Error::Config(format!(
                "Gaussian constraint on '{name}' requires a finite mean, got {mean}"
            )));
        }
        self.terms.push((name.to_string(), mean, sigma));
        Ok(self)
    }
}

impl LogConstraint for GaussianConstraint {
    fn parameters(&self) -> Vec<String> {
        self.terms.iter().map(|(n, _, _)| n.clone()).collect()
    }

    fn record(&self, tape: &mut Tape, params: &ParamValues<Var>) -> Result<Var> {
        let mut pulls = Vec::with_capacity(self.terms.len());
        for (name, mean, sigma) in &self.terms {
            let x = param(params, name)?;
            let d = tape.add_f64(x, -mean);
            let z = tape.div_f64(d, *sigma);
            let z2 = tape.powi(z, 2);
            pulls.push(tape.mul_f64(z2, -0.5));
        }
        Ok(tape.sum(&pulls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_no_constraint_is_zero() {
        let mut tape = Tape::new();
        let v = NoConstraint.record(&mut tape, &ParamValues::new()).unwrap();
        assert_eq!(tape.val(v), 0.0);
        assert!(NoConstraint.parameters().is_empty());
    }

    #[test]
    fn test_gaussian_constraint_value_and_gradient() {
        let c = GaussianConstraint::new().with("a", 1.0, 2.0).unwrap();
        assert_eq!(c.parameters(), vec!["a".to_string()]);
        let mut tape = Tape::new();
        let a = tape.var(2.0);
        let vars: ParamValues<Var> = [("a".to_string(), a)].into();
        let v = c.record(&mut tape, &vars).unwrap();
        assert_relative_eq!(tape.val(v), -0.125, epsilon = 1e-15);
        assert_relative_eq!(tape.gradient(v, &[a])[0], -0.25, epsilon = 1e-15);
        assert!(GaussianConstraint::new().with("a", 0.0, 0.0).is_err());
    }
}
