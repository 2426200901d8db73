//! Differentiation layer: value, gradient and Hessian of a recorded function.
//!
//! The likelihood only describes *what* to compute ([`TapeFunction`]); a [`Differentiator`]
//! decides how derivatives are obtained. [`ReverseMode`] differentiates the tape directly,
//! [`FiniteDifference`] re-records the function at shifted points and is kept for
//! cross-checks.

use rf_ad::{Tape, Var};
use rf_core::{Error, Result};

/// A scalar function that can be recorded on a [`Tape`].
pub trait TapeFunction {
    /// Record the function of `inputs` (one node per parameter, registry order).
    fn record(&self, tape: &mut Tape, inputs: &[Var]) -> Result<Var>;
}

/// Highest derivative order requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Value and gradient.
    First,
    /// Value, gradient and Hessian.
    Second,
}

/// Result of one differentiated evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Function value.
    pub value: f64,
    /// Gradient over the active parameters.
    pub gradient: Vec<f64>,
    /// Hessian over the active parameters, for [`Order::Second`].
    pub hessian: Option<Vec<Vec<f64>>>,
}

impl Evaluation {
    /// Zero value and derivatives for `n_active` parameters.
    pub fn zeros(n_active: usize, order: Order) -> Self {
        Self {
            value: 0.0,
            gradient: vec![0.0; n_active],
            hessian: (order == Order::Second).then(|| vec![vec![0.0; n_active]; n_active]),
        }
    }

    /// Add `other` term by term.
    pub fn accumulate(&mut self, other: &Evaluation) -> Result<()> {
        if other.gradient.len() != self.gradient.len() {
            return Err(Error::Computation(format!(
                "gradient length mismatch: {} vs {}",
                self.gradient.len(),
                other.gradient.len()
            )));
        }
        self.value += other.value;
        for (g, o) in self.gradient.iter_mut().zip(&other.gradient) {
            *g += o;
        }
        if let (Some(h), Some(o)) = (&mut self.hessian, &other.hessian) {
            for (row, orow) in h.iter_mut().zip(o) {
                for (x, y) in row.iter_mut().zip(orow) {
                    *x += y;
                }
            }
        }
        Ok(())
    }

    /// Multiply value and derivatives by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.value *= factor;
        self.gradient.iter_mut().for_each(|g| *g *= factor);
        if let Some(h) = &mut self.hessian {
            h.iter_mut().flatten().for_each(|x| *x *= factor);
        }
    }
}

/// Strategy computing derivatives of a [`TapeFunction`].
pub trait Differentiator: Send + Sync {
    /// Evaluate `f` at `params`, differentiating w.r.t. the parameters in `active`.
    ///
    /// Parameters outside `active` enter the value but not the derivatives.
    fn evaluate(
        &self,
        f: &dyn TapeFunction,
        params: &[f64],
        active: &[usize],
        order: Order,
    ) -> Result<Evaluation>;

    /// Backend name.
    fn name(&self) -> &str;
}

fn check_active(params: &[f64], active: &[usize]) -> Result<()> {
    match active.iter().find(|&&i| i >= params.len()) {
        Some(i) => Err(Error::Invocation(format!(
            "active parameter index {i} out of range ({} parameters)",
            params.len()
        ))),
        None => Ok(()),
    }
}

/// Reverse-mode tape differentiation with forward-over-reverse Hessians.
///
/// Every call records on a fresh tape that is dropped before returning.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseMode;

impl Differentiator for ReverseMode {
    fn evaluate(
        &self,
        f: &dyn TapeFunction,
        params: &[f64],
        active: &[usize],
        order: Order,
    ) -> Result<Evaluation> {
        check_active(params, active)?;
        let mut tape = Tape::with_capacity(256);
        let inputs: Vec<Var> = params
            .iter()
            .enumerate()
            .map(|(i, &p)| if active.contains(&i) { tape.var(p) } else { tape.constant(p) })
            .collect();
        let out = f.record(&mut tape, &inputs)?;
        let value = tape.val(out);
        let active_vars: Vec<Var> = active.iter().map(|&i| inputs[i]).collect();

        let (gradient, hessian) = match order {
            Order::First => (tape.gradient(out, &active_vars), None),
            Order::Second => {
                let h = tape.hessian(out, &active_vars);
                let g = active_vars.iter().map(|&v| tape.adjoint(v)).collect();
                (g, Some(h))
            }
        };
        Ok(Evaluation { value, gradient, hessian })
    }

    fn name(&self) -> &str {
        "reverse-mode"
    }
}

/// Central finite differences on recorded values.
#[derive(Debug, Clone, Copy)]
pub struct FiniteDifference {
    /// Relative step for gradients.
    pub step: f64,
    /// Relative step for Hessians.
    pub hessian_step: f64,
}

impl Default for FiniteDifference {
    fn default() -> Self {
        Self { step: 1e-6, hessian_step: 1e-4 }
    }
}

impl FiniteDifference {
    fn value(f: &dyn TapeFunction, params: &[f64]) -> Result<f64> {
        let mut tape = Tape::new();
        let inputs: Vec<Var> = params.iter().map(|&p| tape.constant(p)).collect();
        let out = f.record(&mut tape, &inputs)?;
        Ok(tape.val(out))
    }

    fn shifted(
        f: &dyn TapeFunction,
        params: &[f64],
        shifts: &[(usize, f64)],
    ) -> Result<f64> {
        let mut p = params.to_vec();
        for &(i, d) in shifts {
            p[i] += d;
        }
        Self::value(f, &p)
    }
}

impl Differentiator for FiniteDifference {
    fn evaluate(
        &self,
        f: &dyn TapeFunction,
        params: &[f64],
        active: &[usize],
        order: Order,
    ) -> Result<Evaluation> {
        check_active(params, active)?;
        let value = Self::value(f, params)?;

        let mut gradient = Vec::with_capacity(active.len());
        for &i in active {
            let h = self.step * params[i].abs().max(1.0);
            let up = Self::shifted(f, params, &[(i, h)])?;
            let down = Self::shifted(f, params, &[(i, -h)])?;
            gradient.push((up - down) / (2.0 * h));
        }

        let hessian = match order {
            Order::First => None,
            Order::Second => {
                let k = active.len();
                let steps: Vec<f64> =
                    active.iter().map(|&i| self.hessian_step * params[i].abs().max(1.0)).collect();
                let mut h = vec![vec![0.0; k]; k];
                for a in 0..k {
                    let (i, hi) = (active[a], steps[a]);
                    let up = Self::shifted(f, params, &[(i, hi)])?;
                    let down = Self::shifted(f, params, &[(i, -hi)])?;
                    h[a][a] = (up - 2.0 * value + down) / (hi * hi);
                    for b in (a + 1)..k {
                        let (j, hj) = (active[b], steps[b]);
                        let pp = Self::shifted(f, params, &[(i, hi), (j, hj)])?;
                        let pm = Self::shifted(f, params, &[(i, hi), (j, -hj)])?;
                        let mp = Self::shifted(f, params, &[(i, -hi), (j, hj)])?;
                        let mm = Self::shifted(f, params, &[(i, -hi), (j, -hj)])?;
                        let v = (pp - pm - mp + mm) / (4.0 * hi * hj);
                        h[a][b] = v;
                        h[b][a] = v;
                    }
                }
                Some(h)
            }
        };
        Ok(Evaluation { value, gradient, hessian })
    }

    fn name(&self) -> &str {
        "finite-difference"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(a, b, c) = a^2 b + ln(c) b
    struct Poly;

    impl TapeFunction for Poly {
        fn record(&self, tape: &mut Tape, x: &[Var]) -> Result<Var> {
            let a2 = tape.powi(x[0], 2);
            let a2b = tape.mul(a2, x[1]);
            let lc = tape.ln(x[2]);
            let lcb = tape.mul(lc, x[1]);
            Ok(tape.add(a2b, lcb))
        }
    }

    #[test]
    fn test_reverse_mode_subset() {
        let p = [2.0, 3.0, 4.0];
        let e = ReverseMode.evaluate(&Poly, &p, &[0, 2], Order::Second).unwrap();
        assert_relative_eq!(e.value, 12.0 + 4.0_f64.ln() * 3.0, epsilon = 1e-12);
        assert_relative_eq!(e.gradient[0], 12.0, epsilon = 1e-12);
        assert_relative_eq!(e.gradient[1], 0.75, epsilon = 1e-12);
        let h = e.hessian.unwrap();
        assert_relative_eq!(h[0][0], 6.0, epsilon = 1e-12);
        assert_relative_eq!(h[0][1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(h[1][1], -3.0 / 16.0, epsilon = 1e-12);

        let first = ReverseMode.evaluate(&Poly, &p, &[1], Order::First).unwrap();
        assert!(first.hessian.is_none());
        assert_relative_eq!(first.gradient[0], 4.0 + 4.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_backends_agree() {
        let p = [0.7, -1.3, 2.5];
        let active = [0, 1, 2];
        let r = ReverseMode.evaluate(&Poly, &p, &active, Order::Second).unwrap();
        let f = FiniteDifference::default().evaluate(&Poly, &p, &active, Order::Second).unwrap();
        assert_relative_eq!(r.value, f.value, epsilon = 1e-12);
        for k in 0..3 {
            assert_relative_eq!(r.gradient[k], f.gradient[k], epsilon = 1e-6);
        }
        let (rh, fh) = (r.hessian.unwrap(), f.hessian.unwrap());
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(rh[i][j], fh[i][j], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_active_index_out_of_range() {
        let err = ReverseMode.evaluate(&Poly, &[1.0, 1.0, 1.0], &[3], Order::First).unwrap_err();
        assert!(matches!(err, Error::Invocation(_)));
    }

    #[test]
    fn test_accumulate_and_scale() {
        let mut acc = Evaluation::zeros(2, Order::Second);
        let term = Evaluation {
            value: 1.0,
            gradient: vec![2.0, 3.0],
            hessian: Some(vec![vec![1.0, 0.5], vec![0.5, 2.0]]),
        };
        acc.accumulate(&term).unwrap();
        acc.accumulate(&term).unwrap();
        acc.scale(-2.0);
        assert_eq!(acc.value, -4.0);
        assert_eq!(acc.gradient, vec![-8.0, -12.0]);
        assert_eq!(acc.hessian.unwrap()[1], vec![-2.0, -8.0]);
        let bad = Evaluation::zeros(3, Order::First);
        assert!(Evaluation::zeros(2, Order::First).accumulate(&bad).is_err());
    }
}
