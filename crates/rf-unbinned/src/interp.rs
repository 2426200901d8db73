//! Expected-rate interpolation over shared parameters ("star" interpolation).
//!
//! The expected number of events is tabulated once at construction: at the default point,
//! and along a regular grid for each shared parameter varied alone. At evaluation time
//!
//! ```text
//! mu(params) = base * prod_p itp_p(x_p) / base
//! ```
//!
//! where `itp_p` is piecewise linear on the grid and constant outside it.

use crate::source::ParamValues;
use rf_ad::{Tape, Var};
use rf_core::{Error, Result};

/// Tabulated expected rate along one parameter.
#[derive(Debug, Clone)]
pub struct MuAxis {
    name: String,
    anchors: Vec<f64>,
    values: Vec<f64>,
}

impl MuAxis {
    /// Axis over strictly increasing `anchors` with one value each.
    pub fn new(name: String, anchors: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        if anchors.len() < 2 || anchors.len() != values.len() {
            return Err(Error::Config(format!(
                "parameter '{name}': need >= 2 anchors with one value each, got {} anchors and {} values",
                anchors.len(),
                values.len()
            )));
        }
        if !anchors.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::Config(format!("parameter '{name}': anchors must increase")));
        }
        Ok(Self { name, anchors, values })
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    // Index k of the segment [a_k, a_{k+1}] containing x, or None outside the grid.
    fn segment(&self, x: f64) -> Option<usize> {
        let last = self.anchors.len() - 1;
        if !(x >= self.anchors[0] && x <= self.anchors[last]) {
            return None;
        }
        let k = self.anchors.partition_point(|&a| a <= x).saturating_sub(1);
        Some(k.min(last - 1))
    }

    fn edge_value(&self, x: f64) -> f64 {
        if x < self.anchors[0] { self.values[0] } else { self.values[self.values.len() - 1] }
    }

    /// Interpolated value at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        match self.segment(x) {
            None => self.edge_value(x),
            Some(k) => {
                let (a0, a1) = (self.anchors[k], self.anchors[k + 1]);
                let (y0, y1) = (self.values[k], self.values[k + 1]);
                y0 + (y1 - y0) * (x - a0) / (a1 - a0)
            }
        }
    }

    /// Record the interpolated value at `x`.
    pub fn record(&self, tape: &mut Tape, x: Var) -> Var {
        let xv = tape.val(x);
        match self.segment(xv) {
            None => tape.constant(self.edge_value(xv)),
            Some(k) => {
                let (a0, a1) = (self.anchors[k], self.anchors[k + 1]);
                let (y0, y1) = (self.values[k], self.values[k + 1]);
                let dx = tape.add_f64(x, -a0);
                let rise = tape.mul_f64(dx, (y1 - y0) / (a1 - a0));
                tape.add_f64(rise, y0)
            }
        }
    }
}

/// Expected number of detected events as a function of the shared parameters.
#[derive(Debug, Clone)]
pub struct MuInterpolator {
    base: f64,
    axes: Vec<MuAxis>,
}

impl MuInterpolator {
    /// Interpolator with default-point estimate `base`.
    pub fn new(base: f64, axes: Vec<MuAxis>) -> Self {
        Self { base, axes }
    }

    /// Interpolator for a source without shared parameters.
    pub fn constant(base: f64) -> Self {
        Self { base, axes: Vec::new() }
    }

    /// Expected events at the default point.
    pub fn base(&self) -> f64 {
        self.base
    }

    /// Tabulated axes.
    pub fn axes(&self) -> &[MuAxis] {
        &self.axes
    }

    /// Evaluate on plain values. A zero `base` yields zero everywhere.
    pub fn eval(&self, params: &ParamValues<f64>) -> Result<f64> {
        if self.base == 0.0 {
            return Ok(0.0);
        }
        let mut mu = self.base;
        for axis in &self.axes {
            mu *= axis.eval(crate::source::param(params, axis.name())?) / self.base;
        }
        Ok(mu)
    }

    /// Record on the tape.
    pub fn record(&self, tape: &mut Tape, params: &ParamValues<Var>) -> Result<Var> {
        let mut mu = tape.constant(self.base);
        if self.base == 0.0 {
            return Ok(mu);
        }
        for axis in &self.axes {
            let x = crate::source::param(params, axis.name())?;
            let itp = axis.record(tape, x);
            let ratio = tape.div_f64(itp, self.base);
            mu = tape.mul(mu, ratio);
        }
        Ok(mu)
    }
}
