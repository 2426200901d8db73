//! Covariance helpers and the fit summary.

use nalgebra::DMatrix;
use rf_core::{Error, Result};
use std::fmt;

/// Standard errors and correlation matrix of a covariance matrix.
///
/// Fails on a non-square matrix or a non-positive (or non-finite) variance.
pub fn cov_to_std(cov: &DMatrix<f64>) -> Result<(Vec<f64>, DMatrix<f64>)> {
    if !cov.is_square() {
        return Err(Error::Validation(format!(
            "covariance must be square, got {}x{}",
            cov.nrows(),
            cov.ncols()
        )));
    }
    let n = cov.nrows();
    let mut std_errs = Vec::with_capacity(n);
    for i in 0..n {
        let v = cov[(i, i)];
        if !(v.is_finite() && v > 0.0) {
            return Err(Error::Computation(format!(
                "non-positive variance {v} at index {i} of the covariance matrix"
            )));
        }
        std_errs.push(v.sqrt());
    }
    let corr = DMatrix::from_fn(n, n, |i, j| cov[(i, j)] / (std_errs[i] * std_errs[j]));
    Ok((std_errs, corr))
}

/// Invert a symmetric matrix: Cholesky when positive definite, LU otherwise.
pub fn invert_symmetric(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let n = m.nrows();
    if n == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }
    if let Some(chol) = nalgebra::linalg::Cholesky::new(m.clone()) {
        return Ok(chol.inverse());
    }
    log::debug!("matrix is not positive definite, falling back to LU inversion");
    m.clone()
        .lu()
        .try_inverse()
        .ok_or_else(|| Error::Computation("singular Hessian, cannot invert".into()))
}

/// Format `x` with `precision` significant digits, like C's `%g`.
pub fn format_g(x: f64, precision: usize) -> String {
    let p = precision.max(1);
    if x == 0.0 || !x.is_finite() {
        return format!("{x}");
    }
    let exp = x.abs().log10().floor() as i32;
    if exp < -4 || exp >= p as i32 {
        let s = format!("{:.*e}", p - 1, x);
        // trim zeros in the mantissa
        match s.split_once('e') {
            Some((m, e)) if m.contains('.') => {
                format!("{}e{e}", m.trim_end_matches('0').trim_end_matches('.'))
            }
            _ => s,
        }
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, x);
        if s.contains('.') { s.trim_end_matches('0').trim_end_matches('.').to_string() } else { s }
    }
}

/// One row of a [`FitSummary`].
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEntry {
    /// Parameter name.
    pub name: String,
    /// Best-fit (or fixed) value.
    pub value: f64,
    /// Standard error; `None` for fixed parameters.
    pub error: Option<f64>,
}

/// Best-fit values, standard errors and correlations.
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub(crate) entries: Vec<SummaryEntry>,
    pub(crate) free: Vec<String>,
    pub(crate) correlation: DMatrix<f64>,
    pub(crate) precision: usize,
}

impl FitSummary {
    /// Rows in registry order.
    pub fn entries(&self) -> &[SummaryEntry] {
        &self.entries
    }

    /// Names of the free parameters, in correlation-matrix order.
    pub fn free_parameters(&self) -> &[String] {
        &self.free
    }

    /// Correlation matrix of the free parameters.
    pub fn correlation(&self) -> &DMatrix<f64> {
        &self.correlation
    }

    /// Standard error of `name`, if it was free.
    pub fn error(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|e| e.name == name).and_then(|e| e.error)
    }
}

impl fmt::Display for FitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.precision;
        for e in &self.entries {
            match e.error {
                Some(err) => {
                    writeln!(f, "{}: {} +- {}", e.name, format_g(e.value, p), format_g(err, p))?
                }
                None => writeln!(f, "{}: {} (fixed)", e.name, format_g(e.value, p))?,
            }
        }
        writeln!(f, "Correlation matrix:")?;
        let width = self.free.iter().map(String::len).max().unwrap_or(0).max(p + 4);
        write!(f, "{:width$}", "")?;
        for name in &self.free {
            write!(f, " {name:>width$}")?;
        }
        writeln!(f)?;
        for (i, row_name) in self.free.iter().enumerate() {
            write!(f, "{row_name:width$}")?;
            for j in 0..self.free.len() {
                write!(f, " {:>width$}", format_g(self.correlation[(i, j)], p))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
