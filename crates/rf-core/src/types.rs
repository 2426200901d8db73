//! Common data types for rarefit

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Floor for `<source>_rate_multiplier` parameters in fits and lower-limit searches.
pub const LOWER_RATE_MULTIPLIER_BOUND: f64 = 1e-9;

/// Suffix of the per-source rate multiplier parameters.
pub const RATE_MULTIPLIER_SUFFIX: &str = "_rate_multiplier";

/// Name of the rate multiplier parameter for `source`.
pub fn rate_multiplier_name(source: &str) -> String {
    format!("{source}{RATE_MULTIPLIER_SUFFIX}")
}

/// Whether `name` is a rate multiplier parameter.
pub fn is_rate_multiplier(name: &str) -> bool {
    name.ends_with(RATE_MULTIPLIER_SUFFIX)
}

/// Declaration of a shared physics parameter: `(min, max, anchors)`.
///
/// The range and anchor count define the regular grid on which expected-rate
/// interpolators are tabulated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Lowest anchor.
    pub min: f64,
    /// Highest anchor.
    pub max: f64,
    /// Number of anchors (>= 2).
    pub anchors: usize,
}

impl ParamSpec {
    /// Create a new parameter specification.
    pub fn new(min: f64, max: f64, anchors: usize) -> Self {
        Self { min, max, anchors }
    }

    /// Check the range and the anchor count.
    pub fn validate(&self, name: &str) -> Result<()> {
        if !(self.min.is_finite() && self.max.is_finite()) || self.min >= self.max {
            return Err(Error::Config(format!(
                "parameter '{name}': expected finite min < max, got ({}, {})",
                self.min, self.max
            )));
        }
        if self.anchors < 2 {
            return Err(Error::Config(format!(
                "parameter '{name}': need at least 2 anchors, got {}",
                self.anchors
            )));
        }
        Ok(())
    }

    /// Anchor positions, evenly spaced from `min` to `max` inclusive.
    pub fn anchor_values(&self) -> Vec<f64> {
        let n = self.anchors.max(2);
        let step = (self.max - self.min) / (n - 1) as f64;
        (0..n).map(|i| if i == n - 1 { self.max } else { self.min + step * i as f64 }).collect()
    }
}

/// Kind of one-parameter interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalKind {
    /// One-sided upper limit.
    Upper,
    /// One-sided lower limit.
    Lower,
    /// Two-sided central interval.
    Central,
}

impl FromStr for IntervalKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upper" => Ok(Self::Upper),
            "lower" => Ok(Self::Lower),
            "central" => Ok(Self::Central),
            other => Err(Error::Invocation(format!(
                "kind must be upper/lower/central but is {other}"
            ))),
        }
    }
}

impl fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Upper => "upper",
            Self::Lower => "lower",
            Self::Central => "central",
        };
        f.write_str(s)
    }
}

/// Search direction of a one-sided limit relative to the best fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards larger parameter values.
    Up,
    /// Towards smaller parameter values.
    Down,
}

impl Direction {
    /// `+1.0` or `-1.0`.
    pub fn sign(self) -> f64 {
        match self {
            Self::Up => 1.0,
            Self::Down => -1.0,
        }
    }
}

/// Result of a one-parameter interval search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Interval {
    /// Upper limit.
    Upper {
        /// Limit value.
        limit: f64,
    },
    /// Lower limit.
    Lower {
        /// Limit value.
        limit: f64,
    },
    /// Central interval `(low, high)`.
    Central {
        /// Lower end.
        low: f64,
        /// Upper end.
        high: f64,
    },
}

impl Interval {
    /// `(low, high)` with open ends as infinities.
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Self::Upper { limit } => (f64::NEG_INFINITY, limit),
            Self::Lower { limit } => (limit, f64::INFINITY),
            Self::Central { low, high } => (low, high),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_interval_kind_parse() {
        assert_eq!("upper".parse::<IntervalKind>().unwrap(), IntervalKind::Upper);
        assert_eq!("central".parse::<IntervalKind>().unwrap(), IntervalKind::Central);
        let err = "sideways".parse::<IntervalKind>().unwrap_err();
        assert!(matches!(err, Error::Invocation(_)), "got {err:?}");
    }

    #[test]
    fn test_param_spec_anchors() {
        let spec = ParamSpec::new(-1.0, 1.0, 5);
        spec.validate("x").unwrap();
        let a = spec.anchor_values();
        assert_eq!(a.len(), 5);
        assert_relative_eq!(a[0], -1.0);
        assert_relative_eq!(a[2], 0.0, epsilon = 1e-15);
        assert_eq!(a[4], 1.0);
    }

    #[test]
    fn test_param_spec_rejects_bad_ranges() {
        assert!(ParamSpec::new(1.0, 1.0, 3).validate("x").is_err());
        assert!(ParamSpec::new(0.0, 1.0, 1).validate("x").is_err());
        assert!(ParamSpec::new(f64::NAN, 1.0, 3).validate("x").is_err());
    }

    #[test]
    fn test_rate_multiplier_names() {
        let n = rate_multiplier_name("sig");
        assert_eq!(n, "sig_rate_multiplier");
        assert!(is_rate_multiplier(&n));
        assert!(!is_rate_multiplier("sig_mean"));
    }

    #[test]
    fn test_interval_bounds() {
        assert_eq!(Interval::Upper { limit: 3.0 }.bounds(), (f64::NEG_INFINITY, 3.0));
        assert_eq!(Interval::Central { low: 1.0, high: 2.0 }.bounds(), (1.0, 2.0));
    }
}
