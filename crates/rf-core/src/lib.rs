//! # rf-core
//!
//! Core types, traits and errors shared by the rarefit crates.
//!
//! - [`Error`] / [`Result`]: the error taxonomy used across the workspace.
//! - [`traits::LikelihoodModel`]: what objective strategies see of a likelihood.
//! - [`traits::BestfitObjective`] / [`traits::IntervalObjective`]: pluggable minimizers.
//! - [`traits::CriticalValue`]: critical value of the profile test statistic.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod error;
pub mod traits;
pub mod types;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use traits::{
    BestfitObjective, BestfitProblem, CriticalValue, FnCriticalValue, IntervalObjective,
    IntervalProblem, LikelihoodModel, WilksCriticalValue,
};
pub use types::{
    Direction, Interval, IntervalKind, LOWER_RATE_MULTIPLIER_BOUND, ParamSpec,
    RATE_MULTIPLIER_SUFFIX, is_rate_multiplier, rate_multiplier_name,
};
