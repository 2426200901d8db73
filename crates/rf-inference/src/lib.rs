//! # rf-inference
//!
//! Objective strategies for rarefit likelihoods.
//!
//! This crate provides:
//! - [`LbfgsBestfit`]: maximum-likelihood fits via L-BFGS (argmin).
//! - [`ProfileBisection`]: one-sided profile-likelihood limits.
//!
//! Both see a likelihood only through [`rf_core::LikelihoodModel`].

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Maximum-likelihood fits.
pub mod bestfit;
/// Profile-likelihood limit search.
pub mod interval;
/// Generic numerical minimizer (L-BFGS backend).
pub mod optimizer;

pub use bestfit::{LbfgsBestfit, covariance_from_hessian};
pub use interval::{IntervalSearchConfig, ProfileBisection};
pub use optimizer::{
    FreeParamObjective, LbfgsMinimizer, MinimizerConfig, ObjectiveFunction, OptimizationResult,
};
