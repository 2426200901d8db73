//! # rf-unbinned
//!
//! Extended unbinned Poisson likelihoods for rare-event searches.
//!
//! This crate provides:
//! - A columnar [`EventTable`] and fixed-size [`Batching`] with end padding.
//! - The [`Source`] capability and a few reference sources.
//! - The [`LogLikelihood`] orchestrator: value, gradient and Hessian of
//!
//!   ```text
//!   log L = sum_datasets [ sum_events ln(sum_sources m_s * r_s(event)) - mu(dataset) ]
//!           + log_constraint(params)
//!   ```
//!
//!   with best fits and profile-likelihood intervals delegated to the objective traits of
//!   `rf-core` (implemented in `rf-inference`).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod constraint;
pub mod covariance;
pub mod differentiable;
pub mod event_store;
pub mod interp;
pub mod likelihood;
pub mod params;
pub mod source;
pub mod sources;

pub use constraint::{GaussianConstraint, LogConstraint, NoConstraint};
pub use covariance::{FitSummary, SummaryEntry, cov_to_std, invert_symmetric};
pub use differentiable::{Differentiator, Evaluation, FiniteDifference, Order, ReverseMode, TapeFunction};
pub use event_store::{BatchedEvents, Batching, EventTable};
pub use interp::{MuAxis, MuInterpolator};
pub use likelihood::{
    BestfitOptions, BestfitResult, DEFAULT_DATASET, DataUpdate, EvalOptions, IntervalGuess,
    IntervalOptions, LikelihoodBuilder, LikelihoodConfig, LikelihoodValue, LogLikelihood,
    SummaryOptions,
};
pub use params::{ParamSet, ParameterRegistry};
pub use source::{DataSettings, ParamValues, Source, Truth};
pub use sources::{AcceptanceWrapper, ExponentialSource, FlatSource, GaussianSource};
