//! # rf-ad
//!
//! Automatic differentiation for rarefit likelihoods.
//!
//! A [`Tape`] records the computation once; gradients come from one reverse sweep and
//! Hessians from one forward-tangent plus reverse sweep per input (forward-over-reverse),
//! all replayed on the same recorded graph.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod tape;

pub use tape::{Tape, Var};
