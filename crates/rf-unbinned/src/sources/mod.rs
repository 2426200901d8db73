//! Reference sources.
//!
//! Small analytic models used by tests, benchmarks and the toy command line driver. Each
//! keeps its attached data as [`BatchedEvents`] and records rates row by row on the tape.

use crate::event_store::{BatchedEvents, EventTable};
use crate::source::Truth;
use rf_core::{Error, Result};

mod acceptance;
mod exponential;
mod flat;
mod gaussian;

pub use acceptance::AcceptanceWrapper;
pub use exponential::ExponentialSource;
pub use flat::FlatSource;
pub use gaussian::GaussianSource;

fn check_n_expected(kind: &str, n_expected: f64) -> Result<()> {
    if !(n_expected.is_finite() && n_expected >= 0.0) {
        return Err(Error::Config(format!(
            "{kind} expects a finite n_expected >= 0, got {n_expected}"
        )));
    }
    Ok(())
}

fn check_window(kind: &str, lo: f64, hi: f64) -> Result<()> {
    if !(lo.is_finite() && hi.is_finite() && lo < hi) {
        return Err(Error::Config(format!("{kind} expects a finite window lo < hi, got ({lo}, {hi})")));
    }
    Ok(())
}

fn batched<'a>(source: &'a Option<BatchedEvents>, kind: &str) -> Result<&'a BatchedEvents> {
    source.as_ref().ok_or_else(|| Error::Validation(format!("{kind} has no data attached")))
}

// `n` draws of the observable, or `n` copies of its fixed true value.
fn observable_column(
    observable: &str,
    n: usize,
    fix_truth: Option<&Truth>,
    mut draw: impl FnMut() -> f64,
) -> Result<EventTable> {
    let col = match fix_truth.and_then(|t| t.get(observable)) {
        Some(&x) => vec![x; n],
        None => (0..n).map(|_| draw()).collect(),
    };
    EventTable::from_columns([(observable.to_string(), col)])
}
