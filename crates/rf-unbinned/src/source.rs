//! The source capability: what the likelihood needs from a physics model.

use crate::event_store::{Batching, EventTable};
use crate::interp::{MuAxis, MuInterpolator};
use rand::RngCore;
use rf_ad::{Tape, Var};
use rf_core::{Error, ParamSpec, Result};
use std::collections::BTreeMap;

/// Named parameter values handed to a source.
///
/// Keys are the names in the source's [`Source::defaults`]; parameters the likelihood does
/// not expose keep their default values.
pub type ParamValues<T> = BTreeMap<String, T>;

/// Observable values to hold fixed when simulating.
pub type Truth = BTreeMap<String, f64>;

/// Look up parameter `name`.
pub fn param<T: Copy>(params: &ParamValues<T>, name: &str) -> Result<T> {
    params
        .get(name)
        .copied()
        .ok_or_else(|| Error::Validation(format!("missing source parameter '{name}'")))
}

/// Settings forwarded to sources when data is attached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataSettings {
    /// Events per batch.
    pub batch_size: usize,
    /// Width, in standard deviations, of the region a source needs to cover per event.
    pub max_sigma: f64,
}

/// A physics model producing expected differential rates for events.
///
/// One source belongs to one dataset. Detector effects are layered on by wrapping a source
/// (see [`crate::sources::AcceptanceWrapper`]) rather than by subclassing.
pub trait Source: Send + Sync {
    /// Every parameter the source understands, with its default value.
    fn defaults(&self) -> &ParamValues<f64>;

    /// Attach (or replace) the events and recompute the batching.
    fn set_data(&mut self, data: &EventTable, settings: &DataSettings) -> Result<()>;

    /// Batching of the attached data, `None` before [`set_data`](Source::set_data).
    fn batching(&self) -> Option<Batching>;

    /// Record the differential rate of every row of batch `i_batch`.
    ///
    /// Must return `batch_size` values, padding rows included.
    fn differential_rate(
        &self,
        tape: &mut Tape,
        i_batch: usize,
        params: &ParamValues<Var>,
    ) -> Result<Vec<Var>>;

    /// Expected number of events before detection efficiencies.
    fn mu_before_efficiencies(&self, params: &ParamValues<f64>) -> Result<f64>;

    /// Simulate `n_events` true events and return those surviving detection.
    fn simulate(
        &self,
        n_events: usize,
        fix_truth: Option<&Truth>,
        params: &ParamValues<f64>,
        rng: &mut dyn RngCore,
    ) -> Result<EventTable>;

    /// Monte Carlo estimate of the expected number of detected events.
    ///
    /// `mu_before_efficiencies` times the fraction of `n_trials` simulated events surviving.
    fn estimate_mu(
        &self,
        params: &ParamValues<f64>,
        n_trials: usize,
        rng: &mut dyn RngCore,
    ) -> Result<f64> {
        if n_trials == 0 {
            return Err(Error::Config("n_trials must be positive".into()));
        }
        let mu = self.mu_before_efficiencies(params)?;
        let accepted = self.simulate(n_trials, None, params, rng)?.n_events();
        Ok(mu * accepted as f64 / n_trials as f64)
    }

    /// Build the expected-rate interpolator over the shared parameters in `specs`.
    ///
    /// One estimate at the defaults, plus one per anchor of each parameter varied alone.
    fn mu_function(
        &self,
        n_trials: usize,
        specs: &[(String, ParamSpec)],
        rng: &mut dyn RngCore,
    ) -> Result<MuInterpolator> {
        let defaults = self.defaults().clone();
        let base = self.estimate_mu(&defaults, n_trials, &mut *rng)?;
        let mut axes = Vec::with_capacity(specs.len());
        for (name, spec) in specs {
            if !defaults.contains_key(name) {
                return Err(Error::Config(format!("source does not recognize parameter '{name}'")));
            }
            let anchors = spec.anchor_values();
            let mut values = Vec::with_capacity(anchors.len());
            for &a in &anchors {
                let mut p = defaults.clone();
                p.insert(name.clone(), a);
                values.push(self.estimate_mu(&p, n_trials, &mut *rng)?);
            }
            log::debug!("mu anchors for '{name}': {values:?} (base {base})");
            axes.push(MuAxis::new(name.clone(), anchors, values)?);
        }
        Ok(MuInterpolator::new(base, axes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::GaussianSource;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_param_lookup() {
        let mut p = ParamValues::new();
        p.insert("a".to_string(), 1.5);
        assert_eq!(param(&p, "a").unwrap(), 1.5);
        assert!(matches!(param(&p, "b"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_estimate_mu_without_efficiencies_is_exact() {
        let src = GaussianSource::new("x", 7.0, 0.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mu = src.estimate_mu(src.defaults(), 1000, &mut rng).unwrap();
        assert_relative_eq!(mu, 7.0);
        assert!(matches!(src.estimate_mu(src.defaults(), 0, &mut rng), Err(Error::Config(_))));
    }

    #[test]
    fn test_mu_function_rejects_unknown_parameter() {
        let src = GaussianSource::new("x", 7.0, 0.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let specs = vec![("elephant".to_string(), ParamSpec::new(0.0, 1.0, 3))];
        assert!(src.mu_function(100, &specs, &mut rng).is_err());
    }
}
