use crate::event_store::{BatchedEvents, Batching, EventTable};
use crate::source::{DataSettings, ParamValues, Source, Truth};
use rand::RngCore;
use rand::distr::{Distribution, Uniform};
use rf_ad::{Tape, Var};
use rf_core::{Error, Result};

const EFFICIENCY_COLUMN: &str = "efficiency";

/// Per-event detection efficiency layered on another source.
///
/// The efficiency is a tabulated curve in one observable, interpolated linearly and held
/// at the end values outside the table. Rates are multiplied by it; simulated events are
/// kept with probability equal to it. The expected count before efficiencies is the inner
/// source's, so the acceptance enters the expected rate only through the Monte Carlo
/// estimate.
#[derive(Debug, Clone)]
pub struct AcceptanceWrapper<S> {
    inner: S,
    observable: String,
    curve_x: Vec<f64>,
    curve_eff: Vec<f64>,
    check_efficiencies: bool,
    efficiencies: Option<BatchedEvents>,
}

impl<S: Source> AcceptanceWrapper<S> {
    /// Wrap `inner` with the curve `(curve_x, curve_eff)` in `observable`.
    pub fn new(inner: S, observable: &str, curve_x: Vec<f64>, curve_eff: Vec<f64>) -> Result<Self> {
        if curve_x.is_empty() || curve_x.len() != curve_eff.len() {
            return Err(Error::Config(format!(
                "acceptance curve needs matching non-empty tables, got {} x values and {} efficiencies",
                curve_x.len(),
                curve_eff.len()
            )));
        }
        if !curve_x.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::Config("acceptance curve x values must increase".into()));
        }
        if let Some(e) = curve_eff.iter().find(|e| !(0.0..=1.0).contains(*e)) {
            return Err(Error::Config(format!("acceptance efficiency {e} outside [0, 1]")));
        }
        Ok(Self {
            inner,
            observable: observable.to_string(),
            curve_x,
            curve_eff,
            check_efficiencies: true,
            efficiencies: None,
        })
    }

    /// Whether attaching data with a non-positive efficiency is an error (default: yes).
    pub fn with_check_efficiencies(mut self, check: bool) -> Self {
        self.check_efficiencies = check;
        self
    }

    /// The wrapped source.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Efficiency at `x`.
    pub fn efficiency(&self, x: f64) -> f64 {
        let (xs, ys) = (&self.curve_x, &self.curve_eff);
        let last = xs.len() - 1;
        if x <= xs[0] {
            return ys[0];
        }
        if x >= xs[last] {
            return ys[last];
        }
        let k = xs.partition_point(|&a| a <= x) - 1;
        ys[k] + (ys[k + 1] - ys[k]) * (x - xs[k]) / (xs[k + 1] - xs[k])
    }
}

impl<S: Source> Source for AcceptanceWrapper<S> {
    fn defaults(&self) -> &ParamValues<f64> {
        self.inner.defaults()
    }

    fn set_data(&mut self, data: &EventTable, settings: &DataSettings) -> Result<()> {
        let effs: Vec<f64> =
            data.require_column(&self.observable)?.iter().map(|&x| self.efficiency(x)).collect();
        if self.check_efficiencies {
            let bad = effs.iter().filter(|&&e| !(e > 0.0)).count();
            if bad > 0 {
                return Err(Error::Validation(format!(
                    "{bad} events have non-positive efficiency in '{}'",
                    self.observable
                )));
            }
        }
        let table = EventTable::from_columns([(EFFICIENCY_COLUMN.to_string(), effs)])?;
        let efficiencies = BatchedEvents::new(&table, &[EFFICIENCY_COLUMN], settings.batch_size)?;
        self.inner.set_data(data, settings)?;
        self.efficiencies = Some(efficiencies);
        Ok(())
    }

    fn batching(&self) -> Option<Batching> {
        self.inner.batching()
    }

    fn differential_rate(
        &self,
        tape: &mut Tape,
        i_batch: usize,
        params: &ParamValues<Var>,
    ) -> Result<Vec<Var>> {
        let effs = self
            .efficiencies
            .as_ref()
            .ok_or_else(|| Error::Validation("AcceptanceWrapper has no data attached".into()))?
            .batch(EFFICIENCY_COLUMN, i_batch)?;
        let rates = self.inner.differential_rate(tape, i_batch, params)?;
        if rates.len() != effs.len() {
            return Err(Error::Validation(format!(
                "inner source returned {} rates for a batch of {}",
                rates.len(),
                effs.len()
            )));
        }
        Ok(rates.into_iter().zip(effs).map(|(r, &e)| tape.mul_f64(r, e)).collect())
    }

    fn mu_before_efficiencies(&self, params: &ParamValues<f64>) -> Result<f64> {
        self.inner.mu_before_efficiencies(params)
    }

    fn simulate(
        &self,
        n_events: usize,
        fix_truth: Option<&Truth>,
        params: &ParamValues<f64>,
        rng: &mut dyn RngCore,
    ) -> Result<EventTable> {
        let events = self.inner.simulate(n_events, fix_truth, params, &mut *rng)?;
        let xs = events.require_column(&self.observable)?;
        let uniform = Uniform::new(0.0, 1.0)
            .map_err(|e| Error::Validation(format!("AcceptanceWrapper: {e}")))?;
        let keep: Vec<bool> = xs
            .iter()
            .map(|&x| {
                let u: f64 = uniform.sample(&mut *rng);
                u < self.efficiency(x)
            })
            .collect();
        events.select_rows(&keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::FlatSource;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn wrapped() -> AcceptanceWrapper<FlatSource> {
        let flat = FlatSource::new("x", 100.0, 0.0, 10.0).unwrap();
        AcceptanceWrapper::new(flat, "x", vec![0.0, 10.0], vec![0.0, 1.0]).unwrap()
    }

    #[test]
    fn test_efficiency_interpolation() {
        let w = wrapped();
        assert_relative_eq!(w.efficiency(2.5), 0.25);
        assert_eq!(w.efficiency(-1.0), 0.0);
        assert_eq!(w.efficiency(20.0), 1.0);
        assert!(AcceptanceWrapper::new(w.inner().clone(), "x", vec![1.0, 0.0], vec![0.5, 0.5]).is_err());
        assert!(AcceptanceWrapper::new(w.inner().clone(), "x", vec![0.0], vec![1.5]).is_err());
    }

    #[test]
    fn test_check_efficiencies() {
        let data = EventTable::from_columns([("x".to_string(), vec![0.0, 5.0])]).unwrap();
        let settings = DataSettings { batch_size: 2, max_sigma: 3.0 };
        let err = wrapped().set_data(&data, &settings).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut w = wrapped().with_check_efficiencies(false);
        w.set_data(&data, &settings).unwrap();
        let mut tape = Tape::new();
        let r = w.differential_rate(&mut tape, 0, &ParamValues::new()).unwrap();
        assert_eq!(tape.val(r[0]), 0.0);
        assert_relative_eq!(tape.val(r[1]), 10.0 * 0.5);
    }

    #[test]
    fn test_estimate_mu_applies_acceptance() {
        let w = wrapped();
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(w.mu_before_efficiencies(&ParamValues::new()).unwrap(), 100.0);
        // mean efficiency of a linear ramp on the window is 1/2
        let mu = w.estimate_mu(&ParamValues::new(), 20_000, &mut rng).unwrap();
        assert_relative_eq!(mu, 50.0, epsilon = 1.5);
    }
}
