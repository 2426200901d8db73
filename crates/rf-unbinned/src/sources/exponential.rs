use super::{batched, check_n_expected, check_window, observable_column};
use crate::event_store::{BatchedEvents, Batching, EventTable};
use crate::source::{DataSettings, ParamValues, Source, Truth, param};
use rand::RngCore;
use rand::distr::{Distribution, Uniform};
use rf_ad::{Tape, Var};
use rf_core::{Error, Result};

/// Falling spectrum `exp(-(x - lo) / tau)` truncated to `[lo, hi]`, normalized to
/// `n_expected` events. Parameter: `tau`.
#[derive(Debug, Clone)]
pub struct ExponentialSource {
    observable: String,
    n_expected: f64,
    lo: f64,
    hi: f64,
    defaults: ParamValues<f64>,
    events: Option<BatchedEvents>,
}

impl ExponentialSource {
    /// Exponential of `n_expected` events with default decay length `tau`.
    pub fn new(observable: &str, n_expected: f64, lo: f64, hi: f64, tau: f64) -> Result<Self> {
        check_n_expected("ExponentialSource", n_expected)?;
        check_window("ExponentialSource", lo, hi)?;
        if !(tau.is_finite() && tau > 0.0) {
            return Err(Error::Config(format!("ExponentialSource expects tau > 0, got {tau}")));
        }
        Ok(Self {
            observable: observable.to_string(),
            n_expected,
            lo,
            hi,
            defaults: [("tau".to_string(), tau)].into(),
            events: None,
        })
    }

    fn tau(&self, tau: f64) -> Result<f64> {
        if !(tau.is_finite() && tau > 0.0) {
            return Err(Error::Validation(format!("ExponentialSource requires tau > 0, got {tau}")));
        }
        Ok(tau)
    }
}

impl Source for ExponentialSource {
    fn defaults(&self) -> &ParamValues<f64> {
        &self.defaults
    }

    fn set_data(&mut self, data: &EventTable, settings: &DataSettings) -> Result<()> {
        self.events = Some(BatchedEvents::new(data, &[&self.observable], settings.batch_size)?);
        Ok(())
    }

    fn batching(&self) -> Option<Batching> {
        self.events.as_ref().map(BatchedEvents::batching)
    }

    fn differential_rate(
        &self,
        tape: &mut Tape,
        i_batch: usize,
        params: &ParamValues<Var>,
    ) -> Result<Vec<Var>> {
        let xs = batched(&self.events, "ExponentialSource")?.batch(&self.observable, i_batch)?;
        let tau = param(params, "tau")?;
        self.tau(tape.val(tau))?;

        // n / (tau (1 - exp(-(hi - lo) / tau)))
        let width = tape.constant(self.hi - self.lo);
        let w = tape.div(width, tau);
        let w = tape.neg(w);
        let tail = tape.exp(w);
        let frac = tape.f64_sub(1.0, tail);
        let norm = tape.mul(tau, frac);
        let norm = tape.powi(norm, -1);
        let norm = tape.mul_f64(norm, self.n_expected);

        Ok(xs
            .iter()
            .map(|&x| {
                if !(x >= self.lo && x <= self.hi) {
                    return tape.constant(0.0);
                }
                let dx = tape.constant(x - self.lo);
                let arg = tape.div(dx, tau);
                let arg = tape.neg(arg);
                let shape = tape.exp(arg);
                tape.mul(shape, norm)
            })
            .collect())
    }

    fn mu_before_efficiencies(&self, _params: &ParamValues<f64>) -> Result<f64> {
        Ok(self.n_expected)
    }

    fn simulate(
        &self,
        n_events: usize,
        fix_truth: Option<&Truth>,
        params: &ParamValues<f64>,
        rng: &mut dyn RngCore,
    ) -> Result<EventTable> {
        let tau = self.tau(param(params, "tau")?)?;
        let frac = 1.0 - (-(self.hi - self.lo) / tau).exp();
        let uniform = Uniform::new(0.0, 1.0)
            .map_err(|e| Error::Validation(format!("ExponentialSource: {e}")))?;
        // inverse CDF of the truncated exponential
        let lo = self.lo;
        observable_column(&self.observable, n_events, fix_truth, || {
            let u: f64 = uniform.sample(&mut *rng);
            lo - tau * (1.0 - u * frac).ln()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_rate_integrates_to_n_expected() {
        let (lo, hi, tau, n) = (0.0, 5.0, 2.0, 30.0);
        let xs: Vec<f64> = (0..1000).map(|i| lo + (hi - lo) * (i as f64 + 0.5) / 1000.0).collect();
        let mut src = ExponentialSource::new("e", n, lo, hi, tau).unwrap();
        let data = EventTable::from_columns([("e".to_string(), xs)]).unwrap();
        src.set_data(&data, &DataSettings { batch_size: 1000, max_sigma: 3.0 }).unwrap();

        let mut tape = Tape::new();
        let t = tape.var(tau);
        let p: ParamValues<Var> = [("tau".to_string(), t)].into();
        let r = src.differential_rate(&mut tape, 0, &p).unwrap();
        let integral: f64 = r.iter().map(|&v| tape.val(v)).sum::<f64>() * (hi - lo) / 1000.0;
        assert_relative_eq!(integral, n, epsilon = 1e-3);
    }

    #[test]
    fn test_simulate_stays_in_window() {
        let src = ExponentialSource::new("e", 1.0, 1.0, 4.0, 0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let ev = src.simulate(1000, None, src.defaults(), &mut rng).unwrap();
        let xs = ev.column("e").unwrap();
        assert!(xs.iter().all(|x| (1.0..=4.0).contains(x)));
        // mostly near the low edge
        let below = xs.iter().filter(|&&x| x < 1.5).count();
        assert!(below > 500, "{below}");

        let bad: ParamValues<f64> = [("tau".to_string(), -1.0)].into();
        assert!(src.simulate(1, None, &bad, &mut rng).is_err());
    }
}
