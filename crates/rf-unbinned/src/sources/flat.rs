use super::{batched, check_n_expected, check_window, observable_column};
use crate::event_store::{BatchedEvents, Batching, EventTable};
use crate::source::{DataSettings, ParamValues, Source, Truth};
use rand::RngCore;
use rand::distr::{Distribution, Uniform};
use rf_ad::{Tape, Var};
use rf_core::{Error, Result};

/// `n_expected` events spread uniformly over `[lo, hi]`; zero rate outside the window.
///
/// Has no parameters of its own, so it only varies through its rate multiplier.
#[derive(Debug, Clone)]
pub struct FlatSource {
    observable: String,
    n_expected: f64,
    lo: f64,
    hi: f64,
    defaults: ParamValues<f64>,
    events: Option<BatchedEvents>,
}

impl FlatSource {
    /// Flat spectrum of `n_expected` events in `observable` on `[lo, hi]`.
    pub fn new(observable: &str, n_expected: f64, lo: f64, hi: f64) -> Result<Self> {
        check_n_expected("FlatSource", n_expected)?;
        check_window("FlatSource", lo, hi)?;
        Ok(Self {
            observable: observable.to_string(),
            n_expected,
            lo,
            hi,
            defaults: ParamValues::new(),
            events: None,
        })
    }
}

impl Source for FlatSource {
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
        _params: &ParamValues<Var>,
    ) -> Result<Vec<Var>> {
        let xs = batched(&self.events, "FlatSource")?.batch(&self.observable, i_batch)?;
        let density = self.n_expected / (self.hi - self.lo);
        Ok(xs
            .iter()
            .map(|&x| tape.constant(if x >= self.lo && x <= self.hi { density } else { 0.0 }))
            .collect())
    }

    fn mu_before_efficiencies(&self, _params: &ParamValues<f64>) -> Result<f64> {
        Ok(self.n_expected)
    }

    fn simulate(
        &self,
        n_events: usize,
        fix_truth: Option<&Truth>,
        _params: &ParamValues<f64>,
        rng: &mut dyn RngCore,
    ) -> Result<EventTable> {
        let uniform = Uniform::new_inclusive(self.lo, self.hi)
            .map_err(|e| Error::Validation(format!("FlatSource: {e}")))?;
        observable_column(&self.observable, n_events, fix_truth, || uniform.sample(&mut *rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_zero_rate_outside_window() {
        let mut src = FlatSource::new("x", 20.0, 0.0, 10.0).unwrap();
        let data = EventTable::from_columns([("x".to_string(), vec![5.0, 11.0])]).unwrap();
        src.set_data(&data, &DataSettings { batch_size: 4, max_sigma: 3.0 }).unwrap();
        let mut tape = Tape::new();
        let r = src.differential_rate(&mut tape, 0, &ParamValues::new()).unwrap();
        assert_eq!(r.len(), 4);
        assert_eq!(tape.val(r[0]), 2.0);
        assert_eq!(tape.val(r[1]), 0.0);
        // padding repeats the last event
        assert_eq!(tape.val(r[3]), 0.0);
    }

    #[test]
    fn test_simulate_within_window() {
        let src = FlatSource::new("x", 1.0, -1.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let ev = src.simulate(500, None, &ParamValues::new(), &mut rng).unwrap();
        assert_eq!(ev.n_events(), 500);
        assert!(ev.column("x").unwrap().iter().all(|x| (-1.0..=1.0).contains(x)));
        assert!(FlatSource::new("x", 1.0, 1.0, 1.0).is_err());
    }
}
