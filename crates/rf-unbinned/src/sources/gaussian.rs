use super::{batched, check_n_expected, observable_column};
use crate::event_store::{BatchedEvents, Batching, EventTable};
use crate::source::{DataSettings, ParamValues, Source, Truth, param};
use rand::RngCore;
use rand_distr::{Distribution, Normal};
use rf_ad::{Tape, Var};
use rf_core::{Error, Result};

const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;

/// Gaussian peak `n_expected * N(x; mean, sigma)` over the whole real line.
///
/// Parameters: `mean` and `sigma` (renamable with [`with_param_names`](Self::with_param_names)).
#[derive(Debug, Clone)]
pub struct GaussianSource {
    observable: String,
    n_expected: f64,
    mean_name: String,
    sigma_name: String,
    defaults: ParamValues<f64>,
    events: Option<BatchedEvents>,
}

impl GaussianSource {
    /// Peak of `n_expected` events in `observable`.
    pub fn new(observable: &str, n_expected: f64, mean: f64, sigma: f64) -> Result<Self> {
        check_n_expected("GaussianSource", n_expected)?;
        if !(mean.is_finite() && sigma.is_finite() && sigma > 0.0) {
            return Err(Error::Config(format!(
                "GaussianSource expects finite mean and sigma > 0, got mean={mean}, sigma={sigma}"
            )));
        }
        let defaults = [("mean".to_string(), mean), ("sigma".to_string(), sigma)].into();
        Ok(Self {
            observable: observable.to_string(),
            n_expected,
            mean_name: "mean".into(),
            sigma_name: "sigma".into(),
            defaults,
            events: None,
        })
    }

    /// Rename the parameters, e.g. to keep two peaks' means apart.
    pub fn with_param_names(mut self, mean: &str, sigma: &str) -> Self {
        let m = self.defaults[&self.mean_name];
        let s = self.defaults[&self.sigma_name];
        self.defaults = [(mean.to_string(), m), (sigma.to_string(), s)].into();
        self.mean_name = mean.to_string();
        self.sigma_name = sigma.to_string();
        self
    }
}

impl Source for GaussianSource {
    fn defaults(&self) -> &ParamValues<f64> {
        &self.defaults
    }

    fn set_data(&mut self, data: &EventTable, settings: &DataSettings) -> Result<()> {
        let events = BatchedEvents::new(data, &[&self.observable], settings.batch_size)?;
        let (mean, sigma) = (self.defaults[&self.mean_name], self.defaults[&self.sigma_name]);
        let outside = data
            .require_column(&self.observable)?
            .iter()
            .filter(|&&x| ((x - mean) / sigma).abs() > settings.max_sigma)
            .count();
        if outside > 0 {
            log::debug!(
                "GaussianSource: {outside} of {} events beyond {} sigma of the default mean",
                data.n_events(),
                settings.max_sigma
            );
        }
        self.events = Some(events);
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
        let xs = batched(&self.events, "GaussianSource")?.batch(&self.observable, i_batch)?;
        let mean = param(params, &self.mean_name)?;
        let sigma = param(params, &self.sigma_name)?;
        if !(tape.val(sigma) > 0.0) {
            return Err(Error::Validation(format!(
                "GaussianSource requires {} > 0, got {}",
                self.sigma_name,
                tape.val(sigma)
            )));
        }
        // n / (sigma sqrt(2 pi)), shared by every row
        let scale = tape.powi(sigma, -1);
        let scale = tape.mul_f64(scale, self.n_expected * INV_SQRT_2PI);
        Ok(xs
            .iter()
            .map(|&x| {
                let d = tape.f64_sub(x, mean);
                let z = tape.div(d, sigma);
                let z2 = tape.powi(z, 2);
                let arg = tape.mul_f64(z2, -0.5);
                let density = tape.exp(arg);
                tape.mul(density, scale)
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
        let mean = param(params, &self.mean_name)?;
        let sigma = param(params, &self.sigma_name)?;
        let normal = Normal::new(mean, sigma)
            .map_err(|e| Error::Validation(format!("GaussianSource: {e}")))?;
        observable_column(&self.observable, n_events, fix_truth, || normal.sample(&mut *rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn settings(batch_size: usize) -> DataSettings {
        DataSettings { batch_size, max_sigma: 3.0 }
    }

    #[test]
    fn test_rate_matches_density() {
        let mut src = GaussianSource::new("x", 10.0, 1.0, 2.0).unwrap();
        let data = EventTable::from_columns([("x".to_string(), vec![1.0, 3.0, -1.0])]).unwrap();
        src.set_data(&data, &settings(2)).unwrap();
        assert_eq!(src.batching().unwrap().n_batches, 2);

        let mut tape = Tape::new();
        let mean = tape.var(1.0);
        let sigma = tape.var(2.0);
        let p: ParamValues<Var> = [("mean".to_string(), mean), ("sigma".to_string(), sigma)].into();
        let r = src.differential_rate(&mut tape, 0, &p).unwrap();
        assert_eq!(r.len(), 2);
        let peak = 10.0 * INV_SQRT_2PI / 2.0;
        assert_relative_eq!(tape.val(r[0]), peak, epsilon = 1e-14);
        assert_relative_eq!(tape.val(r[1]), peak * (-0.5_f64).exp(), epsilon = 1e-14);
        // d rate / d mean at x = mean + sigma is rate * z / sigma
        let g = tape.gradient(r[1], &[mean]);
        assert_relative_eq!(g[0], tape.val(r[1]) * 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_requires_data_and_valid_sigma() {
        let src = GaussianSource::new("x", 1.0, 0.0, 1.0).unwrap();
        let mut tape = Tape::new();
        let p: ParamValues<Var> =
            [("mean".to_string(), tape.constant(0.0)), ("sigma".to_string(), tape.constant(1.0))]
                .into();
        assert!(src.differential_rate(&mut tape, 0, &p).is_err());
        assert!(GaussianSource::new("x", 1.0, 0.0, 0.0).is_err());
        assert!(GaussianSource::new("x", -1.0, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_simulate_and_fix_truth() {
        let src = GaussianSource::new("x", 1.0, 5.0, 0.5).unwrap().with_param_names("m", "s");
        assert!(src.defaults().contains_key("m"));
        let mut rng = StdRng::seed_from_u64(3);
        let ev = src.simulate(2000, None, src.defaults(), &mut rng).unwrap();
        let xs = ev.column("x").unwrap();
        let mean = xs.iter().sum::<f64>() / xs.len() as f64;
        assert_relative_eq!(mean, 5.0, epsilon = 0.05);

        let truth: Truth = [("x".to_string(), 4.2)].into();
        let fixed = src.simulate(3, Some(&truth), src.defaults(), &mut rng).unwrap();
        assert_eq!(fixed.column("x").unwrap(), &[4.2, 4.2, 4.2]);
    }
}
