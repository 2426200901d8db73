//! Peak-on-flat toy study: simulate, fit, set a limit on the signal rate.

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rf_core::Interval;
use rf_inference::{IntervalSearchConfig, LbfgsBestfit, MinimizerConfig, ProfileBisection};
use rf_unbinned::{
    BestfitOptions, DataUpdate, FlatSource, GaussianSource, IntervalOptions, LikelihoodConfig,
    LogLikelihood,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const SIGNAL: &str = "signal";
const BACKGROUND: &str = "background";
const SIGNAL_RATE: &str = "signal_rate_multiplier";

/// Toy model, truth and fit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToyConfig {
    pub observable: String,
    /// Observable window `[lo, hi]` of the flat background.
    pub window: [f64; 2],
    /// Expected signal events at unit rate multiplier.
    pub n_signal: f64,
    pub signal_mean: f64,
    pub signal_sigma: f64,
    /// Expected background events at unit rate multiplier.
    pub n_background: f64,
    /// Signal rate multiplier used for the simulation.
    pub true_signal_rate: f64,
    pub confidence_level: f64,
    pub seed: u64,
    pub likelihood: LikelihoodConfig,
    pub minimizer: MinimizerConfig,
    pub interval: IntervalSearchConfig,
}

impl Default for ToyConfig {
    fn default() -> Self {
        Self {
            observable: "x".into(),
            window: [0.0, 10.0],
            n_signal: 3.0,
            signal_mean: 5.0,
            signal_sigma: 0.5,
            n_background: 20.0,
            true_signal_rate: 1.0,
            confidence_level: 0.9,
            seed: 0,
            likelihood: LikelihoodConfig::default(),
            minimizer: MinimizerConfig::default(),
            interval: IntervalSearchConfig::default(),
        }
    }
}

impl ToyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read toy config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid toy config {}", path.display()))
    }
}

/// Outcome of one toy.
#[derive(Debug, Clone, Serialize)]
pub struct ToyReport {
    pub seed: u64,
    pub n_events: usize,
    pub n_signal_events: usize,
    pub parameter_names: Vec<String>,
    pub truth: BTreeMap<String, f64>,
    pub bestfit: BTreeMap<String, f64>,
    pub errors: BTreeMap<String, f64>,
    pub ll_bestfit: f64,
    pub confidence_level: f64,
    pub limit: Interval,
}

fn build(cfg: &ToyConfig) -> Result<LogLikelihood> {
    let [lo, hi] = cfg.window;
    let signal = GaussianSource::new(&cfg.observable, cfg.n_signal, cfg.signal_mean, cfg.signal_sigma)?;
    let background = FlatSource::new(&cfg.observable, cfg.n_background, lo, hi)?;
    Ok(LogLikelihood::builder()
        .source(SIGNAL, signal)
        .source(BACKGROUND, background)
        .free_rate(SIGNAL)
        .free_rate(BACKGROUND)
        .config(cfg.likelihood)
        .build()?)
}

pub fn run(cfg: &ToyConfig) -> Result<ToyReport> {
    let mut lf = build(cfg).context("failed to build the toy likelihood")?;
    let truth = lf.prepare_params(&[(SIGNAL_RATE, cfg.true_signal_rate)])?;

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let simulated = lf.simulate(None, &truth.as_pairs(), &mut rng)?;
    // the flat background has no density outside the window
    let [lo, hi] = cfg.window;
    let keep: Vec<bool> = simulated
        .require_column(&cfg.observable)?
        .iter()
        .map(|&x| (lo..=hi).contains(&x))
        .collect();
    let data = simulated.select_rows(&keep)?;
    let n_signal_events =
        data.labels().map_or(0, |labels| labels.iter().filter(|l| l.as_str() == SIGNAL).count());
    tracing::info!(
        "simulated {} events ({} signal) with seed {}",
        data.n_events(),
        n_signal_events,
        cfg.seed
    );
    let n_events = data.n_events();
    lf.set_data(DataUpdate::Single(data))?;

    let bestfit_objective = LbfgsBestfit::new(cfg.minimizer);
    let opts = BestfitOptions { return_errors: true, ..BestfitOptions::default() };
    let fit = lf.bestfit(&bestfit_objective, &opts).context("bestfit failed")?;
    let ll_bestfit = lf.call(&fit.params.as_pairs())?;
    tracing::info!("bestfit: {} (log L = {ll_bestfit})", fit.params);

    let interval_objective = ProfileBisection::new(cfg.minimizer, cfg.interval);
    let interval_opts = IntervalOptions {
        bestfit: Some(fit.params.clone()),
        confidence_level: cfg.confidence_level,
        sigma_guess: fit.errors.get(&format!("error_{SIGNAL_RATE}")).copied(),
        ..IntervalOptions::new(SIGNAL_RATE)
    };
    let limit = lf
        .one_parameter_interval(&interval_objective, &bestfit_objective, &interval_opts)
        .context("limit search failed")?;
    tracing::info!("{} limit on {SIGNAL_RATE}: {:?}", cfg.confidence_level, limit);

    Ok(ToyReport {
        seed: cfg.seed,
        n_events,
        n_signal_events,
        parameter_names: lf.param_names().to_vec(),
        truth: truth.to_map(),
        bestfit: fit.params.to_map(),
        errors: fit.errors,
        ll_bestfit,
        confidence_level: cfg.confidence_level,
        limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let cfg: ToyConfig = serde_json::from_str(r#"{"n_signal": 5.0, "likelihood": {"n_trials": 1000}}"#).unwrap();
        assert_eq!(cfg.n_signal, 5.0);
        assert_eq!(cfg.likelihood.n_trials, 1000);
        assert_eq!(cfg.likelihood.batch_size, 10);
        assert_eq!(cfg.window, [0.0, 10.0]);
        assert!(serde_json::from_str::<ToyConfig>(r#"{"n_sgnal": 5.0}"#).is_err());
    }

    #[test]
    fn test_toy_is_reproducible() {
        let cfg = ToyConfig { seed: 3, ..ToyConfig::default() };
        let a = run(&cfg).unwrap();
        let b = run(&cfg).unwrap();
        assert_eq!(a.n_events, b.n_events);
        assert_eq!(a.bestfit, b.bestfit);
        assert_eq!(a.limit, b.limit);
        assert_eq!(a.parameter_names, vec![SIGNAL_RATE.to_string(), "background_rate_multiplier".into()]);
        let (_, upper) = a.limit.bounds();
        assert!(upper > a.bestfit[SIGNAL_RATE]);
    }
}
