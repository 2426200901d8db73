//! The likelihood orchestrator.
//!
//! [`LogLikelihood`] owns the sources, their datasets and the parameter registry. It sums
//! the per-batch terms and the global term (see [`crate::batch`]) through the configured
//! [`Differentiator`], and drives fits and interval searches through the objective traits
//! of `rf-core`.

use crate::batch::{BatchTerm, GlobalTerm};
use crate::constraint::{LogConstraint, NoConstraint};
use crate::covariance::{FitSummary, SummaryEntry, cov_to_std, invert_symmetric};
use crate::differentiable::{Differentiator, Evaluation, Order, ReverseMode};
use crate::event_store::{Batching, EventTable};
use crate::interp::MuInterpolator;
use crate::params::{ParamSet, ParameterRegistry};
use crate::source::{DataSettings, Source, Truth};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rand_distr::{Distribution, Poisson};
use rf_ad::Tape;
use rf_core::{
    BestfitObjective, BestfitProblem, CancelToken, CriticalValue, Direction, Error, Interval,
    IntervalKind, IntervalObjective, IntervalProblem, LOWER_RATE_MULTIPLIER_BOUND,
    LikelihoodModel, ParamSpec, Result, WilksCriticalValue, is_rate_multiplier,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the dataset used when sources are added without one.
pub const DEFAULT_DATASET: &str = "the_dataset";

/// Construction-time settings of a [`LogLikelihood`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LikelihoodConfig {
    /// Events per batch.
    pub batch_size: usize,
    /// Forwarded to sources with the data, see [`DataSettings::max_sigma`].
    pub max_sigma: f64,
    /// Simulated events per expected-rate estimate.
    pub n_trials: usize,
    /// Seed of the generator used for the expected-rate estimates.
    pub seed: u64,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self { batch_size: 10, max_sigma: 3.0, n_trials: 100_000, seed: 0 }
    }
}

impl LikelihoodConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if !(self.max_sigma.is_finite() && self.max_sigma > 0.0) {
            return Err(Error::Config(format!("max_sigma must be positive, got {}", self.max_sigma)));
        }
        if self.n_trials == 0 {
            return Err(Error::Config("n_trials must be positive".into()));
        }
        Ok(())
    }

    fn data_settings(&self) -> DataSettings {
        DataSettings { batch_size: self.batch_size, max_sigma: self.max_sigma }
    }
}

pub(crate) struct SourceEntry {
    pub(crate) name: String,
    pub(crate) source: Box<dyn Source>,
    pub(crate) mu_itp: MuInterpolator,
}

pub(crate) struct Dataset {
    pub(crate) name: String,
    pub(crate) sources: Vec<usize>,
    pub(crate) batching: Batching,
    // last table attached to every source of the dataset
    pub(crate) data: Option<EventTable>,
}

/// New data for [`LogLikelihood::set_data`].
#[derive(Debug, Clone)]
pub enum DataUpdate {
    /// Data for the only dataset.
    Single(EventTable),
    /// Data for some of the datasets, by name.
    PerDataset(BTreeMap<String, EventTable>),
}

/// Options of [`LogLikelihood::log_likelihood`].
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    /// Also compute the Hessian.
    pub second_order: bool,
    /// Parameters excluded from the derivatives.
    pub omit_grads: Vec<String>,
}

/// `log L` and its derivatives over the non-omitted parameters (registry order).
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodValue {
    /// `log L`
    pub ll: f64,
    /// Gradient of `log L`.
    pub grad: Vec<f64>,
    /// Hessian of `log L`, when requested.
    pub hessian: Option<Vec<Vec<f64>>>,
}

/// Options of [`LogLikelihood::bestfit`].
#[derive(Debug, Clone)]
pub struct BestfitOptions {
    /// Starting values; other parameters start at their defaults.
    pub guess: Vec<(String, f64)>,
    /// Parameters held fixed.
    pub fix: Vec<(String, f64)>,
    /// Convergence tolerance on `-2 log L`.
    pub llr_tolerance: f64,
    /// Newton step from the guess before the quasi-Newton iterations.
    pub use_hessian: bool,
    /// Also return standard errors.
    pub return_errors: bool,
    /// Substitute for non-finite objective values.
    pub nan_val: f64,
}

impl Default for BestfitOptions {
    fn default() -> Self {
        Self {
            guess: Vec::new(),
            fix: Vec::new(),
            llr_tolerance: 0.01,
            use_hessian: true,
            return_errors: false,
            nan_val: f64::INFINITY,
        }
    }
}

/// Result of [`LogLikelihood::bestfit`].
#[derive(Debug, Clone, PartialEq)]
pub struct BestfitResult {
    /// Best-fit values of every parameter.
    pub params: ParamSet,
    /// `error_<name>` entries returned by the objective.
    pub errors: BTreeMap<String, f64>,
}

/// Starting point of an interval search.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum IntervalGuess {
    /// Derive from the best fit and the sigma guess.
    #[default]
    None,
    /// Guess for an upper or lower limit.
    Single(f64),
    /// Guesses for the low and high end of a central interval.
    Pair(Option<f64>, Option<f64>),
}

/// Options of [`LogLikelihood::one_parameter_interval`].
#[derive(Clone)]
pub struct IntervalOptions {
    /// Parameter the interval is set on.
    pub parameter: String,
    /// Global best fit; computed when absent.
    pub bestfit: Option<ParamSet>,
    /// Starting point(s).
    pub guess: IntervalGuess,
    /// Parameters held fixed. Intervals are only meaningful if the best fit used the same.
    pub fix: Vec<(String, f64)>,
    /// Confidence level.
    pub confidence_level: f64,
    /// Upper limit, lower limit or central interval.
    pub kind: IntervalKind,
    /// One-sigma scale of the target; from the inverse Hessian when absent.
    pub sigma_guess: Option<f64>,
    /// Critical value of the test statistic; Wilks when absent.
    pub critical_value: Option<Arc<dyn CriticalValue>>,
    /// Tolerance on `|t - t_crit|`; squared before use.
    pub llr_tolerance: f64,
}

impl IntervalOptions {
    /// Upper limit at 90% confidence on `parameter`.
    pub fn new(parameter: &str) -> Self {
        Self {
            parameter: parameter.to_string(),
            bestfit: None,
            guess: IntervalGuess::None,
            fix: Vec::new(),
            confidence_level: 0.9,
            kind: IntervalKind::Upper,
            sigma_guess: None,
            critical_value: None,
            llr_tolerance: 0.05,
        }
    }
}

/// Options of [`LogLikelihood::summary`].
#[derive(Debug, Clone)]
pub struct SummaryOptions {
    /// Best fit to summarize; computed when absent.
    pub bestfit: Option<ParamSet>,
    /// Parameters held fixed.
    pub fix: Vec<(String, f64)>,
    /// Starting values for the fit.
    pub guess: Vec<(String, f64)>,
    /// Precomputed inverse Hessian over the free parameters.
    pub inverse_hessian: Option<DMatrix<f64>>,
    /// Significant digits.
    pub precision: usize,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self { bestfit: None, fix: Vec::new(), guess: Vec::new(), inverse_hessian: None, precision: 3 }
    }
}

/// Builder for [`LogLikelihood`].
pub struct LikelihoodBuilder {
    datasets: Vec<(String, Vec<(String, Box<dyn Source>)>)>,
    data: Vec<(String, EventTable)>,
    flat_data: Option<EventTable>,
    free_rates: Vec<String>,
    common: Vec<(String, ParamSpec)>,
    constraint: Option<Box<dyn LogConstraint>>,
    differentiator: Option<Box<dyn Differentiator>>,
    config: LikelihoodConfig,
    cancel: Option<CancelToken>,
}

impl Default for LikelihoodBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LikelihoodBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self {
            datasets: Vec::new(),
            data: Vec::new(),
            flat_data: None,
            free_rates: Vec::new(),
            common: Vec::new(),
            constraint: None,
            differentiator: None,
            config: LikelihoodConfig::default(),
            cancel: None,
        }
    }

    /// Add a source to the default dataset.
    pub fn source<S: Source + 'static>(self, name: &str, source: S) -> Self {
        self.source_in(DEFAULT_DATASET, name, source)
    }

    /// Add a source to `dataset`, declaring the dataset on first use.
    pub fn source_in<S: Source + 'static>(mut self, dataset: &str, name: &str, source: S) -> Self {
        let entry = (name.to_string(), Box::new(source) as Box<dyn Source>);
        match self.datasets.iter_mut().find(|(d, _)| d == dataset) {
            Some((_, sources)) => sources.push(entry),
            None => self.datasets.push((dataset.to_string(), vec![entry])),
        }
        self
    }

    /// Data for the only dataset.
    pub fn data(mut self, table: EventTable) -> Self {
        self.flat_data = Some(table);
        self
    }

    /// Data for `dataset`.
    pub fn data_in(mut self, dataset: &str, table: EventTable) -> Self {
        self.data.push((dataset.to_string(), table));
        self
    }

    /// Give source `name` a free `<name>_rate_multiplier`.
    pub fn free_rate(mut self, name: &str) -> Self {
        self.free_rates.push(name.to_string());
        self
    }

    /// Expose a shared parameter tabulated on `spec`.
    pub fn common_param(mut self, name: &str, spec: ParamSpec) -> Self {
        self.common.push((name.to_string(), spec));
        self
    }

    /// Log-constraint term (zero when not set).
    pub fn log_constraint<C: LogConstraint + 'static>(mut self, constraint: C) -> Self {
        self.constraint = Some(Box::new(constraint));
        self
    }

    /// Differentiation backend (reverse mode when not set).
    pub fn differentiator<D: Differentiator + 'static>(mut self, differentiator: D) -> Self {
        self.differentiator = Some(Box::new(differentiator));
        self
    }

    /// Construction settings.
    pub fn config(mut self, config: LikelihoodConfig) -> Self {
        self.config = config;
        self
    }

    /// Cancellation token checked between batches and by objective strategies.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Validate, attach data and tabulate the expected rates.
    pub fn build(self) -> Result<LogLikelihood> {
        self.config.validate()?;
        if self.datasets.is_empty() {
            return Err(Error::Config("a likelihood needs at least one source".into()));
        }

        let mut data: BTreeMap<String, EventTable> = BTreeMap::new();
        if let Some(table) = self.flat_data {
            if self.datasets.len() != 1 {
                return Err(Error::Config(format!(
                    "data given without a dataset name, but there are {} datasets",
                    self.datasets.len()
                )));
            }
            data.insert(self.datasets[0].0.clone(), table);
        }
        for (dname, table) in self.data {
            if !self.datasets.iter().any(|(d, _)| *d == dname) {
                return Err(Error::Config(format!("data given for unknown dataset '{dname}'")));
            }
            if data.insert(dname.clone(), table).is_some() {
                return Err(Error::Config(format!("data given twice for dataset '{dname}'")));
            }
        }

        let mut sources: Vec<(String, Box<dyn Source>)> = Vec::new();
        let mut datasets = Vec::with_capacity(self.datasets.len());
        for (dname, members) in self.datasets {
            let start = sources.len();
            sources.extend(members);
            datasets.push(Dataset {
                name: dname,
                sources: (start..sources.len()).collect(),
                batching: Batching::deferred(self.config.batch_size),
                data: None,
            });
        }

        let registry = {
            let named: Vec<(&str, &_)> =
                sources.iter().map(|(n, s)| (n.as_str(), s.defaults())).collect();
            ParameterRegistry::new(&named, &self.free_rates, &self.common)?
        };

        let constraint = self.constraint.unwrap_or_else(|| Box::new(NoConstraint));
        for p in constraint.parameters() {
            if registry.index_of(&p).is_none() {
                return Err(Error::Config(format!(
                    "constraint on '{p}', which is not a likelihood parameter"
                )));
            }
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut entries = Vec::with_capacity(sources.len());
        for (name, source) in sources {
            let specs = registry.source_specs(&name);
            let mu_itp = source.mu_function(self.config.n_trials, &specs, &mut rng)?;
            log::debug!(
                "source '{name}': expected events at defaults {:.4} ({} shared parameters)",
                mu_itp.base(),
                specs.len()
            );
            entries.push(SourceEntry { name, source, mu_itp });
        }

        let mut lf = LogLikelihood {
            sources: entries,
            datasets,
            registry,
            constraint,
            differentiator: self.differentiator.unwrap_or_else(|| Box::new(ReverseMode)),
            config: self.config,
            cancel: self.cancel,
        };
        for (dname, table) in data {
            let di = lf.dataset_index(&dname)?;
            lf.attach_data(di, &table)?;
        }
        Ok(lf)
    }
}

/// Extended unbinned log-likelihood over several sources and datasets.
pub struct LogLikelihood {
    pub(crate) sources: Vec<SourceEntry>,
    pub(crate) datasets: Vec<Dataset>,
    pub(crate) registry: ParameterRegistry,
    pub(crate) constraint: Box<dyn LogConstraint>,
    differentiator: Box<dyn Differentiator>,
    config: LikelihoodConfig,
    cancel: Option<CancelToken>,
}

impl LogLikelihood {
    /// Start building a likelihood.
    pub fn builder() -> LikelihoodBuilder {
        LikelihoodBuilder::new()
    }

    /// The parameter registry.
    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// Parameter names, in registry order.
    pub fn param_names(&self) -> &[String] {
        self.registry.names()
    }

    /// Construction settings.
    pub fn config(&self) -> &LikelihoodConfig {
        &self.config
    }

    /// Dataset names, in declaration order.
    pub fn dataset_names(&self) -> Vec<&str> {
        self.datasets.iter().map(|d| d.name.as_str()).collect()
    }

    /// Source names, in declaration order.
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name.as_str()).collect()
    }

    /// Dataset `source` belongs to.
    pub fn dataset_of(&self, source: &str) -> Option<&str> {
        let si = self.sources.iter().position(|s| s.name == source)?;
        self.datasets.iter().find(|d| d.sources.contains(&si)).map(|d| d.name.as_str())
    }

    /// Non-rate parameters recognized by `source`.
    pub fn source_kwargnames(&self, source: &str) -> Vec<&str> {
        self.registry.source_kwargnames(source)
    }

    /// Batching of `dataset`.
    pub fn batching(&self, dataset: &str) -> Result<Batching> {
        Ok(self.datasets[self.dataset_index(dataset)?].batching)
    }

    /// Expected-rate interpolator of `source`.
    pub fn mu_interpolator(&self, source: &str) -> Result<&MuInterpolator> {
        self.sources
            .iter()
            .find(|s| s.name == source)
            .map(|s| &s.mu_itp)
            .ok_or_else(|| Error::Invocation(format!("unknown source '{source}'")))
    }

    fn dataset_index(&self, name: &str) -> Result<usize> {
        self.datasets
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| Error::Invocation(format!("unknown dataset '{name}'")))
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }

    // Hand `table` to every source of dataset `di`. On error no source keeps it.
    fn attach_data(&mut self, di: usize, table: &EventTable) -> Result<()> {
        let batching = match self.send_to_sources(di, table) {
            Ok(b) => b,
            Err(e) => {
                let previous = self.datasets[di].data.clone();
                self.restore_data(di, previous);
                return Err(e);
            }
        };
        let dataset = &mut self.datasets[di];
        if let Some(b) = batching {
            log::debug!(
                "dataset '{}': {} events in {} batches ({} padding)",
                dataset.name,
                b.n_events(),
                b.n_batches,
                b.n_padding
            );
            dataset.batching = b;
        }
        dataset.data = Some(table.clone());
        Ok(())
    }

    fn send_to_sources(&mut self, di: usize, table: &EventTable) -> Result<Option<Batching>> {
        let settings = self.config.data_settings();
        let members = self.datasets[di].sources.clone();
        let mut batching: Option<Batching> = None;
        for si in members {
            let entry = &mut self.sources[si];
            entry.source.set_data(table, &settings)?;
            let b = entry.source.batching().ok_or_else(|| {
                Error::Validation(format!("source '{}' reported no batching after set_data", entry.name))
            })?;
            match batching {
                Some(prev) if prev != b => {
                    return Err(Error::Validation(format!(
                        "sources of dataset '{}' disagree on batching: {prev:?} vs {b:?}",
                        self.datasets[di].name
                    )));
                }
                _ => batching = Some(b),
            }
        }
        Ok(batching)
    }

    // Put dataset `di` back on `previous`. Without a previous table the dataset is deferred
    // again, so data a source may still hold is never read.
    fn restore_data(&mut self, di: usize, previous: Option<EventTable>) {
        match previous {
            Some(table) => match self.send_to_sources(di, &table) {
                Ok(b) => {
                    if let Some(b) = b {
                        self.datasets[di].batching = b;
                    }
                    self.datasets[di].data = Some(table);
                }
                Err(e) => {
                    log::warn!(
                        "could not restore the data of dataset '{}' ({e}); deferring it",
                        self.datasets[di].name
                    );
                    self.datasets[di].batching = Batching::deferred(self.config.batch_size);
                    self.datasets[di].data = None;
                }
            },
            None => {
                self.datasets[di].batching = Batching::deferred(self.config.batch_size);
                self.datasets[di].data = None;
            }
        }
    }

    /// Replace the data of one or more datasets.
    pub fn set_data(&mut self, update: DataUpdate) -> Result<()> {
        let updates: Vec<(usize, EventTable)> = match update {
            DataUpdate::Single(table) => {
                if self.datasets.len() != 1 {
                    return Err(Error::Invocation(format!(
                        "data must be given per dataset, there are {} datasets",
                        self.datasets.len()
                    )));
                }
                vec![(0, table)]
            }
            DataUpdate::PerDataset(map) => map
                .into_iter()
                .map(|(name, table)| Ok((self.dataset_index(&name)?, table)))
                .collect::<Result<_>>()?,
        };
        let previous: Vec<Option<EventTable>> =
            updates.iter().map(|(di, _)| self.datasets[*di].data.clone()).collect();
        for (k, (di, table)) in updates.iter().enumerate() {
            if let Err(e) = self.attach_data(*di, table) {
                // datasets updated earlier in this call go back to their old data too
                for j in (0..k).rev() {
                    self.restore_data(updates[j].0, previous[j].clone());
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Defaults overridden by `params`. Unknown names are invocation errors.
    pub fn prepare_params(&self, params: &[(&str, f64)]) -> Result<ParamSet> {
        self.registry.prepare(params)
    }

    /// Default starting point of a fit.
    pub fn guess(&self) -> ParamSet {
        self.registry.default_set()
    }

    /// Name a registry-ordered vector.
    pub fn params_to_dict(&self, values: &[f64]) -> Result<ParamSet> {
        self.registry.to_set(values)
    }

    fn active_indices(&self, omit: &[usize]) -> Vec<usize> {
        (0..self.registry.len()).filter(|i| !omit.contains(i)).collect()
    }

    // Sum of every batch term and the global term, in declaration order.
    fn evaluate(&self, values: &[f64], active: &[usize], order: Order) -> Result<Evaluation> {
        let mut acc = Evaluation::zeros(active.len(), order);
        for (di, dataset) in self.datasets.iter().enumerate() {
            for i_batch in 0..dataset.batching.n_batches {
                self.check_cancelled()?;
                let term = BatchTerm { likelihood: self, dataset: di, i_batch };
                let e = self.differentiator.evaluate(&term, values, active, order)?;
                acc.accumulate(&e)?;
            }
        }
        self.check_cancelled()?;
        let e = self.differentiator.evaluate(&GlobalTerm { likelihood: self }, values, active, order)?;
        acc.accumulate(&e)?;
        Ok(acc)
    }

    /// `log L`, its gradient and optionally its Hessian.
    pub fn log_likelihood(
        &self,
        params: &[(&str, f64)],
        options: &EvalOptions,
    ) -> Result<LikelihoodValue> {
        let values = self.prepare_params(params)?.values();
        let omit = self.registry.require_all(&options.omit_grads)?;
        let order = if options.second_order { Order::Second } else { Order::First };
        let e = self.evaluate(&values, &self.active_indices(&omit), order)?;
        Ok(LikelihoodValue { ll: e.value, grad: e.gradient, hessian: e.hessian })
    }

    /// `log L` only.
    pub fn call(&self, params: &[(&str, f64)]) -> Result<f64> {
        let values = self.prepare_params(params)?.values();
        Ok(self.evaluate(&values, &[], Order::First)?.value)
    }

    /// `-2 log L` and its gradient.
    pub fn minus_ll(&self, params: &[(&str, f64)], omit_grads: &[&str]) -> Result<(f64, Vec<f64>)> {
        let values = self.prepare_params(params)?.values();
        let omit = self.registry.require_all(omit_grads)?;
        let mut e = self.evaluate(&values, &self.active_indices(&omit), Order::First)?;
        e.scale(-2.0);
        Ok((e.value, e.gradient))
    }

    /// Expected number of events in `dataset`.
    pub fn mu(&self, dataset: &str, params: &[(&str, f64)]) -> Result<f64> {
        let di = self.dataset_index(dataset)?;
        let values = self.prepare_params(params)?.values();
        let mut tape = Tape::new();
        let inputs: Vec<_> = values.iter().map(|&v| tape.constant(v)).collect();
        let mu = self.record_dataset_mu(&mut tape, di, &inputs)?;
        Ok(tape.val(mu))
    }

    /// Simulate a dataset: Poisson counts per source, tagged by source name, shuffled.
    pub fn simulate(
        &self,
        fix_truth: Option<&Truth>,
        params: &[(&str, f64)],
        rng: &mut dyn RngCore,
    ) -> Result<EventTable> {
        let values = self.prepare_params(params)?.values();
        let mut parts = Vec::new();
        for dataset in &self.datasets {
            for &si in &dataset.sources {
                let entry = &self.sources[si];
                let rm = self.registry.rate_multiplier_index(&entry.name).map_or(1.0, |i| values[i]);
                let source_params = self.source_values(si, &values);
                let mu = rm * entry.source.mu_before_efficiencies(&source_params)?;
                if !(mu.is_finite() && mu >= 0.0) {
                    return Err(Error::Validation(format!(
                        "source '{}': expected events must be finite and >= 0, got {mu}",
                        entry.name
                    )));
                }
                if mu == 0.0 {
                    continue;
                }
                let poisson = Poisson::new(mu)
                    .map_err(|e| Error::Validation(format!("source '{}': {e}", entry.name)))?;
                let n = poisson.sample(&mut *rng) as usize;
                if n == 0 {
                    continue;
                }
                let events = entry.source.simulate(n, fix_truth, &source_params, &mut *rng)?;
                if !events.is_empty() {
                    parts.push(events.with_label(&entry.name));
                }
            }
        }
        let mut out = EventTable::concat(&parts);
        out.shuffle(rng);
        Ok(out)
    }

    /// Maximum-likelihood fit through `objective`.
    pub fn bestfit(
        &self,
        objective: &dyn BestfitObjective,
        options: &BestfitOptions,
    ) -> Result<BestfitResult> {
        if !(options.llr_tolerance > 0.0) {
            return Err(Error::Invocation(format!(
                "llr_tolerance must be positive, got {}",
                options.llr_tolerance
            )));
        }
        let mut guess = self.guess().values();
        for (name, v) in &options.guess {
            guess[self.registry.require(name)?] = *v;
        }
        let mut fixed = Vec::with_capacity(options.fix.len());
        for (name, v) in &options.fix {
            let i = self.registry.require(name)?;
            guess[i] = *v;
            fixed.push(i);
        }

        let problem = BestfitProblem {
            model: self,
            guess,
            fixed,
            llr_tolerance: options.llr_tolerance,
            use_hessian: options.use_hessian,
            return_errors: options.return_errors,
            nan_val: options.nan_val,
        };
        let res = objective.minimize(&problem)?;

        let values = self
            .registry
            .names()
            .iter()
            .map(|n| {
                res.get(n).copied().ok_or_else(|| {
                    Error::Optimizer(format!("{} returned no value for '{n}'", objective.name()))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        let errors =
            res.into_iter().filter(|(k, _)| k.starts_with("error_")).collect::<BTreeMap<_, _>>();
        let params = self.registry.to_set(&values)?;
        log::debug!("bestfit ({}): {params}", objective.name());
        Ok(BestfitResult { params, errors })
    }

    /// Inverse of the observed information `-H(log L)` over the non-omitted parameters.
    ///
    /// Equals `2 * inverse(H(-2 log L))`, the asymptotic covariance of the estimates.
    pub fn inverse_hessian(
        &self,
        params: &[(&str, f64)],
        omit_grads: &[&str],
    ) -> Result<DMatrix<f64>> {
        let values = self.prepare_params(params)?.values();
        let omit = self.registry.require_all(omit_grads)?;
        self.inverse_hessian_values(&values, &omit)
    }

    fn inverse_hessian_values(&self, values: &[f64], omit: &[usize]) -> Result<DMatrix<f64>> {
        let active = self.active_indices(omit);
        let e = self.evaluate(values, &active, Order::Second)?;
        let h = e
            .hessian
            .ok_or_else(|| Error::Computation("second-order evaluation returned no Hessian".into()))?;
        let k = active.len();
        let information = DMatrix::from_fn(k, k, |i, j| -h[i][j]);
        invert_symmetric(&information)
    }

    /// Frequentist limit or interval on one parameter.
    pub fn one_parameter_interval(
        &self,
        objective: &dyn IntervalObjective,
        bestfit_objective: &dyn BestfitObjective,
        options: &IntervalOptions,
    ) -> Result<Interval> {
        let name = options.parameter.as_str();
        let target = self.registry.require(name)?;
        let cl = options.confidence_level;
        if !(cl > 0.0 && cl < 1.0) {
            return Err(Error::Invocation(format!("confidence_level must be in (0, 1), got {cl}")));
        }
        if !(options.llr_tolerance > 0.0) {
            return Err(Error::Invocation(format!(
                "llr_tolerance must be positive, got {}",
                options.llr_tolerance
            )));
        }

        let mut fixed = Vec::with_capacity(options.fix.len());
        for (n, _) in &options.fix {
            fixed.push(self.registry.require(n)?);
        }
        if fixed.contains(&target) {
            return Err(Error::Invocation(format!("cannot set an interval on fixed parameter {name}")));
        }

        let guesses: Vec<Option<f64>> = match (options.kind, options.guess) {
            (IntervalKind::Upper | IntervalKind::Lower, IntervalGuess::None) => vec![None],
            (IntervalKind::Upper | IntervalKind::Lower, IntervalGuess::Single(g)) => vec![Some(g)],
            (IntervalKind::Central, IntervalGuess::None) => vec![None, None],
            (IntervalKind::Central, IntervalGuess::Pair(lo, hi)) => vec![lo, hi],
            (IntervalKind::Central, IntervalGuess::Single(_)) => {
                return Err(Error::Invocation("Guess for central interval must be a pair".into()));
            }
            (kind, IntervalGuess::Pair(..)) => {
                return Err(Error::Invocation(format!(
                    "Guess for a {kind} limit must be a single value"
                )));
            }
        };

        let bestfit = match &options.bestfit {
            Some(b) => {
                if !b.names().eq(self.registry.names().iter().map(String::as_str)) {
                    return Err(Error::Invocation(
                        "bestfit does not match the likelihood's parameters".into(),
                    ));
                }
                b.clone()
            }
            None => {
                let opts = BestfitOptions { fix: options.fix.clone(), ..BestfitOptions::default() };
                self.bestfit(bestfit_objective, &opts)?.params
            }
        };
        let mut bestfit = bestfit.values();
        for ((_, v), &i) in options.fix.iter().zip(&fixed) {
            bestfit[i] = *v;
        }
        let x_best = bestfit[target];

        let sigma_guess = match options.sigma_guess {
            Some(s) if s.is_finite() && s > 0.0 => s,
            Some(s) => {
                return Err(Error::Invocation(format!("sigma_guess must be positive, got {s}")));
            }
            None => {
                let cov = self.inverse_hessian_values(&bestfit, &fixed)?;
                let pos = self.active_indices(&fixed).iter().position(|&i| i == target).ok_or_else(
                    || Error::Computation(format!("parameter {name} missing from the Hessian")),
                )?;
                let var = cov[(pos, pos)];
                if !(var.is_finite() && var > 0.0) {
                    return Err(Error::Computation(format!(
                        "non-positive variance {var} for {name}; pass sigma_guess explicitly"
                    )));
                }
                var.sqrt()
            }
        };

        let lower_bound = is_rate_multiplier(name).then_some(LOWER_RATE_MULTIPLIER_BOUND);
        let requests: Vec<(Direction, f64, (Option<f64>, Option<f64>))> = match options.kind {
            IntervalKind::Upper => vec![(Direction::Up, cl, (Some(x_best), None))],
            IntervalKind::Lower => vec![(Direction::Down, 1.0 - cl, (lower_bound, Some(x_best)))],
            IntervalKind::Central => vec![
                (Direction::Down, (1.0 - cl) / 2.0, (lower_bound, Some(x_best))),
                (Direction::Up, 1.0 - (1.0 - cl) / 2.0, (Some(x_best), None)),
            ],
        };

        let critical_value: &dyn CriticalValue =
            options.critical_value.as_deref().unwrap_or(&WilksCriticalValue);
        let llr_tolerance = options.llr_tolerance * options.llr_tolerance;

        let mut limits = Vec::with_capacity(requests.len());
        for ((direction, quantile, bound), guess) in requests.into_iter().zip(guesses) {
            let problem = IntervalProblem {
                model: self,
                target,
                direction,
                bestfit: bestfit.clone(),
                guess,
                fixed: fixed.clone(),
                bound,
                critical_quantile: quantile,
                sigma_guess,
                critical_value,
                llr_tolerance,
            };
            let res = objective.minimize(&problem)?;
            let limit = res.get(name).copied().ok_or_else(|| {
                Error::Optimizer(format!("{} returned no value for '{name}'", objective.name()))
            })?;
            log::debug!("{} {direction:?} limit on {name} at quantile {quantile}: {limit}", objective.name());
            limits.push(limit);
        }

        Ok(match (options.kind, limits.as_slice()) {
            (IntervalKind::Upper, [x]) => Interval::Upper { limit: *x },
            (IntervalKind::Lower, [x]) => Interval::Lower { limit: *x },
            (IntervalKind::Central, [lo, hi]) => Interval::Central { low: *lo, high: *hi },
            _ => return Err(Error::Computation("unexpected number of limits".into())),
        })
    }

    /// Best-fit values with standard errors and correlations.
    pub fn summary(
        &self,
        objective: &dyn BestfitObjective,
        options: &SummaryOptions,
    ) -> Result<FitSummary> {
        let bestfit = match &options.bestfit {
            Some(b) => b.clone(),
            None => {
                let opts = BestfitOptions {
                    fix: options.fix.clone(),
                    guess: options.guess.clone(),
                    ..BestfitOptions::default()
                };
                self.bestfit(objective, &opts)?.params
            }
        };
        let mut values = bestfit.values();
        let mut fixed = Vec::with_capacity(options.fix.len());
        for (n, v) in &options.fix {
            let i = self.registry.require(n)?;
            values[i] = *v;
            fixed.push(i);
        }

        let cov = match &options.inverse_hessian {
            Some(c) => c.clone(),
            None => self.inverse_hessian_values(&values, &fixed)?,
        };
        let active = self.active_indices(&fixed);
        if cov.nrows() != active.len() {
            return Err(Error::Invocation(format!(
                "inverse Hessian is {}x{}, expected {} free parameters",
                cov.nrows(),
                cov.ncols(),
                active.len()
            )));
        }
        let (std_errs, correlation) = cov_to_std(&cov)?;

        let names = self.registry.names();
        let entries = names
            .iter()
            .enumerate()
            .map(|(i, n)| SummaryEntry {
                name: n.clone(),
                value: values[i],
                error: active.iter().position(|&a| a == i).map(|k| std_errs[k]),
            })
            .collect();
        Ok(FitSummary {
            entries,
            free: active.iter().map(|&i| names[i].clone()).collect(),
            correlation,
            precision: options.precision,
        })
    }
}

impl LikelihoodModel for LogLikelihood {
    fn parameter_names(&self) -> Vec<String> {
        self.registry.names().to_vec()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.registry.bounds()
    }

    fn minus_ll_grad(&self, params: &[f64], omit: &[usize]) -> Result<(f64, Vec<f64>)> {
        self.registry.to_set(params)?;
        let mut e = self.evaluate(params, &self.active_indices(omit), Order::First)?;
        e.scale(-2.0);
        Ok((e.value, e.gradient))
    }

    fn minus_ll_grad_hessian(
        &self,
        params: &[f64],
        omit: &[usize],
    ) -> Result<(f64, Vec<f64>, Vec<Vec<f64>>)> {
        self.registry.to_set(params)?;
        let mut e = self.evaluate(params, &self.active_indices(omit), Order::Second)?;
        e.scale(-2.0);
        let h = e
            .hessian
            .ok_or_else(|| Error::Computation("second-order evaluation returned no Hessian".into()))?;
        Ok((e.value, e.gradient, h))
    }

    fn cancel_token(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }
}
