//! Batch accumulator: the terms a likelihood evaluation is made of.
//!
//! ```text
//! ll = sum_d sum_b  sum_{k < n_b} ln( sum_s m_s * r_s[b, k] )      (BatchTerm, per batch)
//!    - sum_d mu(d) + log_constraint(params)                          (GlobalTerm, once)
//! ```
//!
//! `n_b` is the batch size, except for the last batch of a dataset where the padding rows
//! are dropped. Keeping the global term separate means datasets without events still
//! contribute their expected count, and nothing is added twice.

use crate::differentiable::TapeFunction;
use crate::likelihood::LogLikelihood;
use crate::source::ParamValues;
use rf_ad::{Tape, Var};
use rf_core::{Error, Result};

/// `Σ_{k<n} ln(Σ_s m_s · r_s[k])` for one batch of one dataset.
pub struct BatchTerm<'a> {
    pub(crate) likelihood: &'a LogLikelihood,
    pub(crate) dataset: usize,
    pub(crate) i_batch: usize,
}

/// `−Σ_d mu(d) + log_constraint(params)`.
pub struct GlobalTerm<'a> {
    pub(crate) likelihood: &'a LogLikelihood,
}

impl LogLikelihood {
    /// Parameter nodes for source `si`: registry inputs where exposed, defaults otherwise.
    pub(crate) fn source_vars(&self, tape: &mut Tape, si: usize, inputs: &[Var]) -> ParamValues<Var> {
        let entry = &self.sources[si];
        entry
            .source
            .defaults()
            .iter()
            .map(|(name, &default)| {
                let v = match self.registry.index_of(name) {
                    Some(i) => inputs[i],
                    None => tape.constant(default),
                };
                (name.clone(), v)
            })
            .collect()
    }

    /// Plain-value counterpart of [`source_vars`](Self::source_vars).
    pub(crate) fn source_values(&self, si: usize, values: &[f64]) -> ParamValues<f64> {
        self.sources[si]
            .source
            .defaults()
            .iter()
            .map(|(name, &default)| {
                let v = self.registry.index_of(name).map_or(default, |i| values[i]);
                (name.clone(), v)
            })
            .collect()
    }

    // `x * m_s` when the source's rate is free.
    fn apply_rate_multiplier(&self, tape: &mut Tape, si: usize, inputs: &[Var], x: Var) -> Var {
        match self.registry.rate_multiplier_index(&self.sources[si].name) {
            Some(i) => tape.mul(x, inputs[i]),
            None => x,
        }
    }

    pub(crate) fn record_batch(
        &self,
        tape: &mut Tape,
        di: usize,
        i_batch: usize,
        inputs: &[Var],
    ) -> Result<Var> {
        let dataset = &self.datasets[di];
        let batching = dataset.batching;
        if i_batch >= batching.n_batches {
            return Err(Error::Validation(format!(
                "batch {i_batch} out of range for dataset '{}' ({} batches)",
                dataset.name, batching.n_batches
            )));
        }

        let mut total: Option<Vec<Var>> = None;
        for &si in &dataset.sources {
            let params = self.source_vars(tape, si, inputs);
            let rates = self.sources[si].source.differential_rate(tape, i_batch, &params)?;
            if rates.len() != batching.batch_size {
                return Err(Error::Validation(format!(
                    "source '{}' returned {} rates for a batch of {}",
                    self.sources[si].name,
                    rates.len(),
                    batching.batch_size
                )));
            }
            let scaled: Vec<Var> = rates
                .into_iter()
                .map(|r| self.apply_rate_multiplier(tape, si, inputs, r))
                .collect();
            total = Some(match total {
                None => scaled,
                Some(acc) => acc.into_iter().zip(scaled).map(|(a, b)| tape.add(a, b)).collect(),
            });
        }

        let Some(total) = total else {
            return Ok(tape.constant(0.0));
        };
        let n = batching.effective_len(i_batch);
        let logs: Vec<Var> = total[..n].iter().map(|&r| tape.ln(r)).collect();
        Ok(tape.sum(&logs))
    }

    pub(crate) fn record_dataset_mu(&self, tape: &mut Tape, di: usize, inputs: &[Var]) -> Result<Var> {
        let mut terms = Vec::with_capacity(self.datasets[di].sources.len());
        for &si in &self.datasets[di].sources {
            let params = self.source_vars(tape, si, inputs);
            let mu = self.sources[si].mu_itp.record(tape, &params)?;
            terms.push(self.apply_rate_multiplier(tape, si, inputs, mu));
        }
        Ok(tape.sum(&terms))
    }

    pub(crate) fn record_global(&self, tape: &mut Tape, inputs: &[Var]) -> Result<Var> {
        let mut mus = Vec::with_capacity(self.datasets.len());
        for di in 0..self.datasets.len() {
            mus.push(self.record_dataset_mu(tape, di, inputs)?);
        }
        let total_mu = tape.sum(&mus);
        let named: ParamValues<Var> =
            self.registry.names().iter().cloned().zip(inputs.iter().copied()).collect();
        let constraint = self.constraint.record(tape, &named)?;
        Ok(tape.sub(constraint, total_mu))
    }
}

impl TapeFunction for BatchTerm<'_> {
    fn record(&self, tape: &mut Tape, inputs: &[Var]) -> Result<Var> {
        self.likelihood.record_batch(tape, self.dataset, self.i_batch, inputs)
    }
}

impl TapeFunction for GlobalTerm<'_> {
    fn record(&self, tape: &mut Tape, inputs: &[Var]) -> Result<Var> {
        self.likelihood.record_global(tape, inputs)
    }
}
