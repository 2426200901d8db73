//! Parameter registry: one ordered, named parameter vector for the whole likelihood.

use crate::source::ParamValues;
use rf_core::{
    Error, LOWER_RATE_MULTIPLIER_BOUND, ParamSpec, Result, is_rate_multiplier,
    rate_multiplier_name,
};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered name -> value mapping in registry order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSet {
    entries: Vec<(String, f64)>,
}

impl ParamSet {
    /// Values in registry order.
    pub fn values(&self) -> Vec<f64> {
        self.entries.iter().map(|(_, v)| *v).collect()
    }

    /// Names in registry order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Value of `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// `(name, value)` pairs in registry order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Borrowed `(name, value)` pairs, the form accepted by the likelihood's named calls.
    pub fn as_pairs(&self) -> Vec<(&str, f64)> {
        self.iter().collect()
    }

    /// Unordered map view.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.entries.iter().cloned().collect()
    }
}

impl fmt::Display for ParamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(n, v)| format!("{n}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Registry of the likelihood's parameters.
///
/// Order: rate multipliers of the free-rate sources (in the order given), then the shared
/// parameters (in declaration order).
#[derive(Debug, Clone)]
pub struct ParameterRegistry {
    names: Vec<String>,
    defaults: Vec<f64>,
    index: BTreeMap<String, usize>,
    rate_multipliers: BTreeMap<String, usize>,
    source_params: BTreeMap<String, Vec<usize>>,
    specs: Vec<(String, ParamSpec)>,
}

impl ParameterRegistry {
    /// Build the registry from each source's defaults, the free-rate sources and the
    /// shared parameter declarations.
    pub fn new(
        sources: &[(&str, &ParamValues<f64>)],
        free_rates: &[String],
        common: &[(String, ParamSpec)],
    ) -> Result<Self> {
        let mut seen = BTreeMap::new();
        for (name, _) in sources {
            if seen.insert(*name, ()).is_some() {
                return Err(Error::Config(format!("duplicate source name '{name}'")));
            }
        }

        let mut names = Vec::new();
        let mut defaults = Vec::new();
        let mut rate_multipliers = BTreeMap::new();

        for sname in free_rates {
            if !seen.contains_key(sname.as_str()) {
                return Err(Error::Config(format!(
                    "free rate requested for unknown source '{sname}'"
                )));
            }
            if rate_multipliers.contains_key(sname) {
                return Err(Error::Config(format!("free rate for '{sname}' requested twice")));
            }
            rate_multipliers.insert(sname.clone(), names.len());
            names.push(rate_multiplier_name(sname));
            defaults.push(1.0);
        }

        let mut specs = Vec::with_capacity(common.len());
        for (pname, spec) in common {
            spec.validate(pname)?;
            if is_rate_multiplier(pname) {
                return Err(Error::Config(format!(
                    "shared parameter '{pname}' clashes with the rate multiplier naming scheme"
                )));
            }
            if names.contains(pname) {
                return Err(Error::Config(format!("shared parameter '{pname}' declared twice")));
            }
            let mut default: Option<(f64, &str)> = None;
            for (sname, sdefaults) in sources {
                let Some(&d) = sdefaults.get(pname) else { continue };
                match default {
                    Some((prev, prev_source)) if prev != d => {
                        return Err(Error::Config(format!(
                            "inconsistent defaults for shared parameter '{pname}': \
                             {prev} (source '{prev_source}') vs {d} (source '{sname}')"
                        )));
                    }
                    Some(_) => {}
                    None => default = Some((d, *sname)),
                }
            }
            let Some((d, _)) = default else {
                return Err(Error::Config(format!(
                    "shared parameter '{pname}' is not recognized by any source"
                )));
            };
            names.push(pname.clone());
            defaults.push(d);
            specs.push((pname.clone(), *spec));
        }

        let index: BTreeMap<String, usize> =
            names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();

        let source_params = sources
            .iter()
            .map(|(sname, sdefaults)| {
                let idx = names
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| !is_rate_multiplier(n) && sdefaults.contains_key(*n))
                    .map(|(i, _)| i)
                    .collect();
                (sname.to_string(), idx)
            })
            .collect();

        Ok(Self { names, defaults, index, rate_multipliers, source_params, specs })
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names in registry order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Defaults in registry order.
    pub fn defaults(&self) -> &[f64] {
        &self.defaults
    }

    /// Bounds: rate multipliers are floored at [`LOWER_RATE_MULTIPLIER_BOUND`], the rest are free.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.names
            .iter()
            .map(|n| {
                if is_rate_multiplier(n) {
                    (LOWER_RATE_MULTIPLIER_BOUND, f64::INFINITY)
                } else {
                    (f64::NEG_INFINITY, f64::INFINITY)
                }
            })
            .collect()
    }

    /// Index of `name`, if registered.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Index of `name`, or an invocation error.
    pub fn require(&self, name: &str) -> Result<usize> {
        self.index_of(name)
            .ok_or_else(|| Error::Invocation(format!("Unknown parameter {name}")))
    }

    /// Indices of several names.
    pub fn require_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<usize>> {
        names.iter().map(|n| self.require(n.as_ref())).collect()
    }

    /// Index of the rate multiplier of `source`, if its rate is free.
    pub fn rate_multiplier_index(&self, source: &str) -> Option<usize> {
        self.rate_multipliers.get(source).copied()
    }

    /// Registry indices of the non-rate parameters `source` recognizes.
    pub fn source_param_indices(&self, source: &str) -> &[usize] {
        self.source_params.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Names of the non-rate parameters `source` recognizes.
    pub fn source_kwargnames(&self, source: &str) -> Vec<&str> {
        self.source_param_indices(source).iter().map(|&i| self.names[i].as_str()).collect()
    }

    /// Shared parameter declarations recognized by `source`.
    pub fn source_specs(&self, source: &str) -> Vec<(String, ParamSpec)> {
        let names = self.source_kwargnames(source);
        self.specs.iter().filter(|(n, _)| names.contains(&n.as_str())).cloned().collect()
    }

    /// The defaults as a [`ParamSet`].
    pub fn default_set(&self) -> ParamSet {
        ParamSet {
            entries: self.names.iter().cloned().zip(self.defaults.iter().copied()).collect(),
        }
    }

    /// Defaults overridden by `overrides`. Unknown names are invocation errors.
    pub fn prepare(&self, overrides: &[(&str, f64)]) -> Result<ParamSet> {
        let mut values = self.defaults.clone();
        for &(name, v) in overrides {
            values[self.require(name)?] = v;
        }
        self.to_set(&values)
    }

    /// Pair a registry-ordered vector with the names.
    pub fn to_set(&self, values: &[f64]) -> Result<ParamSet> {
        if values.len() != self.names.len() {
            return Err(Error::Invocation(format!(
                "expected {} parameter values, got {}",
                self.names.len(),
                values.len()
            )));
        }
        Ok(ParamSet { entries: self.names.iter().cloned().zip(values.iter().copied()).collect() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults(pairs: &[(&str, f64)]) -> ParamValues<f64> {
        pairs.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    fn spec() -> ParamSpec {
        ParamSpec::new(0.0, 10.0, 3)
    }

    #[test]
    fn test_order_rate_multipliers_then_shared() {
        let sig = defaults(&[("mean", 5.0), ("sigma", 1.0)]);
        let bkg = defaults(&[("slope", 2.0)]);
        let reg = ParameterRegistry::new(
            &[("sig", &sig), ("bkg", &bkg)],
            &["bkg".to_string(), "sig".to_string()],
            &[("slope".to_string(), spec()), ("mean".to_string(), spec())],
        )
        .unwrap();
        assert_eq!(
            reg.names(),
            &["bkg_rate_multiplier", "sig_rate_multiplier", "slope", "mean"]
        );
        assert_eq!(reg.defaults(), &[1.0, 1.0, 2.0, 5.0]);
        assert_eq!(reg.rate_multiplier_index("sig"), Some(1));
        assert_eq!(reg.source_kwargnames("sig"), vec!["mean"]);
        assert_eq!(reg.source_kwargnames("bkg"), vec!["slope"]);
        assert_eq!(reg.source_specs("sig").len(), 1);
        let b = reg.bounds();
        assert_eq!(b[0].0, LOWER_RATE_MULTIPLIER_BOUND);
        assert_eq!(b[2].0, f64::NEG_INFINITY);
    }

    #[test]
    fn test_shared_default_must_agree() {
        let a = defaults(&[("t", 1.0)]);
        let b = defaults(&[("t", 2.0)]);
        let err =
            ParameterRegistry::new(&[("a", &a), ("b", &b)], &[], &[("t".to_string(), spec())])
                .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");

        let c = defaults(&[("t", 1.0)]);
        assert!(
            ParameterRegistry::new(&[("a", &a), ("c", &c)], &[], &[("t".to_string(), spec())])
                .is_ok()
        );
    }

    #[test]
    fn test_configuration_errors() {
        let a = defaults(&[("t", 1.0)]);
        let cases = [
            ParameterRegistry::new(&[("a", &a), ("a", &a)], &[], &[]),
            ParameterRegistry::new(&[("a", &a)], &["nope".to_string()], &[]),
            ParameterRegistry::new(&[("a", &a)], &["a".to_string(), "a".to_string()], &[]),
            ParameterRegistry::new(&[("a", &a)], &[], &[("u".to_string(), spec())]),
            ParameterRegistry::new(&[("a", &a)], &[], &[("t".to_string(), ParamSpec::new(1.0, 0.0, 3))]),
        ];
        for c in cases {
            assert!(matches!(c, Err(Error::Config(_))), "got {c:?}");
        }
    }

    #[test]
    fn test_prepare_and_round_trip() {
        let a = defaults(&[("t", 1.0)]);
        let reg =
            ParameterRegistry::new(&[("a", &a)], &["a".to_string()], &[("t".to_string(), spec())])
                .unwrap();
        let p = reg.prepare(&[("t", 4.0)]).unwrap();
        assert_eq!(p.values(), vec![1.0, 4.0]);
        assert_eq!(p.get("t"), Some(4.0));
        assert!(matches!(reg.prepare(&[("zz", 0.0)]), Err(Error::Invocation(_))));
        assert!(matches!(reg.to_set(&[1.0]), Err(Error::Invocation(_))));

        let d = reg.prepare(&[]).unwrap();
        assert_eq!(d, reg.default_set());
        assert_eq!(reg.to_set(&d.values()).unwrap(), d);
        assert_eq!(d.to_string(), "{a_rate_multiplier=1, t=1}");
    }
}
