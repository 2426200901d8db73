//! Maximum-likelihood fits of small likelihoods with known optima.

use approx::assert_relative_eq;
use rf_core::ParamSpec;
use rf_inference::{LbfgsBestfit, MinimizerConfig};
use rf_unbinned::{
    BestfitOptions, EventTable, FlatSource, GaussianConstraint, GaussianSource, LikelihoodConfig,
    LogLikelihood, SummaryOptions,
};

fn config() -> LikelihoodConfig {
    LikelihoodConfig { n_trials: 500, ..LikelihoodConfig::default() }
}

// ll(m) = 5 ln(m) - 10 m: m_hat = 0.5, var = m_hat^2 / 5
fn counting() -> LogLikelihood {
    let data = EventTable::from_columns([("x".to_string(), vec![1.0, 2.0, 3.0, 4.0, 5.0])]).unwrap();
    LogLikelihood::builder()
        .source("flat", FlatSource::new("x", 10.0, 0.0, 10.0).unwrap())
        .free_rate("flat")
        .data(data)
        .config(config())
        .build()
        .unwrap()
}

// ll = -3 - 0.5 ((mean - 0.5) / 2)^2 - 0.5 ((sigma - 1.5) / 0.5)^2
fn constrained() -> LogLikelihood {
    let constraint = GaussianConstraint::new()
        .with("mean", 0.5, 2.0)
        .and_then(|c| c.with("sigma", 1.5, 0.5))
        .unwrap();
    LogLikelihood::builder()
        .source("peak", GaussianSource::new("x", 3.0, 0.0, 1.0).unwrap())
        .common_param("mean", ParamSpec::new(-5.0, 5.0, 3))
        .common_param("sigma", ParamSpec::new(0.5, 3.0, 3))
        .log_constraint(constraint)
        .config(config())
        .build()
        .unwrap()
}

#[test]
fn test_counting_fit_and_error() {
    let lf = counting();
    let opts = BestfitOptions { return_errors: true, llr_tolerance: 1e-4, ..BestfitOptions::default() };
    let res = lf.bestfit(&LbfgsBestfit::default(), &opts).unwrap();
    assert_relative_eq!(res.params.get("flat_rate_multiplier").unwrap(), 0.5, epsilon = 1e-3);
    let err = res.errors["error_flat_rate_multiplier"];
    assert_relative_eq!(err, 0.05_f64.sqrt(), epsilon = 1e-3);
}

#[test]
fn test_constrained_fit_recovers_means_and_widths() {
    let lf = constrained();
    let opts = BestfitOptions { return_errors: true, ..BestfitOptions::default() };
    let res = lf.bestfit(&LbfgsBestfit::default(), &opts).unwrap();
    assert_relative_eq!(res.params.get("mean").unwrap(), 0.5, epsilon = 1e-4);
    assert_relative_eq!(res.params.get("sigma").unwrap(), 1.5, epsilon = 1e-4);
    assert_relative_eq!(res.errors["error_mean"], 2.0, epsilon = 1e-6);
    assert_relative_eq!(res.errors["error_sigma"], 0.5, epsilon = 1e-6);
}

#[test]
fn test_fit_without_newton_step() {
    let lf = constrained();
    let opts = BestfitOptions { use_hessian: false, llr_tolerance: 1e-6, ..BestfitOptions::default() };
    let res = lf.bestfit(&LbfgsBestfit::new(MinimizerConfig::default()), &opts).unwrap();
    assert_relative_eq!(res.params.get("mean").unwrap(), 0.5, epsilon = 1e-2);
    assert_relative_eq!(res.params.get("sigma").unwrap(), 1.5, epsilon = 1e-2);
    assert!(res.errors.is_empty());
}

#[test]
fn test_fixed_parameter_stays_put() {
    let lf = constrained();
    let opts = BestfitOptions {
        fix: vec![("sigma".into(), 2.0)],
        return_errors: true,
        ..BestfitOptions::default()
    };
    let res = lf.bestfit(&LbfgsBestfit::default(), &opts).unwrap();
    assert_eq!(res.params.get("sigma"), Some(2.0));
    assert_relative_eq!(res.params.get("mean").unwrap(), 0.5, epsilon = 1e-4);
    assert!(res.errors.contains_key("error_mean"));
    assert!(!res.errors.contains_key("error_sigma"));
}

#[test]
fn test_summary_after_fit() {
    let lf = constrained();
    let s = lf.summary(&LbfgsBestfit::default(), &SummaryOptions::default()).unwrap();
    assert_relative_eq!(s.error("mean").unwrap(), 2.0, epsilon = 1e-6);
    assert_relative_eq!(s.error("sigma").unwrap(), 0.5, epsilon = 1e-6);
    assert_relative_eq!(s.correlation()[(0, 1)], 0.0, epsilon = 1e-9);
    let text = s.to_string();
    assert!(text.contains("mean: 0.5 +- 2"), "{text}");
}
