//! Session pricing via a statistical power calculation.
//!
//! The price of joining a session is the number of data points a client must
//! contribute. It is derived from the standardized mean difference (Cohen's
//! d) between a benchmark's baseline metric and the performance the admin
//! claims for the proposed model: the smaller the expected improvement, the
//! more data is needed to detect it, and the higher the price.

pub mod shape;

use std::f64::consts::SQRT_2;

use statrs::function::erf::erf_inv;
use thiserror::Error;

use crate::storage::Benchmark;

pub use shape::ShapeError;

/// Errors raised while pricing a session. All of them abort session creation
/// before any client is invited.
#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("federated_info is missing or has a non-numeric `{0}` field")]
    MissingStatistic(&'static str),
    #[error("federated_info has no `benchmark_id` field")]
    MissingBenchmarkId,
    #[error("benchmark has no `{0}` metric")]
    MissingBaselineMetric(String),
    #[error(transparent)]
    InvalidShape(#[from] ShapeError),
    #[error("effect size is zero, the required sample size is undefined")]
    ZeroEffectSize,
}

/// Standardized mean difference (Cohen's d) between two independent samples,
/// using the pooled standard deviation `sqrt((s1² + s2²) / 2)`.
///
/// A zero pooled standard deviation yields an effect size of zero.
pub fn cohens_d(baseline_mean: f64, baseline_std: f64, new_mean: f64, new_std: f64) -> f64 {
    let pooled_std = ((baseline_std.powi(2) + new_std.powi(2)) / 2.0).sqrt();
    if pooled_std == 0.0 {
        0.0
    } else {
        (new_mean - baseline_mean) / pooled_std
    }
}

/// Required per-group sample size for a two-sided two-sample comparison to
/// reach `power` at significance level `alpha`, given the effect size.
///
/// Uses the standard normal approximation
/// `n = 2 * ((z_{1-alpha/2} + z_{power}) / |d|)²`, rounded up to the next
/// integer.
///
/// # Errors
/// An effect size of exactly zero has no defined sample size and fails with
/// [`PricingError::ZeroEffectSize`].
pub fn required_sample_size(effect_size: f64, alpha: f64, power: f64) -> Result<u64, PricingError> {
    if effect_size == 0.0 {
        return Err(PricingError::ZeroEffectSize);
    }
    let z_alpha = normal_quantile(1.0 - alpha / 2.0);
    let z_power = normal_quantile(power);
    let samples = 2.0 * ((z_alpha + z_power) / effect_size.abs()).powi(2);
    Ok(samples.ceil() as u64)
}

/// Quantile of the standard normal distribution.
fn normal_quantile(p: f64) -> f64 {
    SQRT_2 * erf_inv(2.0 * p - 1.0)
}

/// Computes a session's price in required data points.
///
/// The candidate statistics (`std_mean`, `std_deviation`) and the model's
/// input shape come from the admin-supplied `federated_info`; the baseline
/// comes from the benchmark's primary metric. The significance level is
/// Bonferroni-corrected by the number of predictors implied by the input
/// shape.
pub fn session_price(
    federated_info: &serde_json::Value,
    benchmark: &Benchmark,
    alpha: f64,
    power: f64,
) -> Result<u64, PricingError> {
    let new_mean = statistic(federated_info, "std_mean")?;
    let new_std = statistic(federated_info, "std_deviation")?;

    let shape_descriptor = federated_info
        .pointer("/model_info/input_shape")
        .ok_or(ShapeError::UnsupportedDescriptor)?;
    let predictors: u64 = shape::parse_input_shape(shape_descriptor)?.iter().product();

    let baseline = benchmark
        .metrics
        .get(&benchmark.benchmark_metric)
        .ok_or_else(|| PricingError::MissingBaselineMetric(benchmark.benchmark_metric.clone()))?;

    let effect_size = cohens_d(baseline.mean, baseline.std_dev, new_mean, new_std);
    let adjusted_alpha = alpha / predictors as f64;
    required_sample_size(effect_size, adjusted_alpha, power)
}

/// Reads the benchmark reference out of `federated_info`.
pub fn benchmark_id(federated_info: &serde_json::Value) -> Result<&str, PricingError> {
    federated_info
        .get("benchmark_id")
        .and_then(|id| id.as_str())
        .ok_or(PricingError::MissingBenchmarkId)
}

fn statistic(
    federated_info: &serde_json::Value,
    field: &'static str,
) -> Result<f64, PricingError> {
    federated_info
        .get(field)
        .and_then(|value| value.as_f64())
        .ok_or(PricingError::MissingStatistic(field))
}
