//! Summaries of a finished chain: burn-in trimming, posterior moments,
//! credible intervals and one-sided upper limits.
//!
//! All functions work on the rows kept after discarding the first
//! `floor(burnin_fraction * len)` steps.

use log::info;
use ndarray::prelude::*;
use ndarray_stats::interpolate::Linear;
use ndarray_stats::{Quantile1dExt, QuantileExt};
use noisy_float::types::{n64, N64};

use crate::chain::ChainBuffer;
use crate::error::{FitError, Result};

/// Posterior summary of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    /// Central credible interval.
    pub lower: f64,
    pub upper: f64,
}

fn check_fraction(what: &str, f: f64) -> Result<()> {
    if (0.0..1.0).contains(&f) {
        Ok(())
    } else {
        Err(FitError::Config(format!("{what} must lie in [0, 1), got {f}")))
    }
}

/// Number of leading rows treated as burn-in.
pub fn burnin_rows(len: usize, burnin_fraction: f64) -> usize {
    (len as f64 * burnin_fraction).floor() as usize
}

/// The rows kept after burn-in, parameters then NLL.
pub fn trim_burnin(chain: &ChainBuffer, burnin_fraction: f64) -> Result<ArrayView2<'_, f64>> {
    check_fraction("burn-in fraction", burnin_fraction)?;
    let rows = chain.rows();
    let skip = burnin_rows(rows.nrows(), burnin_fraction);
    if skip == rows.nrows() {
        return Err(FitError::Config("no chain rows left after burn-in".into()));
    }
    Ok(rows.slice_move(s![skip.., ..]))
}

/// Linearly interpolated quantile `q` of `values`.
fn quantile(values: ArrayView1<f64>, q: f64) -> Result<f64> {
    if values.iter().any(|v| v.is_nan()) {
        return Err(FitError::Config("cannot take quantiles of NaN samples".into()));
    }
    let mut noisy: Array1<N64> = values.mapv(n64);
    noisy
        .quantile_mut(n64(q), &Linear)
        .map(|v| v.raw())
        .map_err(|e| FitError::Config(format!("quantile {q}: {e}")))
}

/// Mean, spread, median and the central `level` credible interval of every parameter.
pub fn summarize(chain: &ChainBuffer, burnin_fraction: f64, level: f64) -> Result<Vec<ParameterSummary>> {
    check_fraction("credible level", level)?;
    let kept = trim_burnin(chain, burnin_fraction)?;
    let tail = (1.0 - level) / 2.0;

    chain
        .names()
        .iter()
        .enumerate()
        .map(|(k, name)| {
            let column = kept.column(k);
            Ok(ParameterSummary {
                name: name.clone(),
                mean: column.mean().unwrap_or(f64::NAN),
                std: column.std(0.0),
                median: quantile(column, 0.5)?,
                lower: quantile(column, tail)?,
                upper: quantile(column, 1.0 - tail)?,
            })
        })
        .collect()
}

/// One-sided upper limit on parameter `k` at `confidence`.
pub fn upper_limit(chain: &ChainBuffer, k: usize, burnin_fraction: f64, confidence: f64) -> Result<f64> {
    if k >= chain.n_parameters() {
        return Err(FitError::DimensionMismatch(format!(
            "no parameter {k} in a chain of {}",
            chain.n_parameters()
        )));
    }
    check_fraction("confidence", confidence)?;
    let kept = trim_burnin(chain, burnin_fraction)?;
    quantile(kept.column(k), confidence)
}

/// The kept state with the lowest NLL.
pub fn best_fit(chain: &ChainBuffer, burnin_fraction: f64) -> Result<Vec<f64>> {
    let kept = trim_burnin(chain, burnin_fraction)?;
    let nll = kept.column(chain.n_parameters());
    let i = nll
        .argmin()
        .map_err(|e| FitError::Config(format!("no minimum NLL: {e}")))?;
    Ok(kept.row(i).iter().take(chain.n_parameters()).copied().collect())
}

/// Logs one line per parameter.
pub fn log_summary(summaries: &[ParameterSummary], level: f64) {
    for s in summaries {
        info!(
            "  {}: {:.4} +/- {:.4} (median {:.4}, {:.0}% interval [{:.4}, {:.4}])",
            s.name,
            s.mean,
            s.std,
            s.median,
            level * 100.0,
            s.lower,
            s.upper
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Parameter `a` runs 0..n, `b` is constant, NLL decreases then rises.
    fn ramp(n: usize) -> ChainBuffer {
        let mut chain = ChainBuffer::new(vec!["a".into(), "b".into()], n);
        for i in 0..n {
            let x = i as f64;
            chain.push(&[x, 2.0], (x - 60.0).abs()).unwrap();
        }
        chain
    }

    #[test]
    fn test_trim_burnin() {
        let chain = ramp(100);
        let kept = trim_burnin(&chain, 0.25).unwrap();
        assert_eq!(kept.nrows(), 75);
        assert_eq!(kept[[0, 0]], 25.0);
        assert_eq!(trim_burnin(&chain, 0.0).unwrap().nrows(), 100);
        assert!(trim_burnin(&chain, 1.0).is_err());
        assert!(trim_burnin(&ramp(1), 0.9).is_ok());
    }

    #[test]
    fn test_summary_values() {
        let chain = ramp(101);
        let s = summarize(&chain, 0.0, 0.9).unwrap();
        assert_eq!(s.len(), 2);
        assert_relative_eq!(s[0].mean, 50.0);
        assert_relative_eq!(s[0].median, 50.0);
        assert_relative_eq!(s[0].lower, 5.0, epsilon = 1e-9);
        assert_relative_eq!(s[0].upper, 95.0, epsilon = 1e-9);
        assert_relative_eq!(s[1].std, 0.0);
        assert_relative_eq!(s[1].lower, 2.0);
    }

    #[test]
    fn test_upper_limit() {
        let chain = ramp(101);
        assert_relative_eq!(upper_limit(&chain, 0, 0.0, 0.9).unwrap(), 90.0, epsilon = 1e-9);
        assert!(upper_limit(&chain, 5, 0.0, 0.9).is_err());
        assert!(upper_limit(&chain, 0, 0.0, 1.5).is_err());
    }

    #[test]
    fn test_best_fit_is_lowest_nll() {
        let chain = ramp(100);
        assert_eq!(best_fit(&chain, 0.1).unwrap(), vec![60.0, 2.0]);
    }
}
