/*!
# Extended negative log-likelihood

For a parameter vector `pars` whose first `ns` entries are signal rates, and a
lookup table `LUT[i][j]` holding the density of data event `i` under signal `j`:

\[
\mathrm{NLL} = -\sum_i \log\Big(\sum_j p_j\,\mathrm{LUT}_{ij}\Big)
             + \sum_{j<n_s} p_j
             + \sum_{k:\sigma_k>0} \Big(\frac{p_k - \mu_k}{\sigma_k}\Big)^2
\]

The event sum is the only data-sized part and runs on a [`ParallelKernel`];
the normalization and constraint terms are added once, after the lanes have
been reduced.

A negative rate or a non-positive mixture density anywhere in the data yields
[`NLL_PENALTY`] instead of an error or a NaN.
*/

use crate::error::{FitError, Result};
use crate::kernel::ParallelKernel;

/// Likelihood value returned for parameter vectors outside the physical region.
pub const NLL_PENALTY: f64 = 1e6;

/// Per-event densities, one column per signal (column-major, `n_events` rows).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Lut {
    values: Vec<f64>,
    n_events: usize,
    n_signals: usize,
}

impl Lut {
    pub fn zeros(n_events: usize, n_signals: usize) -> Self {
        Self {
            values: vec![0.0; n_events * n_signals],
            n_events,
            n_signals,
        }
    }

    pub fn n_events(&self) -> usize {
        self.n_events
    }

    pub fn n_signals(&self) -> usize {
        self.n_signals
    }

    pub fn get(&self, event: usize, signal: usize) -> f64 {
        self.values[event + self.n_events * signal]
    }

    pub fn column(&self, signal: usize) -> &[f64] {
        &self.values[signal * self.n_events..(signal + 1) * self.n_events]
    }

    pub fn column_mut(&mut self, signal: usize) -> &mut [f64] {
        &mut self.values[signal * self.n_events..(signal + 1) * self.n_events]
    }

    /// Mixture density of event `i` for the given rates.
    #[inline]
    pub fn density(&self, event: usize, rates: &[f64]) -> f64 {
        rates
            .iter()
            .enumerate()
            .map(|(j, r)| r * self.values[event + self.n_events * j])
            .sum()
    }

    /// The whole table, column after column.
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}

/// Gaussian priors and the rate block size; evaluates the NLL for a LUT.
#[derive(Debug, Clone, PartialEq)]
pub struct NllEngine {
    n_signals: usize,
    means: Vec<f64>,
    sigmas: Vec<f64>,
}

impl NllEngine {
    /// `means` and `sigmas` hold one entry per parameter (rates first). A
    /// non-positive sigma leaves that parameter unconstrained.
    pub fn new(n_signals: usize, means: Vec<f64>, sigmas: Vec<f64>) -> Result<Self> {
        if means.len() != sigmas.len() {
            return Err(FitError::DimensionMismatch(format!(
                "{} prior means but {} prior widths",
                means.len(),
                sigmas.len()
            )));
        }
        if n_signals > means.len() {
            return Err(FitError::DimensionMismatch(format!(
                "{n_signals} signals but only {} parameters",
                means.len()
            )));
        }
        Ok(Self {
            n_signals,
            means,
            sigmas,
        })
    }

    pub fn n_signals(&self) -> usize {
        self.n_signals
    }

    pub fn n_parameters(&self) -> usize {
        self.means.len()
    }

    /// True when every rate is non-negative.
    pub fn rates_valid(&self, pars: &[f64]) -> bool {
        pars[..self.n_signals].iter().all(|&r| r >= 0.0)
    }

    /// The terms that do not depend on the data: rate sum plus Gaussian constraints.
    pub fn global_terms(&self, pars: &[f64]) -> f64 {
        let rates: f64 = pars[..self.n_signals].iter().sum();
        let constraints: f64 = pars
            .iter()
            .zip(self.means.iter().zip(&self.sigmas))
            .filter(|(_, (_, &sigma))| sigma > 0.0)
            .map(|(&x, (&mean, &sigma))| {
                let z = (x - mean) / sigma;
                z * z
            })
            .sum();
        rates + constraints
    }

    /// Evaluates the NLL of `pars` against `lut` on `kernel`.
    ///
    /// # Errors
    /// Fails on a parameter vector or LUT of the wrong size, or when the kernel
    /// cannot complete the reduction. Unphysical parameter values are not errors.
    pub fn evaluate<K: ParallelKernel>(&self, kernel: &K, lut: &Lut, pars: &[f64]) -> Result<f64> {
        if pars.len() != self.n_parameters() {
            return Err(FitError::DimensionMismatch(format!(
                "parameter vector has {} entries, expected {}",
                pars.len(),
                self.n_parameters()
            )));
        }
        if lut.n_signals() != self.n_signals {
            return Err(FitError::DimensionMismatch(format!(
                "LUT has {} signal columns, expected {}",
                lut.n_signals(),
                self.n_signals
            )));
        }
        if !self.rates_valid(pars) {
            return Ok(NLL_PENALTY);
        }

        let event_sum = kernel.event_log_sum(lut, &pars[..self.n_signals])?;
        if !event_sum.is_finite() {
            return Ok(NLL_PENALTY);
        }
        Ok(self.global_terms(pars) - event_sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{CpuKernel, GridKernel};
    use approx::assert_relative_eq;

    fn flat_lut(n_events: usize, values: &[f64]) -> Lut {
        let mut lut = Lut::zeros(n_events, values.len());
        for (j, &v) in values.iter().enumerate() {
            lut.column_mut(j).fill(v);
        }
        lut
    }

    #[test]
    fn test_negative_rate_is_penalised() {
        let engine = NllEngine::new(2, vec![10.0, 10.0, 0.0], vec![0.0, 1.0, 1.0]).unwrap();
        let lut = flat_lut(5, &[0.1, 0.1]);
        let kernel = CpuKernel::new().unwrap();
        for pars in [[-1e-9, 5.0, 0.0], [5.0, -3.0, 100.0], [-10.0, -10.0, -1e9]] {
            assert_eq!(engine.evaluate(&kernel, &lut, &pars).unwrap(), NLL_PENALTY);
        }
    }

    #[test]
    fn test_zero_density_is_penalised() {
        let engine = NllEngine::new(1, vec![1.0], vec![0.0]).unwrap();
        let mut lut = flat_lut(3, &[0.2]);
        lut.column_mut(0)[1] = 0.0;
        let kernel = GridKernel::new(2);
        assert_eq!(engine.evaluate(&kernel, &lut, &[4.0]).unwrap(), NLL_PENALTY);
        // A zero rate makes every density vanish.
        let lut = flat_lut(3, &[0.2]);
        assert_eq!(engine.evaluate(&kernel, &lut, &[0.0]).unwrap(), NLL_PENALTY);
    }

    #[test]
    fn test_value_matches_closed_form() {
        // One signal, flat density 0.1 over 1000 events: NLL = N - 1000 ln(0.1 N).
        let engine = NllEngine::new(1, vec![1000.0], vec![0.0]).unwrap();
        let lut = flat_lut(1000, &[0.1]);
        let kernel = CpuKernel::new().unwrap();
        for n in [500.0, 1000.0, 1500.0] {
            let expected = n - 1000.0 * (0.1f64 * n).ln();
            assert_relative_eq!(
                engine.evaluate(&kernel, &lut, &[n]).unwrap(),
                expected,
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn test_constraints_apply_to_every_parameter_once() {
        let engine = NllEngine::new(1, vec![10.0, 0.5], vec![2.0, 0.25]).unwrap();
        let lut = flat_lut(0, &[0.0]);
        let kernel = GridKernel::new(16);
        // No events: only the rate sum and both constraints remain.
        let nll = engine.evaluate(&kernel, &lut, &[14.0, 1.0]).unwrap();
        assert_relative_eq!(nll, 14.0 + 4.0 + 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_minimum_sits_at_observed_count() {
        let engine = NllEngine::new(1, vec![0.0], vec![0.0]).unwrap();
        let lut = flat_lut(400, &[0.5]);
        let kernel = CpuKernel::new().unwrap();
        let at = |n: f64| engine.evaluate(&kernel, &lut, &[n]).unwrap();
        assert!(at(400.0) < at(380.0));
        assert!(at(400.0) < at(420.0));
    }

    #[test]
    fn test_wrong_sizes_are_errors() {
        let engine = NllEngine::new(1, vec![1.0, 0.0], vec![0.0, 0.0]).unwrap();
        let kernel = CpuKernel::new().unwrap();
        assert!(engine.evaluate(&kernel, &flat_lut(2, &[0.1]), &[1.0]).is_err());
        assert!(engine
            .evaluate(&kernel, &flat_lut(2, &[0.1, 0.1]), &[1.0, 0.0])
            .is_err());
        assert!(NllEngine::new(3, vec![1.0], vec![0.0]).is_err());
    }
}
