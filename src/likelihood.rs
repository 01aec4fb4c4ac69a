/*!
# Mixture likelihood

[`Likelihood`] owns everything one chain needs to turn a parameter vector into
an NLL value: the fit model with one [`EvalHist`] per signal, the compute
kernel, the lookup table of per-event densities and the [`NllEngine`].

An evaluation first rejects negative rates (no rebinning happens for those),
then brings every signal's evaluator up to date, copies the columns that were
rebuilt into the LUT, and hands the LUT to the reduction.
*/

use log::{debug, warn};

use crate::error::{FitError, Result};
use crate::kernel::ParallelKernel;
use crate::model::{FitModel, ParameterLayout};
use crate::nll::{Lut, NllEngine, NLL_PENALTY};
use crate::pdf::EvalHist;
use crate::sample::EventTable;

/// The extended NLL of a [`FitModel`] on one dataset.
#[derive(Debug, Clone)]
pub struct Likelihood<K: ParallelKernel> {
    kernel: K,
    model: FitModel,
    engine: NllEngine,
    lut: Lut,
}

impl<K: ParallelKernel> Likelihood<K> {
    /// Wraps `model` for evaluation on `kernel`. No data is attached yet.
    pub fn new(model: FitModel, kernel: K) -> Result<Self> {
        let layout = &model.layout;
        let engine = NllEngine::new(layout.n_signals, layout.means.clone(), layout.sigmas.clone())?;
        let lut = Lut::zeros(0, layout.n_signals);
        Ok(Self {
            kernel,
            model,
            engine,
            lut,
        })
    }

    /// Uses `data` (one column per observable, in observable order) as the
    /// evaluation points of every signal. Any cached densities are dropped.
    pub fn set_data(&mut self, data: &EventTable) -> Result<()> {
        if data.is_empty() {
            warn!("fitting an empty dataset");
        }
        for signal in &mut self.model.signals {
            signal
                .pdf
                .set_eval_points(data.clone())
                .map_err(|e| FitError::DimensionMismatch(format!("signal '{}': {e}", signal.name)))?;
        }
        self.lut = Lut::zeros(data.n_events(), self.model.signals.len());
        debug!(
            "attached {} data events to {} signals",
            data.n_events(),
            self.model.signals.len()
        );
        Ok(())
    }

    /// Number of data events currently attached.
    pub fn n_events(&self) -> usize {
        self.lut.n_events()
    }

    /// Evaluates the NLL of `pars`.
    ///
    /// # Errors
    /// Fails when `pars` does not match the parameter layout, or when the kernel
    /// cannot complete. Unphysical values give [`NLL_PENALTY`].
    pub fn nll(&mut self, pars: &[f64]) -> Result<f64> {
        if pars.len() != self.engine.n_parameters() {
            return Err(FitError::DimensionMismatch(format!(
                "parameter vector has {} entries, expected {}",
                pars.len(),
                self.engine.n_parameters()
            )));
        }
        if !self.engine.rates_valid(pars) {
            return Ok(NLL_PENALTY);
        }

        for (j, signal) in self.model.signals.iter_mut().enumerate() {
            if signal.pdf.update(&self.kernel, pars)? {
                self.lut.column_mut(j).copy_from_slice(signal.pdf.values());
            }
        }
        self.engine.evaluate(&self.kernel, &self.lut, pars)
    }

    /// The histogram evaluator of signal `j`, for diagnostics.
    pub fn evaluator(&self, j: usize) -> Option<&EvalHist> {
        self.model.signals.get(j).map(|s| &s.pdf)
    }

    pub fn model(&self) -> &FitModel {
        &self.model
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.model.layout
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// The per-event density table as of the last evaluation.
    pub fn lut(&self) -> &Lut {
        &self.lut
    }
}
