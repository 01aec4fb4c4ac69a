//! Poisson-fluctuated fake datasets drawn from the signal samples.
//!
//! For each signal, `n ~ Poisson(nexpected)` events are picked uniformly, with
//! replacement, from the signal's sample and reduced to the observable fields.

use log::debug;
use rand::prelude::*;
use rand_distr::Poisson;

use crate::core::DatasetGenerator;
use crate::error::{FitError, Result};
use crate::kernel::ParallelKernel;
use crate::model::FitModel;
use crate::sample::EventTable;

#[derive(Debug, Clone, PartialEq)]
struct Component {
    name: String,
    nexpected: f64,
    /// Sample events, observable columns only.
    events: EventTable,
}

/// Fake-data generator for a [`FitModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoissonFakeData {
    components: Vec<Component>,
    n_observables: usize,
}

impl PoissonFakeData {
    /// Draws from the untransformed samples.
    pub fn new(model: &FitModel) -> Result<Self> {
        let fields: Vec<usize> = model.observables.iter().map(|o| o.field_index).collect();
        let components = model
            .signals
            .iter()
            .map(|s| {
                Ok(Component {
                    name: s.name.clone(),
                    nexpected: s.nexpected,
                    events: s.pdf.sample().select(&fields)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            components,
            n_observables: fields.len(),
        })
    }

    /// Draws from the samples after every systematic has been applied at its
    /// prior mean.
    pub fn at_prior_means<K: ParallelKernel>(model: &FitModel, kernel: &K) -> Result<Self> {
        let fields: Vec<usize> = model.observables.iter().map(|o| o.field_index).collect();
        let syst: Vec<f64> = model.systematics.iter().map(|s| s.mean).collect();
        let components = model
            .signals
            .iter()
            .map(|s| {
                let sample = s.pdf.sample();
                let moved = EventTable::new(s.pdf.transform_sample(kernel, &syst), sample.n_fields())?;
                Ok(Component {
                    name: s.name.clone(),
                    nexpected: s.nexpected,
                    events: moved.select(&fields)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            components,
            n_observables: fields.len(),
        })
    }

    /// Multiplies every expectation by `factor`.
    pub fn scaled(mut self, factor: f64) -> Self {
        for c in &mut self.components {
            c.nexpected *= factor;
        }
        self
    }
}

impl DatasetGenerator for PoissonFakeData {
    fn generate(&self, rng: &mut SmallRng) -> Result<EventTable> {
        let mut data = EventTable::empty(self.n_observables);
        for c in &self.components {
            if c.nexpected <= 0.0 {
                continue;
            }
            let poisson = Poisson::new(c.nexpected).map_err(|e| {
                FitError::Config(format!("signal '{}': cannot fluctuate {}: {e}", c.name, c.nexpected))
            })?;
            let n = rng.sample(poisson) as usize;
            if n > 0 && c.events.is_empty() {
                return Err(FitError::Config(format!(
                    "signal '{}' has no sample events to draw from",
                    c.name
                )));
            }
            for _ in 0..n {
                let i = rng.gen_range(0..c.events.n_events());
                data.push_row(c.events.row(i))?;
            }
            debug!("fake data: {n} events of '{}'", c.name);
        }
        Ok(data)
    }
}
