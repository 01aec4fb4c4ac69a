/*!
# Metropolis sampler

A random-walk Metropolis chain over the fit parameters. Every step is one
pass through three explicit phases:

1. **Propose**: `proposed[k] = current[k] + width[k] * N(0, 1)`, each
   parameter drawing from its own RNG lane. A width of zero holds the
   parameter and consumes no random number.
2. **Evaluate**: the [`Likelihood`] of the proposal (histograms are only
   rebuilt when a bound systematic moved).
3. **Decide**: accept when `nll_p < nll_c` or `u <= exp(nll_c - nll_p)`, with
   `u` from the decision lane. The (possibly unchanged) current state and its
   NLL are then appended to the [`ChainBuffer`], so the buffer gets exactly
   one row per step.

All lanes are seeded from one root seed, so a chain is reproducible bit for
bit given the seed, the starting vector, the data and the kernel.

## Example

```rust
use sxfit::core::MarkovChain;
use sxfit::kernel::CpuKernel;
use sxfit::likelihood::Likelihood;
use sxfit::model::{FitModel, Observable, SignalSpec};
use sxfit::sample::EventTable;
use sxfit::sampler::MetropolisSampler;

let sample = EventTable::new((0..100).map(|i| i as f64 / 10.0 + 0.05).collect(), 1).unwrap();
let observable = Observable {
    name: "e".into(), title: "Energy".into(), field: "energy".into(),
    field_index: 0, bins: 10, lower: 0.0, upper: 10.0,
};
let signal = SignalSpec {
    name: "flat".into(), title: "Flat".into(), nexpected: 20.0, sigma: 0.0, sample: sample.clone(),
};
let model = FitModel::new(vec![observable], vec![], vec![signal]).unwrap();
let start = model.initial_parameters();

let mut likelihood = Likelihood::new(model, CpuKernel::new().unwrap()).unwrap();
likelihood.set_data(&sample).unwrap();

let mut sampler = MetropolisSampler::new(likelihood, &start, 50).unwrap().set_seed(42);
for _ in 0..50 {
    sampler.step().unwrap();
}
assert_eq!(sampler.chain().len(), 50);
```
*/

use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::Deserialize;

use crate::chain::ChainBuffer;
use crate::core::MarkovChain;
use crate::error::{FitError, Result};
use crate::kernel::{KernelSpec, ParallelKernel};
use crate::likelihood::Likelihood;

/// Where a sampler is inside its step cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Propose,
    Evaluate,
    Decide,
}

/// Runtime knobs of a fit that are not part of the physics configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct SamplerOptions {
    /// Root seed; drawn at random when absent.
    pub seed: Option<u64>,
    pub kernel: KernelSpec,
    /// Overrides the default jump width of each parameter.
    pub widths: Option<Vec<f64>>,
    /// Show progress bars while sampling.
    pub progress: bool,
}

impl SamplerOptions {
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn set_kernel(mut self, kernel: KernelSpec) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn set_widths(mut self, widths: Vec<f64>) -> Self {
        self.widths = Some(widths);
        self
    }

    pub fn set_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}

/// Final state of a chain: the stored rows and how many proposals were accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainRun {
    pub chain: ChainBuffer,
    pub accepted: usize,
    pub seed: u64,
}

impl ChainRun {
    /// Fraction of steps whose proposal was accepted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.chain.is_empty() {
            0.0
        } else {
            self.accepted as f64 / self.chain.len() as f64
        }
    }
}

/// A single Metropolis chain over a [`Likelihood`].
#[derive(Debug, Clone)]
pub struct MetropolisSampler<K: ParallelKernel> {
    likelihood: Likelihood<K>,
    widths: Vec<f64>,
    current: Vec<f64>,
    proposed: Vec<f64>,
    nll_current: f64,
    nll_proposed: f64,
    phase: Phase,
    /// One RNG per parameter.
    lanes: Vec<SmallRng>,
    decision: SmallRng,
    seed: u64,
    accepted: usize,
    chain: ChainBuffer,
}

fn seeded_lanes(seed: u64, n: usize) -> (Vec<SmallRng>, SmallRng) {
    let mut root = SmallRng::seed_from_u64(seed);
    let lanes = (0..n).map(|_| SmallRng::seed_from_u64(root.gen())).collect();
    let decision = SmallRng::seed_from_u64(root.gen());
    (lanes, decision)
}

impl<K: ParallelKernel> MetropolisSampler<K> {
    /// Starts a chain at `initial` with room for `n_steps` steps. The likelihood
    /// must already hold its data; the starting NLL is evaluated here, once.
    ///
    /// Jump widths default to the model's [`crate::model::ParameterLayout`]
    /// widths and the seed is random until [`MetropolisSampler::set_seed`].
    pub fn new(mut likelihood: Likelihood<K>, initial: &[f64], n_steps: usize) -> Result<Self> {
        let layout = likelihood.layout();
        if initial.len() != layout.len() {
            return Err(FitError::DimensionMismatch(format!(
                "starting vector has {} entries, the model has {} parameters",
                initial.len(),
                layout.len()
            )));
        }
        let widths = layout.widths.clone();
        let chain = ChainBuffer::new(layout.names.clone(), n_steps);
        let nll_current = likelihood.nll(initial)?;

        let seed = thread_rng().gen::<u64>();
        let (lanes, decision) = seeded_lanes(seed, initial.len());
        Ok(Self {
            likelihood,
            widths,
            current: initial.to_vec(),
            proposed: initial.to_vec(),
            nll_current,
            nll_proposed: nll_current,
            phase: Phase::Propose,
            lanes,
            decision,
            seed,
            accepted: 0,
            chain,
        })
    }

    /// Reseeds every lane from `seed`.
    pub fn set_seed(mut self, seed: u64) -> Self {
        let (lanes, decision) = seeded_lanes(seed, self.current.len());
        self.seed = seed;
        self.lanes = lanes;
        self.decision = decision;
        self
    }

    /// Replaces the jump widths. Zero holds a parameter fixed.
    ///
    /// # Errors
    /// Fails on a length mismatch or a negative or non-finite width.
    pub fn set_widths(mut self, widths: &[f64]) -> Result<Self> {
        if widths.len() != self.current.len() {
            return Err(FitError::DimensionMismatch(format!(
                "{} jump widths for {} parameters",
                widths.len(),
                self.current.len()
            )));
        }
        if let Some(w) = widths.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
            return Err(FitError::Config(format!("invalid jump width {w}")));
        }
        self.widths = widths.to_vec();
        Ok(self)
    }

    /// Applies the seed and width overrides of `options`.
    pub fn with_options(self, options: &SamplerOptions) -> Result<Self> {
        let sampler = match options.seed {
            Some(seed) => self.set_seed(seed),
            None => self,
        };
        match &options.widths {
            Some(widths) => sampler.set_widths(widths),
            None => Ok(sampler),
        }
    }

    /// Draws every parameter's jump from its own lane, one kernel lane per
    /// parameter.
    fn propose(&mut self) {
        debug_assert_eq!(self.phase, Phase::Propose);
        let (current, widths) = (&self.current, &self.widths);
        let mut jobs: Vec<(&mut SmallRng, &mut f64)> =
            self.lanes.iter_mut().zip(self.proposed.iter_mut()).collect();
        self.likelihood.kernel().for_each_chunk(&mut jobs, 1, |k, job| {
            let (lane, out) = &mut job[0];
            **out = if widths[k] > 0.0 {
                let z: f64 = lane.sample(StandardNormal);
                current[k] + widths[k] * z
            } else {
                current[k]
            };
        });
        self.phase = Phase::Evaluate;
    }

    fn evaluate(&mut self) -> Result<()> {
        debug_assert_eq!(self.phase, Phase::Evaluate);
        self.nll_proposed = self.likelihood.nll(&self.proposed)?;
        self.phase = Phase::Decide;
        Ok(())
    }

    fn decide(&mut self) -> Result<bool> {
        debug_assert_eq!(self.phase, Phase::Decide);
        let u: f64 = self.decision.gen();
        let accept = self.nll_proposed < self.nll_current
            || u <= (self.nll_current - self.nll_proposed).exp();
        if accept {
            self.current.copy_from_slice(&self.proposed);
            self.nll_current = self.nll_proposed;
            self.accepted += 1;
        }
        self.chain.push(&self.current, self.nll_current)?;
        self.phase = Phase::Propose;
        Ok(accept)
    }

    /// Runs one full Propose, Evaluate, Decide cycle. Returns whether the
    /// proposal was accepted.
    ///
    /// # Errors
    /// [`FitError::ChainFull`] when the buffer has no rows left; likelihood
    /// errors are passed through and leave the chain where it was.
    pub fn advance(&mut self) -> Result<bool> {
        if self.chain.is_full() {
            return Err(FitError::ChainFull(self.chain.capacity()));
        }
        self.phase = Phase::Propose;
        self.propose();
        self.evaluate()?;
        self.decide()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn widths(&self) -> &[f64] {
        &self.widths
    }

    /// NLL of the current state.
    pub fn current_nll(&self) -> f64 {
        self.nll_current
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn chain(&self) -> &ChainBuffer {
        &self.chain
    }

    pub fn likelihood(&self) -> &Likelihood<K> {
        &self.likelihood
    }

    /// Hands over the filled buffer and the acceptance count.
    pub fn finish(self) -> ChainRun {
        ChainRun {
            chain: self.chain,
            accepted: self.accepted,
            seed: self.seed,
        }
    }
}

impl<K: ParallelKernel> MarkovChain for MetropolisSampler<K> {
    fn step(&mut self) -> Result<&[f64]> {
        self.advance()?;
        Ok(&self.current)
    }

    fn current_state(&self) -> &[f64] {
        &self.current
    }

    fn accepted(&self) -> usize {
        self.accepted
    }
}
