/*!
# Chain driver

Runs chains to completion and, for sensitivity studies, runs whole fake
experiments: each experiment draws a dataset from a [`DatasetGenerator`],
attaches it to a fresh copy of the likelihood and samples a fresh chain.
Experiments are independent and run in parallel on the rayon pool.

Experiment `e` uses the root seed `seed + e`; the dataset and the chain lanes
draw their own seeds from it, so every experiment is reproducible on its own.
Burn-in is kept in the returned chains; see [`crate::summary`] for trimming.
*/

use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::prelude::*;
use rayon::prelude::*;

use crate::error::Result;
use crate::kernel::ParallelKernel;
use crate::likelihood::Likelihood;
use crate::sample::EventTable;
use crate::sampler::{ChainRun, MetropolisSampler, SamplerOptions};

const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

pub trait MarkovChain {
    /// Does one iteration of the chain, returning the new current state.
    fn step(&mut self) -> Result<&[f64]>;

    /// The current state without stepping.
    fn current_state(&self) -> &[f64];

    /// Proposals accepted so far.
    fn accepted(&self) -> usize;
}

/// Steps `chain` `n_steps` times.
pub fn run_chain<M: MarkovChain>(chain: &mut M, n_steps: usize) -> Result<()> {
    for _ in 0..n_steps {
        chain.step()?;
    }
    Ok(())
}

/// Like [`run_chain`], reporting progress and the running acceptance rate on `pb`.
pub fn run_chain_with_progress<M: MarkovChain>(
    chain: &mut M,
    n_steps: usize,
    pb: &ProgressBar,
) -> Result<()> {
    let accepted_before = chain.accepted();
    let mut last_update = Instant::now();
    pb.set_length(n_steps as u64);

    for i in 0..n_steps {
        chain.step()?;
        if last_update.elapsed() >= UPDATE_INTERVAL || i + 1 == n_steps {
            let rate = (chain.accepted() - accepted_before) as f64 / (i + 1) as f64;
            pb.set_position(i as u64 + 1);
            pb.set_message(format!("AcceptRate={rate:.3}"));
            last_update = Instant::now();
        }
    }
    Ok(())
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Logs a warning when a chain accepted almost nothing or almost everything,
/// which usually means the jump widths are badly tuned.
pub fn check_acceptance(run: &ChainRun) {
    let rate = run.acceptance_rate();
    if !run.chain.is_empty() && !(0.05..=0.95).contains(&rate) {
        warn!(
            "acceptance rate {rate:.3} over {} steps; consider retuning the jump widths",
            run.chain.len()
        );
    }
}

/// Samples `n_steps` steps of a single chain on the data already attached to
/// `likelihood`, starting at `initial`.
pub fn fit<K: ParallelKernel>(
    likelihood: Likelihood<K>,
    initial: &[f64],
    n_steps: usize,
    options: &SamplerOptions,
) -> Result<ChainRun> {
    let mut sampler = MetropolisSampler::new(likelihood, initial, n_steps)?.with_options(options)?;
    if options.progress {
        let pb = ProgressBar::new(n_steps as u64);
        pb.set_style(progress_style());
        pb.set_prefix("Fit");
        run_chain_with_progress(&mut sampler, n_steps, &pb)?;
        pb.finish_with_message("Done!");
    } else {
        run_chain(&mut sampler, n_steps)?;
    }
    let run = sampler.finish();
    check_acceptance(&run);
    Ok(run)
}

/// Source of datasets for fake experiments. A dataset has one column per
/// observable, in observable order.
pub trait DatasetGenerator: Sync {
    fn generate(&self, rng: &mut SmallRng) -> Result<EventTable>;
}

/// Outcome of one fake experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub index: usize,
    /// Root seed of the experiment.
    pub seed: u64,
    pub n_events: usize,
    pub run: ChainRun,
}

/// Runs `n_experiments` fake experiments of `n_steps` steps each, in parallel.
///
/// Each experiment clones `likelihood`, attaches a dataset drawn from
/// `generator`, and samples a fresh chain from `initial`.
pub fn run_experiments<K, G>(
    likelihood: &Likelihood<K>,
    generator: &G,
    initial: &[f64],
    n_steps: usize,
    n_experiments: usize,
    options: &SamplerOptions,
) -> Result<Vec<Experiment>>
where
    K: ParallelKernel + Clone,
    G: DatasetGenerator,
{
    let seed = options.seed.unwrap_or_else(|| thread_rng().gen());
    let multi = options.progress.then(MultiProgress::new);
    let style = progress_style();

    (0..n_experiments)
        .into_par_iter()
        .map(|e| {
            let root = seed.wrapping_add(e as u64);
            let mut rng = SmallRng::seed_from_u64(root);
            let chain_seed: u64 = rng.gen();
            let data = generator.generate(&mut rng)?;

            let mut lh = likelihood.clone();
            lh.set_data(&data)?;
            let mut sampler = MetropolisSampler::new(lh, initial, n_steps)?
                .with_options(options)?
                .set_seed(chain_seed);

            match &multi {
                Some(multi) => {
                    let pb = multi.add(ProgressBar::new(n_steps as u64));
                    pb.set_prefix(format!("Experiment {e}"));
                    pb.set_style(style.clone());
                    run_chain_with_progress(&mut sampler, n_steps, &pb)?;
                    pb.finish_with_message("Done!");
                }
                None => run_chain(&mut sampler, n_steps)?,
            }

            let run = sampler.finish();
            info!(
                "experiment {e}: {} events, acceptance {:.3}",
                data.n_events(),
                run.acceptance_rate()
            );
            check_acceptance(&run);
            Ok(Experiment {
                index: e,
                seed: root,
                n_events: data.n_events(),
                run,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::CpuKernel;
    use crate::model::{FitModel, Observable, SignalSpec};

    fn flat(n: usize) -> EventTable {
        let step = 10.0 / n as f64;
        EventTable::new((0..n).map(|i| (i as f64 + 0.5) * step).collect(), 1).unwrap()
    }

    fn likelihood() -> Likelihood<CpuKernel> {
        let observable = Observable {
            name: "e".into(),
            title: "Energy".into(),
            field: "energy".into(),
            field_index: 0,
            bins: 10,
            lower: 0.0,
            upper: 10.0,
        };
        let signal = SignalSpec {
            name: "flat".into(),
            title: "Flat".into(),
            nexpected: 100.0,
            sigma: 0.0,
            sample: flat(1000),
        };
        let model = FitModel::new(vec![observable], vec![], vec![signal]).unwrap();
        Likelihood::new(model, CpuKernel::new().unwrap()).unwrap()
    }

    /// Uniform datasets whose size depends on the drawn RNG.
    struct Uniform;

    impl DatasetGenerator for Uniform {
        fn generate(&self, rng: &mut SmallRng) -> Result<EventTable> {
            let n = rng.gen_range(80..120);
            EventTable::new((0..n).map(|_| rng.gen_range(0.0..10.0)).collect(), 1)
        }
    }

    #[test]
    fn test_fit_fills_the_chain() {
        let mut lh = likelihood();
        lh.set_data(&flat(100)).unwrap();
        let options = SamplerOptions::default().set_seed(3);
        let run = fit(lh, &[100.0], 300, &options).unwrap();
        assert_eq!(run.chain.len(), 300);
        assert!(run.accepted <= 300);
        assert_eq!(run.seed, 3);
    }

    #[test]
    fn test_experiments_are_reproducible_and_distinct() {
        let lh = likelihood();
        let options = SamplerOptions::default().set_seed(10);
        let a = run_experiments(&lh, &Uniform, &[100.0], 50, 4, &options).unwrap();
        let b = run_experiments(&lh, &Uniform, &[100.0], 50, 4, &options).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        for (e, x) in a.iter().enumerate() {
            assert_eq!(x.index, e);
            assert_eq!(x.seed, 10 + e as u64);
            assert_eq!(x.run.chain.len(), 50);
        }
        assert_ne!(a[0].run.chain, a[1].run.chain);
    }

    #[test]
    fn test_single_experiment_matches_its_seed() {
        let lh = likelihood();
        let all = run_experiments(&lh, &Uniform, &[100.0], 40, 3, &SamplerOptions::default().set_seed(20))
            .unwrap();
        let third = run_experiments(&lh, &Uniform, &[100.0], 40, 1, &SamplerOptions::default().set_seed(22))
            .unwrap();
        assert_eq!(all[2].run, third[0].run);
    }
}
