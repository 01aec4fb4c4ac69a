//! End-to-end fits on synthetic samples with known answers.

use rand::prelude::*;
use rand_distr::Normal;

use sxfit::core::{fit, MarkovChain};
use sxfit::kernel::{CpuKernel, GridKernel, ParallelKernel};
use sxfit::likelihood::Likelihood;
use sxfit::model::{FitModel, Observable, SignalSpec, Systematic, SystematicKind};
use sxfit::nll::NLL_PENALTY;
use sxfit::sample::EventTable;
use sxfit::sampler::{MetropolisSampler, SamplerOptions};
use sxfit::summary;

fn energy(bins: usize) -> Observable {
    Observable {
        name: "energy".into(),
        title: "Energy".into(),
        field: "energy".into(),
        field_index: 0,
        bins,
        lower: 0.0,
        upper: 10.0,
    }
}

/// `n` evenly spaced events covering `[lower, upper)`, none on a bin edge.
fn stratified(n: usize, lower: f64, upper: f64) -> EventTable {
    let step = (upper - lower) / n as f64;
    EventTable::new((0..n).map(|i| lower + (i as f64 + 0.5) * step).collect(), 1).unwrap()
}

fn signal(name: &str, nexpected: f64, sample: EventTable) -> SignalSpec {
    SignalSpec {
        name: name.into(),
        title: name.into(),
        nexpected,
        sigma: 0.0,
        sample,
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[test]
fn test_one_signal_recovers_event_count() {
    let model = FitModel::new(
        vec![energy(10)],
        vec![],
        vec![signal("flat", 1000.0, stratified(10_000, 0.0, 10.0))],
    )
    .unwrap();
    assert!((model.layout.widths[0] - 1000f64.sqrt()).abs() < 1e-12);

    let mut rng = SmallRng::seed_from_u64(2024);
    let data = EventTable::new((0..1000).map(|_| rng.gen_range(0.0..10.0)).collect(), 1).unwrap();
    let mut lh = Likelihood::new(model, CpuKernel::new().unwrap()).unwrap();
    lh.set_data(&data).unwrap();

    let options = SamplerOptions::default().set_seed(42);
    let run = fit(lh, &[1000.0], 500, &options).unwrap();

    assert_eq!(run.chain.len(), 500);
    let rates = run.chain.column(0);
    let tail = mean(&rates[400..]);
    assert!((tail - 1000.0).abs() < 100.0, "posterior mean {tail}");
    let acceptance = run.acceptance_rate();
    assert!(acceptance > 0.1 && acceptance < 0.9, "acceptance {acceptance}");
}

#[test]
fn test_two_disjoint_signals_separate() {
    let model = FitModel::new(
        vec![energy(10)],
        vec![],
        vec![
            signal("low", 150.0, stratified(5000, 0.0, 5.0)),
            signal("high", 150.0, stratified(5000, 5.0, 10.0)),
        ],
    )
    .unwrap();

    let mut rows = stratified(100, 0.0, 5.0);
    rows.extend(&stratified(200, 5.0, 10.0)).unwrap();
    let mut lh = Likelihood::new(model, GridKernel::new(64)).unwrap();
    lh.set_data(&rows).unwrap();

    let run = fit(lh, &[150.0, 150.0], 200, &SamplerOptions::default().set_seed(7)).unwrap();
    let low = mean(&run.chain.column(0)[100..]);
    let high = mean(&run.chain.column(1)[100..]);
    assert!((low - 100.0).abs() < 30.0, "low {low}");
    assert!((high - 200.0).abs() < 40.0, "high {high}");
    assert!(low < high);

    // Neither 90% interval reaches the other signal's true rate.
    let s = summary::summarize(&run.chain, 0.5, 0.9).unwrap();
    assert!(s[0].upper < 200.0 - 5.0 * 200f64.sqrt(), "low {:?}", s[0]);
    assert!(s[1].lower > 100.0 + 5.0 * 100f64.sqrt(), "high {:?}", s[1]);
}

fn two_signal_likelihood<K: ParallelKernel>(kernel: K) -> Likelihood<K> {
    let model = FitModel::new(
        vec![energy(20)],
        vec![],
        vec![
            signal("a", 50.0, stratified(2000, 0.0, 10.0)),
            signal("b", 50.0, stratified(2000, 2.0, 6.0)),
        ],
    )
    .unwrap();
    let mut lh = Likelihood::new(model, kernel).unwrap();
    lh.set_data(&stratified(120, 0.0, 10.0)).unwrap();
    lh
}

#[test]
fn test_chain_shape_and_acceptance_count() {
    let mut sampler = MetropolisSampler::new(two_signal_likelihood(CpuKernel::new().unwrap()), &[50.0, 50.0], 300)
        .unwrap()
        .set_seed(99);
    let mut previous = 0;
    for step in 1..=300 {
        sampler.step().unwrap();
        let accepted = MarkovChain::accepted(&sampler);
        assert!(accepted >= previous && accepted <= step);
        previous = accepted;
    }
    let run = sampler.finish();
    assert_eq!(run.chain.rows().shape(), &[300, 3]);
    assert!(run.chain.nll().iter().all(|v| v.is_finite()));
}

#[test]
fn test_fixed_seed_gives_bit_identical_chains() {
    for kernel_lanes in [1, 7, 256] {
        let run = || {
            let lh = two_signal_likelihood(GridKernel::new(kernel_lanes));
            fit(lh, &[40.0, 60.0], 150, &SamplerOptions::default().set_seed(1234)).unwrap()
        };
        let (a, b) = (run(), run());
        let bits = |r: &sxfit::sampler::ChainRun| -> Vec<u64> {
            r.chain.rows().iter().map(|v| v.to_bits()).collect()
        };
        assert_eq!(bits(&a), bits(&b));
        assert_eq!(a.accepted, b.accepted);
    }
}

#[test]
fn test_kernels_agree_on_nll() {
    let mut cpu = two_signal_likelihood(CpuKernel::with_threads(3).unwrap());
    let mut grid = two_signal_likelihood(GridKernel::new(32));
    for pars in [[50.0, 50.0], [10.0, 110.0], [120.0, 0.5]] {
        let (x, y) = (cpu.nll(&pars).unwrap(), grid.nll(&pars).unwrap());
        assert!((x - y).abs() <= 1e-9 * x.abs().max(1.0), "{x} vs {y}");
    }
}

#[test]
fn test_negative_rates_are_penalised() {
    let mut lh = two_signal_likelihood(CpuKernel::new().unwrap());
    assert_eq!(lh.nll(&[-0.1, 50.0]).unwrap(), NLL_PENALTY);
    assert_eq!(lh.nll(&[50.0, -1e-300]).unwrap(), NLL_PENALTY);
    // Signal b alone leaves events outside [2, 6) with zero density.
    assert_eq!(lh.nll(&[0.0, 50.0]).unwrap(), NLL_PENALTY);
    assert!(lh.nll(&[50.0, 0.0]).unwrap() < NLL_PENALTY);
}

#[test]
fn test_shift_systematic_is_recovered() {
    let smear = Normal::new(5.0, 0.5).unwrap();
    let mut rng = SmallRng::seed_from_u64(11);
    let peak = EventTable::new((0..50_000).map(|_| rng.sample(smear)).collect(), 1).unwrap();
    // Data: the peak moved up by 0.5, on top of a flat background. The shift
    // acts on both components, so background data stay clear of the range ends.
    let mut data = EventTable::new((0..2000).map(|_| rng.sample(smear) + 0.5).collect(), 1).unwrap();
    data.extend(&stratified(400, 1.0, 9.0)).unwrap();

    let shift = Systematic {
        name: "e_shift".into(),
        title: "Energy shift".into(),
        kind: SystematicKind::Shift,
        observable_field: "energy".into(),
        observable_field_index: 0,
        truth_field: None,
        truth_field_index: None,
        mean: 0.0,
        sigma: 0.0,
        fixed: false,
    };
    let model = FitModel::new(
        vec![energy(40)],
        vec![shift],
        vec![
            signal("peak", 2000.0, peak),
            signal("flat", 400.0, stratified(10_000, 0.0, 10.0)),
        ],
    )
    .unwrap();
    let mut lh = Likelihood::new(model, CpuKernel::new().unwrap()).unwrap();
    lh.set_data(&data).unwrap();

    let options = SamplerOptions::default().set_seed(5).set_widths(vec![45.0, 20.0, 0.02]);
    let run = fit(lh, &[2000.0, 400.0, 0.0], 1500, &options).unwrap();
    let shift = mean(&run.chain.column(2)[1000..]);
    assert!((shift - 0.5).abs() < 0.1, "shift {shift}");
}
