//! A synthetic two-component fit: a narrow peak on a flat background, with an
//! energy-scale systematic. Samples are generated in memory, a Poisson fake
//! dataset is drawn from them and fitted, and the posterior is summarized.
//!
//! Run with `RUST_LOG=info cargo run --release --bin demo`.

use log::info;
use rand::prelude::*;
use rand_distr::Normal;
use std::error::Error;

use sxfit::config::FitConfig;
use sxfit::core::{fit, DatasetGenerator};
use sxfit::fake::PoissonFakeData;
use sxfit::kernel::AnyKernel;
use sxfit::likelihood::Likelihood;
use sxfit::sample::{EventTable, InMemorySource};
use sxfit::summary;

const CONFIG: &str = r#"{
    "experiment": { "live_time": 1.0, "confidence": 0.9 },
    "pdfs": {
        "hdf5_fields": ["mc_energy", "energy"],
        "observables": {
            "energy": { "title": "Energy (MeV)", "field": "energy", "bins": 40, "min": 0.0, "max": 10.0 }
        },
        "systematics": {
            "e_scale": { "title": "Energy scale", "type": "scale", "observable_field": "energy",
                         "mean": 0.0, "sigma": 0.01 }
        }
    },
    "fit": {
        "steps": 20000, "burnin_fraction": 0.2, "signal_name": "peak",
        "observables": ["energy"], "systematics": ["e_scale"], "signals": ["peak", "flat"]
    },
    "signals": {
        "peak": { "title": "Peak", "rate": 300.0 },
        "flat": { "title": "Background", "rate": 2000.0, "sigma": 100.0 }
    },
    "sampler": { "seed": 42, "kernel": { "kind": "cpu" }, "progress": true }
}"#;

/// Raw sample tables with columns (mc_energy, energy).
fn samples(rng: &mut SmallRng) -> Result<InMemorySource, Box<dyn Error>> {
    let smear = Normal::new(0.0, 0.15)?;
    let mut peak = EventTable::empty(2);
    for _ in 0..100_000 {
        let truth = 5.0;
        peak.push_row(&[truth, truth + rng.sample(smear)])?;
    }
    let mut flat = EventTable::empty(2);
    for _ in 0..100_000 {
        let truth: f64 = rng.gen_range(0.0..10.0);
        flat.push_row(&[truth, truth + rng.sample(smear)])?;
    }
    Ok(InMemorySource::new().insert("peak", peak).insert("flat", flat))
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = FitConfig::from_json(CONFIG)?;
    config.log_summary();
    let mut rng = SmallRng::seed_from_u64(config.sampler.seed.unwrap_or(0));
    let model = config.build_model(&samples(&mut rng)?)?;
    model.log_summary();

    let kernel = AnyKernel::from_spec(&config.sampler.kernel)?;
    let data = PoissonFakeData::new(&model)?.generate(&mut rng)?;
    info!("fake dataset: {} events", data.n_events());

    let poi = config.signal_of_interest(&model)?;
    let initial = model.initial_parameters();
    let mut likelihood = Likelihood::new(model, kernel)?;
    likelihood.set_data(&data)?;

    let run = fit(likelihood, &initial, config.fit.steps, &config.sampler)?;
    info!("acceptance rate {:.3}", run.acceptance_rate());

    let level = config.experiment.confidence;
    let burnin = config.fit.burnin_fraction;
    summary::log_summary(&summary::summarize(&run.chain, burnin, level)?, level);
    let limit = summary::upper_limit(&run.chain, poi, burnin, level)?;
    info!(
        "{:.0}% upper limit on {}: {limit:.2} events",
        level * 100.0,
        config.fit.signal_name
    );

    #[cfg(feature = "csv")]
    {
        let path = format!("{}.csv", config.fit.output_file);
        sxfit::io::csv::save_chain_csv(&run.chain, &path)?;
        info!("chain written to {path}");
    }
    Ok(())
}
