//! Fake-experiment studies driven from a JSON configuration.

use rand::prelude::*;

use sxfit::config::FitConfig;
use sxfit::core::{run_experiments, DatasetGenerator};
use sxfit::fake::PoissonFakeData;
use sxfit::kernel::AnyKernel;
use sxfit::likelihood::Likelihood;
use sxfit::sample::{EventTable, InMemorySource};
use sxfit::summary;

const CONFIG: &str = r#"{
    "experiment": { "live_time": 2.0, "confidence": 0.9 },
    "pdfs": {
        "hdf5_fields": ["energy", "mc_energy"],
        "observables": {
            "energy": { "title": "Energy", "field": "energy", "bins": 20, "min": 0.0, "max": 10.0 }
        },
        "systematics": {
            "e_res": { "title": "Resolution", "type": "resolution_scale", "observable_field": "energy",
                       "truth_field": "mc_energy", "mean": 0.0, "sigma": 0.05 }
        }
    },
    "fit": {
        "experiments": 3, "steps": 400, "burnin_fraction": 0.25, "signal_name": "line",
        "observables": ["energy"], "systematics": ["e_res"], "signals": ["line", "flat"]
    },
    "signals": {
        "line": { "title": "Line", "rate": 10.0 },
        "flat": { "title": "Flat", "rate": 100.0, "sigma": 10.0 }
    },
    "sampler": { "seed": 77, "kernel": { "kind": "grid", "lanes": 16 } }
}"#;

/// Raw tables with columns (energy, mc_energy).
fn source() -> InMemorySource {
    let mut line = EventTable::empty(2);
    let mut flat = EventTable::empty(2);
    for i in 0..4000 {
        let jitter = ((i % 41) as f64 - 20.0) * 0.02;
        line.push_row(&[6.0 + jitter, 6.0]).unwrap();
        let truth = (i as f64 + 0.5) * 10.0 / 4000.0;
        flat.push_row(&[truth, truth]).unwrap();
    }
    InMemorySource::new().insert("line", line).insert("flat", flat)
}

#[test]
fn test_config_to_upper_limits() {
    let config = FitConfig::from_json(CONFIG).unwrap();
    let model = config.build_model(&source()).unwrap();
    assert_eq!(model.layout.names, vec!["line", "flat", "e_res"]);
    assert_eq!(model.layout.means[..2], [20.0, 200.0]);

    let generator = PoissonFakeData::new(&model).unwrap();
    let poi = config.signal_of_interest(&model).unwrap();
    let initial = model.initial_parameters();
    let kernel = AnyKernel::from_spec(&config.sampler.kernel).unwrap();
    let likelihood = Likelihood::new(model, kernel).unwrap();

    let experiments = run_experiments(
        &likelihood,
        &generator,
        &initial,
        config.fit.steps,
        config.fit.experiments,
        &config.sampler,
    )
    .unwrap();
    assert_eq!(experiments.len(), 3);

    for e in &experiments {
        assert_eq!(e.run.chain.len(), 400);
        assert!(e.n_events > 150 && e.n_events < 290, "{} events", e.n_events);
        let limit = summary::upper_limit(&e.run.chain, poi, config.fit.burnin_fraction, 0.9).unwrap();
        let s = summary::summarize(&e.run.chain, config.fit.burnin_fraction, 0.9).unwrap();
        assert!(limit > s[poi].median);
        assert!(limit < 100.0, "limit {limit}");
        // The flat rate is pinned by ~200 events and its prior.
        assert!((s[1].mean - 200.0).abs() < 50.0, "flat {}", s[1].mean);
    }
}

#[test]
fn test_fake_data_uses_observable_columns() {
    let config = FitConfig::from_json(CONFIG).unwrap();
    let model = config.build_model(&source()).unwrap();
    let data = PoissonFakeData::new(&model)
        .unwrap()
        .generate(&mut SmallRng::seed_from_u64(3))
        .unwrap();
    assert_eq!(data.n_fields(), 1);
    assert!(data.column(0).all(|x| (0.0..10.0).contains(&x)));
}

#[cfg(feature = "csv")]
#[test]
fn test_experiment_chains_export() {
    use sxfit::io::csv::save_experiments_csv;
    use tempfile::NamedTempFile;

    let mut config = FitConfig::from_json(CONFIG).unwrap();
    config.fit.steps = 20;
    let model = config.build_model(&source()).unwrap();
    let generator = PoissonFakeData::new(&model).unwrap();
    let initial = model.initial_parameters();
    let likelihood = Likelihood::new(model, AnyKernel::from_spec(&config.sampler.kernel).unwrap()).unwrap();
    let experiments = run_experiments(&likelihood, &generator, &initial, 20, 2, &config.sampler).unwrap();

    let file = NamedTempFile::new().unwrap();
    save_experiments_csv(&experiments, file.path()).unwrap();
    let text = std::fs::read_to_string(file.path()).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("experiment,step,line,flat,e_res,likelihood"));
    assert_eq!(lines.count(), 40);
}
