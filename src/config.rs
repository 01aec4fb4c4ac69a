/*!
# Fit configuration

A fit is described by one JSON document with four sections:

```json
{
  "experiment": { "live_time": 5.0, "confidence": 0.9, "efficiency": 0.8 },
  "pdfs": {
    "hdf5_fields": ["mc_energy", "energy", "radius"],
    "observables": {
      "energy": { "title": "Energy (MeV)", "field": "energy", "bins": 20, "min": 1.0, "max": 5.0 }
    },
    "systematics": {
      "e_scale": { "title": "Energy scale", "type": "scale", "observable_field": "energy",
                   "mean": 0.0, "sigma": 0.02 },
      "e_res": { "title": "Energy resolution", "type": "resolution_scale",
                 "observable_field": "energy", "truth_field": "mc_energy", "mean": 0.0 }
    }
  },
  "fit": {
    "experiments": 10, "steps": 5000, "burnin_fraction": 0.2, "signal_name": "zeronu",
    "observables": ["energy"], "systematics": ["e_scale"], "signals": ["zeronu", "b8"]
  },
  "signals": {
    "zeronu": { "title": "0vbb", "rate": 0.0, "files": ["zeronu.h5"] },
    "b8": { "rate": 100.0, "sigma": 10.0, "files": ["b8.h5"] }
  }
}
```

Observables and systematics are defined once under `pdfs` and selected by name
in `fit`. Signal rates and rate widths are per unit live time and are scaled
by `live_time * efficiency`. Reading the event files is left to a
[`SampleSource`]; [`FitConfig::build_model`] resolves every field name to a
sample-row index and hands back a ready [`FitModel`].

An optional `sampler` section holds [`SamplerOptions`].
*/

use std::collections::BTreeMap;
use std::path::Path;

use log::info;
use serde::Deserialize;

use crate::error::{FitError, Result};
use crate::model::{FieldTable, FitModel, Observable, SignalSpec, Systematic, SystematicKind};
use crate::sample::{EventTable, SampleSource};
use crate::sampler::SamplerOptions;

fn one() -> f64 {
    1.0
}

fn default_confidence() -> f64 {
    0.9
}

fn default_burnin() -> f64 {
    0.1
}

fn default_output() -> String {
    "fit_spectrum".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExperimentConfig {
    /// Exposure, in the time unit the signal rates are quoted in.
    pub live_time: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "one")]
    pub efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ObservableConfig {
    #[serde(default)]
    pub title: String,
    pub field: String,
    pub bins: usize,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SystematicConfig {
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub observable_field: String,
    #[serde(default)]
    pub truth_field: Option<String>,
    #[serde(default)]
    pub mean: f64,
    #[serde(default)]
    pub sigma: f64,
    #[serde(default)]
    pub fixed: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PdfConfig {
    /// Column names of the raw sample tables, in column order.
    pub hdf5_fields: Vec<String>,
    pub observables: BTreeMap<String, ObservableConfig>,
    #[serde(default)]
    pub systematics: BTreeMap<String, SystematicConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FitSection {
    #[serde(default = "one_experiment")]
    pub experiments: usize,
    pub steps: usize,
    #[serde(default = "default_burnin")]
    pub burnin_fraction: f64,
    /// Parameter the upper limit is reported for.
    #[serde(default)]
    pub signal_name: String,
    #[serde(default = "default_output")]
    pub output_file: String,
    pub observables: Vec<String>,
    #[serde(default)]
    pub systematics: Vec<String>,
    pub signals: Vec<String>,
}

fn one_experiment() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SignalConfig {
    #[serde(default)]
    pub title: Option<String>,
    /// Expected events per unit live time.
    pub rate: f64,
    #[serde(default)]
    pub sigma: f64,
    #[serde(default)]
    pub files: Vec<String>,
}

/// The whole fit description.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FitConfig {
    pub experiment: ExperimentConfig,
    pub pdfs: PdfConfig,
    pub fit: FitSection,
    pub signals: BTreeMap<String, SignalConfig>,
    #[serde(default)]
    pub sampler: SamplerOptions,
}

impl FitConfig {
    /// Parses and validates a configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Checks the numeric settings that do not depend on the samples.
    pub fn validate(&self) -> Result<()> {
        let e = &self.experiment;
        if !(e.live_time.is_finite() && e.live_time > 0.0) {
            return Err(FitError::Config(format!("live_time must be positive, got {}", e.live_time)));
        }
        if !(e.efficiency.is_finite() && e.efficiency > 0.0) {
            return Err(FitError::Config(format!("efficiency must be positive, got {}", e.efficiency)));
        }
        if !(e.confidence > 0.0 && e.confidence < 1.0) {
            return Err(FitError::Config(format!("confidence must lie in (0, 1), got {}", e.confidence)));
        }
        if !(0.0..1.0).contains(&self.fit.burnin_fraction) {
            return Err(FitError::Config(format!(
                "burnin_fraction must lie in [0, 1), got {}",
                self.fit.burnin_fraction
            )));
        }
        if self.fit.steps == 0 {
            return Err(FitError::Config("steps must be at least 1".into()));
        }
        if self.fit.signals.is_empty() {
            return Err(FitError::Config("no signals selected".into()));
        }
        for (name, s) in &self.signals {
            if !(s.rate.is_finite() && s.sigma.is_finite() && s.sigma >= 0.0) {
                return Err(FitError::Config(format!(
                    "signal '{name}': invalid rate {} or sigma {}",
                    s.rate, s.sigma
                )));
            }
        }
        Ok(())
    }

    /// Scale from rates per unit live time to expected counts.
    pub fn exposure(&self) -> f64 {
        self.experiment.live_time * self.experiment.efficiency
    }

    fn selected_observables(&self) -> Result<Vec<Observable>> {
        self.fit
            .observables
            .iter()
            .map(|name| {
                let o = self.pdfs.observables.get(name).ok_or_else(|| FitError::UnknownName {
                    what: "observable",
                    name: name.clone(),
                })?;
                Ok(Observable {
                    name: name.clone(),
                    title: o.title.clone(),
                    field: o.field.clone(),
                    field_index: 0,
                    bins: o.bins,
                    lower: o.min,
                    upper: o.max,
                })
            })
            .collect()
    }

    fn selected_systematics(&self) -> Result<Vec<Systematic>> {
        self.fit
            .systematics
            .iter()
            .map(|name| {
                let s = self.pdfs.systematics.get(name).ok_or_else(|| FitError::UnknownName {
                    what: "systematic",
                    name: name.clone(),
                })?;
                let kind = SystematicKind::parse(name, &s.kind)?;
                let truth_field = match kind {
                    SystematicKind::ResolutionScale => s.truth_field.clone(),
                    _ => None,
                };
                Ok(Systematic {
                    name: name.clone(),
                    title: s.title.clone(),
                    kind,
                    observable_field: s.observable_field.clone(),
                    observable_field_index: 0,
                    truth_field,
                    truth_field_index: None,
                    mean: s.mean,
                    sigma: s.sigma,
                    fixed: s.fixed,
                })
            })
            .collect()
    }

    /// Resolves names, loads every selected signal's sample from `source` and
    /// builds the fit model.
    ///
    /// # Errors
    /// Fails on names that are not defined, unknown dataset fields, unknown
    /// systematic types, raw tables whose width differs from `hdf5_fields`, or
    /// invalid binning.
    pub fn build_model<S: SampleSource + ?Sized>(&self, source: &S) -> Result<FitModel> {
        let mut observables = self.selected_observables()?;
        let mut systematics = self.selected_systematics()?;
        let fields = FieldTable::resolve(&self.pdfs.hdf5_fields, &mut observables, &mut systematics)?;
        info!("sample fields: {}", fields.names.join(", "));

        let exposure = self.exposure();
        let mut signals = Vec::with_capacity(self.fit.signals.len());
        for name in &self.fit.signals {
            let s = self.signals.get(name).ok_or_else(|| FitError::UnknownName {
                what: "signal",
                name: name.clone(),
            })?;
            let raw = source.load(name)?;
            if !raw.is_empty() && raw.n_fields() != self.pdfs.hdf5_fields.len() {
                return Err(FitError::DimensionMismatch(format!(
                    "sample of '{name}' has {} columns, hdf5_fields lists {}",
                    raw.n_fields(),
                    self.pdfs.hdf5_fields.len()
                )));
            }
            let sample = if raw.is_empty() {
                EventTable::empty(fields.len())
            } else {
                raw.select(&fields.columns)?
            };

            let nexpected = s.rate * exposure;
            if s.rate > 0.0 {
                let years = sample.n_events() as f64 / s.rate;
                info!(
                    "initializing pdf for {name} using {} events ({years:.3} live times)",
                    sample.n_events()
                );
            } else {
                info!("initializing pdf for {name} using {} events", sample.n_events());
            }
            signals.push(SignalSpec {
                name: name.clone(),
                title: s.title.clone().unwrap_or_else(|| name.clone()),
                nexpected,
                sigma: s.sigma * exposure,
                sample,
            });
        }

        FitModel::new(observables, systematics, signals)
    }

    /// Slot of `fit.signal_name` in the parameter vector of `model`.
    pub fn signal_of_interest(&self, model: &FitModel) -> Result<usize> {
        model
            .layout
            .index_of(&self.fit.signal_name)
            .ok_or_else(|| FitError::UnknownName {
                what: "signal of interest",
                name: self.fit.signal_name.clone(),
            })
    }

    /// Run-level settings, one line each, as written by [`FitConfig::log_summary`].
    pub fn summary_lines(&self) -> Vec<String> {
        let (f, e) = (&self.fit, &self.experiment);
        vec![
            "Fit:".to_string(),
            format!("  Fake experiments: {}", f.experiments),
            format!("  MCMC steps: {}", f.steps),
            format!("  Burn-in fraction: {}", f.burnin_fraction),
            format!("  Signal name: {}", f.signal_name),
            format!("  Output file: {}", f.output_file),
            "Experiment:".to_string(),
            format!("  Live time: {} y", e.live_time),
            format!("  Efficiency: {}", e.efficiency),
            format!("  Confidence level: {}", e.confidence),
        ]
    }

    /// Logs the run-level settings. See [`FitModel::log_summary`] for the model.
    pub fn log_summary(&self) {
        for line in self.summary_lines() {
            info!("{line}");
        }
    }
}
