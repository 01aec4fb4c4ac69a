/*!
# Resolved fit model

The types in this module describe a fit after all names have been resolved:
observables and systematics carry explicit field indices into the signal
sample tables, and the [`ParameterLayout`] fixes where every free parameter
lives in the parameter vector (rates first, in signal order, then free
systematics, in systematic order). Kernels only ever index through these
tables.

Field resolution ([`FieldTable::resolve`]) runs once, when the configuration
is loaded: the sample row holds every observable field (first appearance
wins) followed by the truth fields of resolution systematics.
*/

use log::info;

use crate::error::{FitError, Result};
use crate::pdf::{Axis, EvalHist, ParameterSource, SystematicBinding};
use crate::sample::EventTable;

/// A quantity the fit bins on.
#[derive(Debug, Clone, PartialEq)]
pub struct Observable {
    pub name: String,
    pub title: String,
    /// Dataset field name.
    pub field: String,
    /// Index of the field in the sample row.
    pub field_index: usize,
    pub bins: usize,
    pub lower: f64,
    pub upper: f64,
}

impl Observable {
    pub fn axis(&self) -> Axis {
        Axis {
            field: self.field_index,
            bins: self.bins,
            lower: self.lower,
            upper: self.upper,
        }
    }
}

/// How a systematic deforms its observable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystematicKind {
    /// `x + p`
    Shift,
    /// `x * (1 + p)`
    Scale,
    /// `t + (x - t) * (1 + p)`, with `t` the true value of the quantity.
    ResolutionScale,
}

impl SystematicKind {
    /// Parses the configuration spelling of a systematic type.
    pub fn parse(systematic: &str, kind: &str) -> Result<Self> {
        match kind {
            "shift" => Ok(SystematicKind::Shift),
            "scale" => Ok(SystematicKind::Scale),
            "resolution_scale" => Ok(SystematicKind::ResolutionScale),
            other => Err(FitError::UnknownSystematicKind {
                name: systematic.to_string(),
                kind: other.to_string(),
            }),
        }
    }

    /// Applies the transform to one value. `truth` is only read by
    /// [`SystematicKind::ResolutionScale`].
    #[inline]
    pub fn apply(self, x: f64, truth: f64, p: f64) -> f64 {
        match self {
            SystematicKind::Shift => x + p,
            SystematicKind::Scale => x * (1.0 + p),
            // Same as `truth + (x - truth) * (1 + p)`, exact at p = 0.
            SystematicKind::ResolutionScale => x + (x - truth) * p,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SystematicKind::Shift => "shift",
            SystematicKind::Scale => "scale",
            SystematicKind::ResolutionScale => "resolution_scale",
        }
    }
}

/// A nuisance parameter deforming the samples before binning.
#[derive(Debug, Clone, PartialEq)]
pub struct Systematic {
    pub name: String,
    pub title: String,
    pub kind: SystematicKind,
    pub observable_field: String,
    pub observable_field_index: usize,
    /// Only set for [`SystematicKind::ResolutionScale`].
    pub truth_field: Option<String>,
    pub truth_field_index: Option<usize>,
    pub mean: f64,
    /// Width of the Gaussian prior; 0 leaves the parameter unconstrained.
    pub sigma: f64,
    /// Fixed systematics stay at `mean` and are not part of the parameter vector.
    pub fixed: bool,
}

/// A mixture component before its histogram evaluator is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSpec {
    pub name: String,
    pub title: String,
    pub nexpected: f64,
    /// Width of the Gaussian prior on the rate; 0 leaves it unconstrained.
    pub sigma: f64,
    /// Events in the resolved sample field order.
    pub sample: EventTable,
}

/// A mixture component with its own histogram evaluator.
#[derive(Debug, Clone)]
pub struct Signal {
    pub name: String,
    pub title: String,
    pub nexpected: f64,
    pub sigma: f64,
    pub pdf: EvalHist,
}

/// Mapping from sample-row positions to dataset columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTable {
    /// `columns[k]` is the dataset column copied into sample field `k`.
    pub columns: Vec<usize>,
    /// Name of each sample field.
    pub names: Vec<String>,
}

fn index_with_append(v: &mut Vec<usize>, o: usize) -> usize {
    match v.iter().position(|&x| x == o) {
        Some(i) => i,
        None => {
            v.push(o);
            v.len() - 1
        }
    }
}

fn dataset_column(dataset_fields: &[String], owner: &str, field: &str) -> Result<usize> {
    dataset_fields
        .iter()
        .position(|f| f == field)
        .ok_or_else(|| FitError::UnknownField {
            owner: owner.to_string(),
            field: field.to_string(),
        })
}

impl FieldTable {
    /// Resolves field names to sample-row indices and records them on the
    /// observables and systematics.
    ///
    /// # Errors
    /// Fails if a field is not in `dataset_fields`, if a systematic's observable
    /// field is not an observable field, or if a resolution systematic has no truth
    /// field or a truth field equal to its observable field.
    pub fn resolve(
        dataset_fields: &[String],
        observables: &mut [Observable],
        systematics: &mut [Systematic],
    ) -> Result<Self> {
        let mut columns = Vec::new();

        for o in observables.iter_mut() {
            let column = dataset_column(dataset_fields, &o.name, &o.field)?;
            o.field_index = index_with_append(&mut columns, column);
        }
        let n_observable_fields = columns.len();

        for s in systematics.iter_mut() {
            let column = dataset_column(dataset_fields, &s.name, &s.observable_field)?;
            s.observable_field_index = columns[..n_observable_fields]
                .iter()
                .position(|&c| c == column)
                .ok_or_else(|| {
                    FitError::Config(format!(
                        "systematic '{}' acts on field '{}', which is not an observable",
                        s.name, s.observable_field
                    ))
                })?;

            if s.kind != SystematicKind::ResolutionScale {
                continue;
            }
            let truth = s.truth_field.as_deref().ok_or_else(|| {
                FitError::Config(format!(
                    "resolution systematic '{}' needs a truth field",
                    s.name
                ))
            })?;
            if truth == s.observable_field {
                return Err(FitError::Config(format!(
                    "resolution systematic '{}' uses '{}' as both observable and truth",
                    s.name, truth
                )));
            }
            let column = dataset_column(dataset_fields, &s.name, truth)?;
            s.truth_field_index = Some(index_with_append(&mut columns, column));
        }

        let names = columns.iter().map(|&c| dataset_fields[c].clone()).collect();
        Ok(Self { columns, names })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Names, priors and proposal widths of every entry of the parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterLayout {
    pub names: Vec<String>,
    pub means: Vec<f64>,
    pub sigmas: Vec<f64>,
    /// Default Metropolis jump widths; 0 holds a parameter constant.
    pub widths: Vec<f64>,
    pub n_signals: usize,
    /// Where each systematic (in registration order) takes its value from.
    pub sources: Vec<ParameterSource>,
}

impl ParameterLayout {
    /// Rates get a default jump width of `sqrt(nexpected)`; free systematics use
    /// their prior width, or 0.01 when unconstrained.
    pub fn new(signals: &[SignalSpec], systematics: &[Systematic]) -> Self {
        let mut layout = Self {
            names: Vec::new(),
            means: Vec::new(),
            sigmas: Vec::new(),
            widths: Vec::new(),
            n_signals: signals.len(),
            sources: Vec::with_capacity(systematics.len()),
        };
        for s in signals {
            layout.names.push(s.name.clone());
            layout.means.push(s.nexpected);
            layout.sigmas.push(s.sigma);
            layout.widths.push(s.nexpected.max(1.0).sqrt());
        }
        for s in systematics {
            if s.fixed {
                layout.sources.push(ParameterSource::Fixed(s.mean));
                continue;
            }
            layout.sources.push(ParameterSource::Slot(layout.names.len()));
            layout.names.push(s.name.clone());
            layout.means.push(s.mean);
            layout.sigmas.push(s.sigma);
            layout.widths.push(if s.sigma > 0.0 { s.sigma } else { 0.01 });
        }
        layout
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Slot of the parameter called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Observables, systematics and signals, ready for sampling.
#[derive(Debug, Clone)]
pub struct FitModel {
    pub observables: Vec<Observable>,
    pub systematics: Vec<Systematic>,
    pub signals: Vec<Signal>,
    pub layout: ParameterLayout,
}

impl FitModel {
    /// Validates the resolved indices and builds one histogram evaluator per signal.
    ///
    /// # Errors
    /// Fails when there are no signals or observables, when a field index does not
    /// fit a signal's sample table, or when an observable's binning is invalid.
    pub fn new(
        observables: Vec<Observable>,
        systematics: Vec<Systematic>,
        signals: Vec<SignalSpec>,
    ) -> Result<Self> {
        if signals.is_empty() {
            return Err(FitError::Config("a fit needs at least one signal".into()));
        }
        if observables.is_empty() {
            return Err(FitError::Config("a fit needs at least one observable".into()));
        }
        for s in &systematics {
            if !observables
                .iter()
                .any(|o| o.field_index == s.observable_field_index)
            {
                return Err(FitError::Config(format!(
                    "systematic '{}' is bound to field {}, which no observable uses",
                    s.name, s.observable_field_index
                )));
            }
            if s.kind == SystematicKind::ResolutionScale {
                match s.truth_field_index {
                    None => {
                        return Err(FitError::Config(format!(
                            "resolution systematic '{}' has no truth field",
                            s.name
                        )))
                    }
                    Some(t) if t == s.observable_field_index => {
                        return Err(FitError::Config(format!(
                            "resolution systematic '{}' has the same observable and truth field",
                            s.name
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        let layout = ParameterLayout::new(&signals, &systematics);
        let axes: Vec<Axis> = observables.iter().map(Observable::axis).collect();
        let bindings: Vec<SystematicBinding> = systematics
            .iter()
            .zip(&layout.sources)
            .map(|(s, &source)| SystematicBinding {
                kind: s.kind,
                field: s.observable_field_index,
                truth: s.truth_field_index,
                source,
            })
            .collect();

        let signals = signals
            .into_iter()
            .map(|spec| {
                let pdf = EvalHist::new(spec.sample, axes.clone(), bindings.clone()).map_err(
                    |e| FitError::Config(format!("signal '{}': {e}", spec.name)),
                )?;
                Ok(Signal {
                    name: spec.name,
                    title: spec.title,
                    nexpected: spec.nexpected,
                    sigma: spec.sigma,
                    pdf,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            observables,
            systematics,
            signals,
            layout,
        })
    }

    /// Expected rates and free-systematic means, i.e. the usual starting point.
    pub fn initial_parameters(&self) -> Vec<f64> {
        self.layout.means.clone()
    }

    /// Logs the model, one block per observable, signal and systematic.
    pub fn log_summary(&self) {
        info!("Observables:");
        for (i, o) in self.observables.iter().enumerate() {
            info!(
                "  {i} \"{}\": field {} bins {} range [{}, {})",
                o.title, o.field, o.bins, o.lower, o.upper
            );
        }
        info!("Signals:");
        for s in &self.signals {
            let constraint = if s.sigma > 0.0 {
                s.sigma.to_string()
            } else {
                "none".to_string()
            };
            info!(
                "  {} \"{}\": expectation {} constraint {} ({} sample events)",
                s.name,
                s.title,
                s.nexpected,
                constraint,
                s.pdf.n_sample_events()
            );
        }
        if !self.systematics.is_empty() {
            info!("Systematics:");
        }
        for s in &self.systematics {
            let constraint = if s.sigma > 0.0 {
                s.sigma.to_string()
            } else {
                "none".to_string()
            };
            info!(
                "  {} \"{}\": {} on {}{} mean {} constraint {} fixed {}",
                s.name,
                s.title,
                s.kind.as_str(),
                s.observable_field,
                s.truth_field
                    .as_deref()
                    .map(|t| format!(" (truth {t})"))
                    .unwrap_or_default(),
                s.mean,
                constraint,
                if s.fixed { "yes" } else { "no" }
            );
        }
    }
}
