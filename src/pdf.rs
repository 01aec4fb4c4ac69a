/*!
# Histogram PDF evaluator

[`EvalHist`] turns a Monte Carlo sample of one signal into a binned,
N-dimensional probability density and reports that density at a fixed set of
evaluation points (the data events). Before binning, the systematics bound to
the evaluator deform a copy of the sample:

| kind | transform of the bound field `x` |
|---|---|
| shift | `x + p` |
| scale | `x * (1 + p)` |
| resolution scale | `t + (x - t) * (1 + p)`, `t` read from the truth field |

Binning follows one fixed policy: lower bounds are inclusive, upper bounds
exclusive, and a value lying exactly on an inner bin edge belongs to the bin
above it. Sample events outside the binned region are dropped from the
histogram but still count towards its normalization, so the density integrates
to the fraction of the sample inside the region.

Rebinning dominates the cost of a sampler step, so the evaluator remembers the
systematic values its output was built with and only rebuilds when one of
them changes.

## Example

```rust
use sxfit::kernel::CpuKernel;
use sxfit::pdf::{Axis, EvalHist};
use sxfit::sample::EventTable;

let sample = EventTable::from_rows(&[[0.5], [1.5], [1.7], [3.0]]).unwrap();
let axes = vec![Axis { field: 0, bins: 2, lower: 0.0, upper: 2.0 }];
let mut pdf = EvalHist::new(sample, axes, vec![]).unwrap();
pdf.set_eval_points(EventTable::from_rows(&[[0.1], [1.9]]).unwrap()).unwrap();

let kernel = CpuKernel::new().unwrap();
pdf.update(&kernel, &[]).unwrap();
// One of four events in [0, 1), two in [1, 2); bin width 1.
assert_eq!(pdf.values(), &[0.25, 0.5]);
```
*/

use log::{debug, warn};

use crate::error::{FitError, Result};
use crate::kernel::ParallelKernel;
use crate::model::SystematicKind;
use crate::sample::EventTable;

/// Binning of one histogram dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Axis {
    /// Sample field binned along this axis.
    pub field: usize,
    pub bins: usize,
    pub lower: f64,
    pub upper: f64,
}

impl Axis {
    /// Position of edge `k`; edge 0 is `lower`.
    #[inline]
    pub fn edge(&self, k: usize) -> f64 {
        self.lower + (self.upper - self.lower) * k as f64 / self.bins as f64
    }

    pub fn width(&self) -> f64 {
        (self.upper - self.lower) / self.bins as f64
    }

    /// Bin containing `x`, or `None` outside `[lower, upper)`.
    #[inline]
    pub fn bin(&self, x: f64) -> Option<usize> {
        if !(x >= self.lower && x < self.upper) {
            return None;
        }
        let mut k = (((x - self.lower) / self.width()) as usize).min(self.bins - 1);
        // The division can land one bin off near an edge; settle against the edges.
        if k > 0 && x < self.edge(k) {
            k -= 1;
        } else if k + 1 < self.bins && x >= self.edge(k + 1) {
            k += 1;
        }
        Some(k)
    }

    fn validate(&self, dim: usize) -> Result<()> {
        if self.bins == 0 {
            return Err(FitError::Config(format!("axis {dim} has no bins")));
        }
        if !(self.lower.is_finite() && self.upper.is_finite() && self.upper > self.lower) {
            return Err(FitError::Config(format!(
                "axis {dim} has invalid bounds [{}, {})",
                self.lower, self.upper
            )));
        }
        Ok(())
    }
}

/// Where a systematic reads its value from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterSource {
    /// An entry of the parameter vector.
    Slot(usize),
    /// A constant (fixed systematics).
    Fixed(f64),
}

impl ParameterSource {
    #[inline]
    pub fn value(self, pars: &[f64]) -> Option<f64> {
        match self {
            ParameterSource::Slot(i) => pars.get(i).copied(),
            ParameterSource::Fixed(v) => Some(v),
        }
    }
}

/// A systematic as seen by one evaluator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystematicBinding {
    pub kind: SystematicKind,
    /// Sample field the transform writes.
    pub field: usize,
    /// Truth field (resolution scale only).
    pub truth: Option<usize>,
    pub source: ParameterSource,
}

impl SystematicBinding {
    #[inline]
    fn apply(&self, row: &mut [f64], p: f64) {
        let truth = self.truth.map_or(0.0, |t| row[t]);
        row[self.field] = self.kind.apply(row[self.field], truth, p);
    }
}

fn same_bits(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

/// Binned density of one signal sample, evaluated at a fixed set of points.
#[derive(Debug, Clone)]
pub struct EvalHist {
    sample: EventTable,
    axes: Vec<Axis>,
    /// Row-major strides of the flattened histogram.
    strides: Vec<usize>,
    n_bins: usize,
    volume: f64,
    systematics: Vec<SystematicBinding>,
    /// Flattened bin of every evaluation point (points are never transformed).
    point_bins: Vec<Option<usize>>,
    n_points: usize,
    values: Vec<f64>,
    /// Systematic values `values` was computed with.
    cached: Option<Vec<f64>>,
}

impl EvalHist {
    /// Creates an evaluator over `sample` with the given binning and systematics.
    ///
    /// # Errors
    /// Fails if an axis or systematic refers to a field outside the sample row, if
    /// a resolution systematic lacks a distinct truth field, or if an axis has no
    /// bins or invalid bounds.
    pub fn new(sample: EventTable, axes: Vec<Axis>, systematics: Vec<SystematicBinding>) -> Result<Self> {
        let n_fields = sample.n_fields();
        if axes.is_empty() {
            return Err(FitError::Config("histogram needs at least one axis".into()));
        }
        for (d, axis) in axes.iter().enumerate() {
            axis.validate(d)?;
            if axis.field >= n_fields {
                return Err(FitError::FieldOutOfRange {
                    owner: format!("axis {d}"),
                    index: axis.field,
                    n_fields,
                });
            }
        }
        for (k, s) in systematics.iter().enumerate() {
            if s.field >= n_fields {
                return Err(FitError::FieldOutOfRange {
                    owner: format!("systematic {k}"),
                    index: s.field,
                    n_fields,
                });
            }
            match (s.kind, s.truth) {
                (SystematicKind::ResolutionScale, None) => {
                    return Err(FitError::Config(format!(
                        "resolution systematic {k} has no truth field"
                    )))
                }
                (SystematicKind::ResolutionScale, Some(t)) if t == s.field => {
                    return Err(FitError::Config(format!(
                        "resolution systematic {k} uses field {t} as observable and truth"
                    )))
                }
                (_, Some(t)) if t >= n_fields => {
                    return Err(FitError::FieldOutOfRange {
                        owner: format!("systematic {k} truth"),
                        index: t,
                        n_fields,
                    })
                }
                _ => {}
            }
        }

        let mut strides = vec![1; axes.len()];
        for d in (0..axes.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * axes[d + 1].bins;
        }
        let n_bins = axes.iter().map(|a| a.bins).product();
        let volume = axes.iter().map(Axis::width).product();

        Ok(Self {
            sample,
            axes,
            strides,
            n_bins,
            volume,
            systematics,
            point_bins: Vec::new(),
            n_points: 0,
            values: Vec::new(),
            cached: None,
        })
    }

    pub fn n_sample_events(&self) -> usize {
        self.sample.n_events()
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn sample(&self) -> &EventTable {
        &self.sample
    }

    /// Flattened bin of a point, reading dimension `d` through `value(d, axis)`.
    #[inline]
    fn locate<V: Fn(usize, &Axis) -> f64>(&self, value: V) -> Option<usize> {
        let mut flat = 0;
        for (d, axis) in self.axes.iter().enumerate() {
            flat += axis.bin(value(d, axis))? * self.strides[d];
        }
        Some(flat)
    }

    /// Sets the points the density is reported at: one row per event, one column
    /// per axis, in axis order. Invalidates the cached output.
    pub fn set_eval_points(&mut self, points: EventTable) -> Result<()> {
        if !points.is_empty() && points.n_fields() != self.axes.len() {
            return Err(FitError::DimensionMismatch(format!(
                "evaluation points have {} fields, histogram has {} axes",
                points.n_fields(),
                self.axes.len()
            )));
        }
        self.n_points = points.n_events();
        self.point_bins = (0..self.n_points)
            .map(|i| {
                let row = points.row(i);
                self.locate(|d, _| row[d])
            })
            .collect();
        self.values = vec![0.0; self.n_points];
        self.cached = None;
        Ok(())
    }

    /// Values of the bound systematics for `pars`, in binding order.
    fn systematic_values(&self, pars: &[f64]) -> Result<Vec<f64>> {
        self.systematics
            .iter()
            .map(|s| {
                s.source.value(pars).ok_or_else(|| {
                    FitError::DimensionMismatch(format!(
                        "systematic bound to {:?} but the parameter vector has {} entries",
                        s.source,
                        pars.len()
                    ))
                })
            })
            .collect()
    }

    /// Copy of the sample with every systematic applied, in binding order.
    pub fn transform_sample<K: ParallelKernel>(&self, kernel: &K, syst: &[f64]) -> Vec<f64> {
        let mut work = self.sample.as_slice().to_vec();
        if !self.systematics.is_empty() && !work.is_empty() {
            let bindings = &self.systematics;
            kernel.for_each_chunk(&mut work, self.sample.n_fields(), |_, row| {
                for (s, &p) in bindings.iter().zip(syst) {
                    s.apply(row, p);
                }
            });
        }
        work
    }

    /// Normalized density of every bin, row-major over the axes.
    fn density<K: ParallelKernel>(&self, kernel: &K, syst: &[f64]) -> Vec<f64> {
        let work = self.transform_sample(kernel, syst);
        let stride = self.sample.n_fields();
        let n_events = self.sample.n_events();

        let mut event_bins = vec![None; n_events];
        kernel.map_into(&mut event_bins, |i| {
            let row = &work[i * stride..(i + 1) * stride];
            self.locate(|_, axis| row[axis.field])
        });

        let mut counts = vec![0u64; self.n_bins];
        for b in event_bins.into_iter().flatten() {
            counts[b] += 1;
        }

        let norm = n_events as f64 * self.volume;
        if norm == 0.0 {
            warn!("histogram built from an empty sample; density is zero everywhere");
            return vec![0.0; self.n_bins];
        }
        counts.into_iter().map(|c| c as f64 / norm).collect()
    }

    /// Brings the output up to date with `pars`. Returns true if the histogram
    /// was rebuilt, false if the cached output still applied.
    pub fn update<K: ParallelKernel>(&mut self, kernel: &K, pars: &[f64]) -> Result<bool> {
        let syst = self.systematic_values(pars)?;
        if let Some(cached) = &self.cached {
            if same_bits(cached, &syst) {
                return Ok(false);
            }
        }

        debug!("rebinning {} sample events, systematics {:?}", self.sample.n_events(), syst);
        let density = self.density(kernel, &syst);
        let point_bins = &self.point_bins;
        kernel.map_into(&mut self.values, |i| point_bins[i].map_or(0.0, |b| density[b]));
        self.cached = Some(syst);
        Ok(true)
    }

    /// Density at each evaluation point, as of the last [`EvalHist::update`].
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Density at each evaluation point for an arbitrary parameter vector, leaving
    /// the cached output untouched.
    pub fn evaluate_with<K: ParallelKernel>(&self, kernel: &K, pars: &[f64]) -> Result<Vec<f64>> {
        let density = self.density(kernel, &self.systematic_values(pars)?);
        let mut out = vec![0.0; self.n_points];
        kernel.map_into(&mut out, |i| self.point_bins[i].map_or(0.0, |b| density[b]));
        Ok(out)
    }

    /// The normalized histogram for an arbitrary parameter vector, row-major over
    /// the axes.
    pub fn histogram<K: ParallelKernel>(&self, kernel: &K, pars: &[f64]) -> Result<Vec<f64>> {
        Ok(self.density(kernel, &self.systematic_values(pars)?))
    }
}
