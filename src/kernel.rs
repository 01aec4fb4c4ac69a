/*!
# Device-portable parallel kernels

Every hot loop in the fitter (systematic transforms, histogram lookups, the
per-event likelihood sum) is written once as a closure over an element index
and handed to a [`ParallelKernel`], which decides how the indices are spread
over execution lanes:

- [`CpuKernel`]: a rayon thread pool working on fixed-size blocks.
- [`GridKernel`]: a GPU-style grid of `lanes` lanes, each walking the index
  space with a grid stride, followed by a pairwise tree reduction of the lane
  partial sums (the shape of a shared-memory reduction on a device).
- [`TensorKernel`]: a `burn` backend. Elementwise kernels run on host lanes,
  the per-event mixture log-sum runs as a tensor program on the device
  (NdArray by default, WGPU with the `wgpu` feature).

All reductions combine partial sums in an order that depends only on the
input size and the lane count, so repeated runs are bit-identical on the same
kernel.

## Example

```rust
use sxfit::kernel::{CpuKernel, GridKernel, ParallelKernel};

let cpu = CpuKernel::with_threads(2).unwrap();
let grid = GridKernel::new(64);
let a: f64 = cpu.map_reduce(1000, |i| i as f64);
let b: f64 = grid.map_reduce(1000, |i| i as f64);
assert_eq!(a, 499_500.0);
assert_eq!(b, 499_500.0);
```
*/

use std::sync::Arc;

use burn::prelude::*;
use burn::tensor::cast::ToElement;
use num_traits::Zero;
use rayon::prelude::*;
use serde::Deserialize;

use crate::error::{FitError, Result};
use crate::nll::Lut;

/// Events per block in the CPU reduction.
const CPU_BLOCK: usize = 4096;

/// A launch interface shared by all compute back-ends.
pub trait ParallelKernel: Send + Sync {
    /// Human readable back-end name, used in logs.
    fn name(&self) -> &str;

    /// Number of parallel execution lanes.
    fn lanes(&self) -> usize;

    /// Runs `body(k, chunk)` for every consecutive `chunk`-sized piece of `data`,
    /// where `k` is the index of the piece. No ordering between pieces.
    fn for_each_chunk<T, F>(&self, data: &mut [T], chunk: usize, body: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync;

    /// Sums `body(i)` over `0..n`.
    fn map_reduce<T, F>(&self, n: usize, body: F) -> T
    where
        T: Zero + Copy + Send,
        F: Fn(usize) -> T + Send + Sync;

    /// Writes `body(i)` into `out[i]`.
    fn map_into<T, F>(&self, out: &mut [T], body: F)
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        self.for_each_chunk(out, 1, |i, slot| slot[0] = body(i));
    }

    /// Sums `log(Σ_j rates[j] * lut[i][j])` over all events.
    ///
    /// Returns negative infinity if any event density is not positive.
    fn event_log_sum(&self, lut: &Lut, rates: &[f64]) -> Result<f64> {
        Ok(self.map_reduce(lut.n_events(), |i| {
            let density = lut.density(i, rates);
            if density > 0.0 {
                density.ln()
            } else {
                f64::NEG_INFINITY
            }
        }))
    }
}

fn build_pool(n_threads: usize) -> Result<Arc<rayon::ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .build()
        .map(Arc::new)
        .map_err(|e| FitError::Backend(format!("failed to build thread pool: {e}")))
}

/// Multi-threaded CPU back-end.
#[derive(Debug, Clone)]
pub struct CpuKernel {
    pool: Arc<rayon::ThreadPool>,
}

impl CpuKernel {
    /// A kernel with one thread per available core.
    pub fn new() -> Result<Self> {
        Self::with_threads(0)
    }

    /// A kernel with `n_threads` worker threads (0 = automatic).
    pub fn with_threads(n_threads: usize) -> Result<Self> {
        Ok(Self {
            pool: build_pool(n_threads)?,
        })
    }
}

impl ParallelKernel for CpuKernel {
    fn name(&self) -> &str {
        "cpu"
    }

    fn lanes(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn for_each_chunk<T, F>(&self, data: &mut [T], chunk: usize, body: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        if chunk == 0 {
            return;
        }
        self.pool.install(|| {
            data.par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(k, piece)| body(k, piece))
        });
    }

    fn map_reduce<T, F>(&self, n: usize, body: F) -> T
    where
        T: Zero + Copy + Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        let n_blocks = n.div_ceil(CPU_BLOCK);
        let partials: Vec<T> = self.pool.install(|| {
            (0..n_blocks)
                .into_par_iter()
                .map(|b| {
                    let end = ((b + 1) * CPU_BLOCK).min(n);
                    (b * CPU_BLOCK..end).fold(T::zero(), |acc, i| acc + body(i))
                })
                .collect()
        });
        partials.into_iter().fold(T::zero(), |acc, x| acc + x)
    }
}

/// GPU-style grid back-end: a fixed number of lanes with grid-stride loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridKernel {
    lanes: usize,
}

impl GridKernel {
    pub fn new(lanes: usize) -> Self {
        Self {
            lanes: lanes.max(1),
        }
    }
}

impl Default for GridKernel {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Pairwise reduction of lane partial sums, halving the active lanes each round.
fn tree_reduce<T: Zero + Copy>(mut partials: Vec<T>) -> T {
    if partials.is_empty() {
        return T::zero();
    }
    let mut active = partials.len();
    while active > 1 {
        let half = active.div_ceil(2);
        for i in 0..active / 2 {
            partials[i] = partials[i] + partials[i + half];
        }
        active = half;
    }
    partials[0]
}

impl ParallelKernel for GridKernel {
    fn name(&self) -> &str {
        "grid"
    }

    fn lanes(&self) -> usize {
        self.lanes
    }

    fn for_each_chunk<T, F>(&self, data: &mut [T], chunk: usize, body: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        if chunk == 0 || data.is_empty() {
            return;
        }
        let n_pieces = data.len().div_ceil(chunk);
        let per_lane = n_pieces.div_ceil(self.lanes);
        data.par_chunks_mut(per_lane * chunk)
            .enumerate()
            .for_each(|(lane, block)| {
                for (k, piece) in block.chunks_mut(chunk).enumerate() {
                    body(lane * per_lane + k, piece);
                }
            });
    }

    fn map_reduce<T, F>(&self, n: usize, body: F) -> T
    where
        T: Zero + Copy + Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        let stride = self.lanes;
        let partials: Vec<T> = (0..stride)
            .into_par_iter()
            .map(|offset| {
                (offset..n)
                    .step_by(stride)
                    .fold(T::zero(), |acc, i| acc + body(i))
            })
            .collect();
        tree_reduce(partials)
    }
}

/// A `burn` tensor back-end.
///
/// The per-event log-sum is a `[1, ns] x [ns, ne]` matrix product followed by an
/// elementwise logarithm on the device; the log values are summed on the host in
/// double precision. Elementwise kernels use the host thread pool.
///
/// Device arithmetic runs in the backend's float type, which is `f32` for the
/// default `NdArray` and `Wgpu` backends. A per-event density below the `f32`
/// range (about 1e-45) rounds to zero on the device and the event counts as
/// empty, so the NLL is penalised where [`CpuKernel`] still returns a finite
/// value. Densities inside the `f32` range agree with the host kernels to single
/// precision.
#[derive(Debug, Clone)]
pub struct TensorKernel<B: Backend> {
    device: B::Device,
    host: CpuKernel,
}

impl<B: Backend> TensorKernel<B> {
    /// A kernel on the backend's default device.
    pub fn new() -> Result<Self> {
        Self::on_device(B::Device::default())
    }

    pub fn on_device(device: B::Device) -> Result<Self> {
        Ok(Self {
            device,
            host: CpuKernel::new()?,
        })
    }
}

impl<B: Backend> ParallelKernel for TensorKernel<B> {
    fn name(&self) -> &str {
        "tensor"
    }

    fn lanes(&self) -> usize {
        self.host.lanes()
    }

    fn for_each_chunk<T, F>(&self, data: &mut [T], chunk: usize, body: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        self.host.for_each_chunk(data, chunk, body);
    }

    fn map_reduce<T, F>(&self, n: usize, body: F) -> T
    where
        T: Zero + Copy + Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        self.host.map_reduce(n, body)
    }

    fn event_log_sum(&self, lut: &Lut, rates: &[f64]) -> Result<f64> {
        let (ne, ns) = (lut.n_events(), lut.n_signals());
        if ne == 0 || ns == 0 {
            return Ok(if ne == 0 { 0.0 } else { f64::NEG_INFINITY });
        }
        // The LUT is stored column-major, i.e. as a row-major [ns, ne] matrix.
        let lut_t = Tensor::<B, 2>::from_data(
            TensorData::new(lut.as_slice().to_vec(), [ns, ne]),
            &self.device,
        );
        let rates_t = Tensor::<B, 2>::from_data(TensorData::new(rates.to_vec(), [1, ns]), &self.device);

        let density = rates_t.matmul(lut_t);
        let positive = density
            .clone()
            .greater_elem(0.0)
            .int()
            .sum()
            .into_scalar()
            .to_i64();
        if positive != ne as i64 {
            return Ok(f64::NEG_INFINITY);
        }

        let logs = density
            .log()
            .into_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .map_err(|e| FitError::Backend(format!("reading log densities from device failed: {e:?}")))?;
        Ok(logs.iter().sum())
    }
}

/// Back-end selection, as it appears in run options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelSpec {
    Cpu {
        #[serde(default)]
        threads: usize,
    },
    Grid {
        #[serde(default = "default_grid_lanes")]
        lanes: usize,
    },
    Tensor,
    #[cfg(feature = "wgpu")]
    Wgpu,
}

fn default_grid_lanes() -> usize {
    256
}

impl Default for KernelSpec {
    fn default() -> Self {
        KernelSpec::Cpu { threads: 0 }
    }
}

/// A kernel chosen at runtime from a [`KernelSpec`].
#[derive(Debug, Clone)]
pub enum AnyKernel {
    Cpu(CpuKernel),
    Grid(GridKernel),
    Tensor(TensorKernel<burn::backend::NdArray>),
    #[cfg(feature = "wgpu")]
    Wgpu(TensorKernel<burn::backend::Wgpu>),
}

impl AnyKernel {
    pub fn from_spec(spec: &KernelSpec) -> Result<Self> {
        Ok(match spec {
            KernelSpec::Cpu { threads } => AnyKernel::Cpu(CpuKernel::with_threads(*threads)?),
            KernelSpec::Grid { lanes } => AnyKernel::Grid(GridKernel::new(*lanes)),
            KernelSpec::Tensor => AnyKernel::Tensor(TensorKernel::new()?),
            #[cfg(feature = "wgpu")]
            KernelSpec::Wgpu => AnyKernel::Wgpu(TensorKernel::new()?),
        })
    }
}

macro_rules! dispatch {
    ($self:ident, $k:ident => $e:expr) => {
        match $self {
            AnyKernel::Cpu($k) => $e,
            AnyKernel::Grid($k) => $e,
            AnyKernel::Tensor($k) => $e,
            #[cfg(feature = "wgpu")]
            AnyKernel::Wgpu($k) => $e,
        }
    };
}

impl ParallelKernel for AnyKernel {
    fn name(&self) -> &str {
        dispatch!(self, k => k.name())
    }

    fn lanes(&self) -> usize {
        dispatch!(self, k => k.lanes())
    }

    fn for_each_chunk<T, F>(&self, data: &mut [T], chunk: usize, body: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        dispatch!(self, k => k.for_each_chunk(data, chunk, body))
    }

    fn map_reduce<T, F>(&self, n: usize, body: F) -> T
    where
        T: Zero + Copy + Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        dispatch!(self, k => k.map_reduce(n, body))
    }

    fn event_log_sum(&self, lut: &Lut, rates: &[f64]) -> Result<f64> {
        dispatch!(self, k => k.event_log_sum(lut, rates))
    }
}
