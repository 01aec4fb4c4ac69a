//! Signal extraction by Markov chain Monte Carlo fitting of a binned
//! histogram mixture.
//!
//! Each signal is a Monte Carlo sample turned into a normalized histogram
//! ([`pdf::EvalHist`]) that systematics can shift, scale or smear. The data
//! likelihood is the extended mixture NLL ([`nll`]), sampled with a
//! random-walk Metropolis chain ([`sampler`]). All data-sized loops run on a
//! [`kernel::ParallelKernel`]: a rayon thread pool, a GPU-style lane grid, or
//! a `burn` tensor device.

pub mod chain;
pub mod config;
pub mod core;
pub mod error;
pub mod fake;
pub mod io;
pub mod kernel;
pub mod likelihood;
pub mod model;
pub mod nll;
pub mod pdf;
pub mod sample;
pub mod sampler;
pub mod summary;

pub use error::{FitError, Result};
