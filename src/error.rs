//! Error types for the fitter.
//!
//! Everything that can go wrong before sampling starts (configuration,
//! field resolution, binning) is fatal and surfaces as a [`FitError`].
//! Numerical trouble during sampling never does: it is folded into the
//! likelihood as [`crate::nll::NLL_PENALTY`].

use thiserror::Error;

/// Fitter error type.
#[derive(Error, Debug)]
pub enum FitError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[cfg(feature = "csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A systematic type string that is none of `shift`, `scale`, `resolution_scale`.
    #[error("unknown systematic type '{kind}' for systematic '{name}'")]
    UnknownSystematicKind { name: String, kind: String },

    /// A field name that does not exist in the dataset field list.
    #[error("{owner}: unknown field '{field}'")]
    UnknownField { owner: String, field: String },

    /// A resolved field index that does not fit the sample table.
    #[error("{owner}: field index {index} out of range for {n_fields} sample fields")]
    FieldOutOfRange {
        owner: String,
        index: usize,
        n_fields: usize,
    },

    /// Something referenced by name in the fit section that was never defined.
    #[error("unknown {what} '{name}'")]
    UnknownName { what: &'static str, name: String },

    /// Table or vector dimensions that disagree.
    #[error("{0}")]
    DimensionMismatch(String),

    /// Any other invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The chain buffer has no free rows left.
    #[error("chain buffer is full ({0} rows)")]
    ChainFull(usize),

    /// Failure in a parallel back-end (thread pool, device).
    #[error("compute back-end error: {0}")]
    Backend(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FitError>;
