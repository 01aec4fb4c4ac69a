//! Chain export.

#[cfg(feature = "csv")]
pub mod csv;
