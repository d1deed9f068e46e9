//! Failure kinds observable at the crate boundary.
//!
//! Everything degenerate inside the loop is clamped or branched around; the
//! only failures a caller can see are "not enough data to even try" and
//! "no model explained the data".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RansacError {
    /// Fewer points than the minimal sample size.
    #[error("insufficient data: {got} points given, at least {needed} needed")]
    InsufficientData { needed: usize, got: usize },

    /// The run finished without a single supported model.
    #[error("no model found")]
    NoModelFound,

    /// Malformed input matrices (shape mismatch, wrong column count).
    #[error("bad input: {0}")]
    BadInput(String),
}
