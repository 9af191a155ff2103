//! Crate-wide error taxonomy
//!
//! A flat set of error kinds shared across every subsystem, rather than a
//! per-module enum per concern. The WFST core has a small, stable list of
//! ways an operation can fail, and callers (the fitter, the decoders, the
//! CLI examples) want to match on *kind* more often than on *module*.
//!
//! Module-local error types (see e.g. [`crate::weight::EvalError`]) convert
//! into this enum via `From` at the API boundary; they remain distinct types
//! internally so that module code can match on the narrower variant set.

#![allow(missing_docs)]

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The flat error taxonomy described by the system's error handling design.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Malformed JSON or a document that violates the expected schema.
    #[error("schema error: {0}")]
    Schema(String),

    /// An unresolved reference: unknown state id, or an undefined parameter
    /// encountered during evaluation.
    #[error("reference error: {0}")]
    Reference(String),

    /// A cyclic chain of parameter definitions.
    #[error("cycle error: {0}")]
    Cycle(String),

    /// Incompatible alphabets/shapes for composition, or an envelope
    /// inconsistent with its `SeqPair`.
    #[error("shape error: {0}")]
    Shape(String),

    /// A precondition of an operation was violated (e.g. `EvaluatedMachine`
    /// requires an advancing machine).
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A numeric failure: traceback from a `-inf` cell, or a diverging
    /// optimization.
    #[error("numeric error: {0}")]
    Numeric(String),

    /// A state or transition index was out of bounds.
    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },
}

impl Error {
    pub fn out_of_range(index: usize, len: usize) -> Self {
        Error::OutOfRange { index, len }
    }
}
