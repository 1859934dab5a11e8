//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds in the specification's error-handling design:
//! each mutator-facing failure is a distinct variant so callers can match
//! on it rather than parsing a message string.

use thiserror::Error;

/// Convenience alias for results returned by this crate's public API.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("duplicate target id: {0}")]
    DuplicateId(String),

    #[error("unknown target id: {0}")]
    UnknownId(String),

    #[error("invalid descriptors: {0}")]
    InvalidDescriptors(String),

    #[error("vocabulary tree has not been built")]
    VocabularyNotBuilt,

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("internal math failure: {0}")]
    InternalMathFailure(String),
}
