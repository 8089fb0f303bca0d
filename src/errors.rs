//! Error type of the crate.

#[cfg(feature = "pymbar")]
use pyo3::prelude::PyErr;
use thiserror::Error;

/// Enum for errors in this crate
#[derive(Error, Debug)]
pub enum MBarError {
    /// Error returned when a builder's build() was called improperly
    #[error("Could not build: {0}")]
    BuilderError(String),

    /// Error returned when removing a state or sample by a name that matches nothing
    #[error("No entry named {0:?}")]
    NotFound(String),

    /// Error returned when a state is added under a name that is already taken
    #[error("A state named {0:?} already exists")]
    DuplicateState(String),

    /// Error returned when a state is constructed with a temperature that is not positive
    #[error("Temperature must be positive and finite, got {0}")]
    InvalidTemperature(f64),

    /// Error returned when an estimate is requested before a successful solve
    #[error("Estimator must be optimized after the last change to its states or samples")]
    NotSolved,

    /// Error returned when the energy cache or energy matrix disagrees with the sample counts
    #[error("Energy matrix is inconsistent: {0}")]
    ShapeMismatch(String),

    /// Error returned when an array is the wrong length
    #[error("Array of length {0} is incorrect; length should be {1}")]
    ArrayLengthMismatch(usize, usize),

    /// Error returned when the self-consistent iteration runs out of iterations
    #[error("Self-consistent iteration did not converge in {iterations} iterations (residual {residual:e})")]
    Convergence {
        #[allow(missing_docs)]
        iterations: usize,
        #[allow(missing_docs)]
        residual: f64,
    },

    /// Error returned when a decomposition cannot produce a result
    #[error("Linear algebra failure: {0}")]
    Linalg(&'static str),

    /// Error returned when a python exception is not handled
    #[cfg(feature = "pymbar")]
    #[error("Unexpected Python exception was not handled")]
    UnhandledPythonException {
        #[allow(missing_docs)]
        #[from]
        source: PyErr,
    },
}

impl From<String> for MBarError {
    fn from(s: String) -> Self {
        Self::BuilderError(s)
    }
}

/// Result type for the mbar-reweight crate
pub type Result<T> = std::result::Result<T, MBarError>;
