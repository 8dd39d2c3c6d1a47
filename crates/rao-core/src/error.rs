//! Unified error type for remedial action optimisation.
//!
//! Every fallible operation in the workspace returns [`RaoResult`]. The variants
//! mirror the failure surfaces of the optimiser: a sensitivity computation that
//! did not converge, a solver that could not produce a solution, a problem
//! filler that could not build its part of the linear problem, and accessors
//! called on results that do not exist yet.
//!
//! # Example
//!
//! ```ignore
//! use rao_core::{RaoError, RaoResult};
//!
//! fn optimise(leaf: &mut Leaf) -> RaoResult<f64> {
//!     leaf.optimize(&input, &parameters)?;
//!     leaf.cost()
//! }
//! ```

use thiserror::Error;

/// Unified error type for all RAO operations.
#[derive(Error, Debug)]
pub enum RaoError {
    /// I/O errors (parameter files, exports)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing/deserialization errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Data validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// The sensitivity provider failed on a network state
    #[error("Sensitivity computation failed: {0}")]
    Sensitivity(String),

    /// Linear solver errors
    #[error("Solver error: {0}")]
    Solver(String),

    /// A problem filler could not build or update its variables and constraints
    #[error("Problem filler error: {0}")]
    FillerConstruction(String),

    /// Accessor called on a result that has not been computed
    #[error("No results available: {0}")]
    ResultNotAvailable(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network structure errors (unknown element, wrong element kind)
    #[error("Network error: {0}")]
    Network(String),

    /// A parallel depth did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using RaoError.
pub type RaoResult<T> = Result<T, RaoError>;

// Conversion from anyhow::Error
impl From<anyhow::Error> for RaoError {
    fn from(err: anyhow::Error) -> Self {
        RaoError::Other(err.to_string())
    }
}

impl From<String> for RaoError {
    fn from(s: String) -> Self {
        RaoError::Other(s)
    }
}

impl From<&str> for RaoError {
    fn from(s: &str) -> Self {
        RaoError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for RaoError {
    fn from(err: serde_json::Error) -> Self {
        RaoError::Parse(err.to_string())
    }
}

impl From<toml::de::Error> for RaoError {
    fn from(err: toml::de::Error) -> Self {
        RaoError::Parse(err.to_string())
    }
}

impl From<toml::ser::Error> for RaoError {
    fn from(err: toml::ser::Error) -> Self {
        RaoError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RaoError::Sensitivity("load flow diverged".into());
        assert!(err.to_string().contains("Sensitivity computation failed"));
        assert!(err.to_string().contains("load flow diverged"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let rao_err: RaoError = io_err.into();
        assert!(matches!(rao_err, RaoError::Io(_)));
    }

    #[test]
    fn test_toml_error_is_parse_error() {
        let err = toml::from_str::<toml::Value>("a = [").unwrap_err();
        let rao_err: RaoError = err.into();
        assert!(matches!(rao_err, RaoError::Parse(_)));
    }

    #[test]
    fn test_question_mark_operator() {
        fn inner() -> RaoResult<()> {
            Err(RaoError::ResultNotAvailable("leaf is in error".into()))
        }

        fn outer() -> RaoResult<()> {
            inner()?;
            Ok(())
        }

        assert!(matches!(outer(), Err(RaoError::ResultNotAvailable(_))));
    }
}
