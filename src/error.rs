//! Error types for outline loading and fitting.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the fitting library.
///
/// Solver non-convergence is not an error: it is reported through
/// [`crate::solver::SolverStatus`] on the solution and only shows up as a
/// higher residual cost.
#[derive(Debug, Error)]
pub enum MorphError {
    #[error("Parse error in {} at line {line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Outline {} has {found} points, at least {} are required", path.display(), crate::config::MIN_OUTLINE_POINTS)]
    TooFewPoints { path: PathBuf, found: usize },

    #[error("Outline {} encloses no area", path.display())]
    Degenerate { path: PathBuf },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cannot fit distribution to `{column}`: {reason}")]
    Statistics { column: String, reason: String },
}

impl MorphError {
    /// Wraps an IO error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MorphError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, MorphError>;
