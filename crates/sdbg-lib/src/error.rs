//! Fatal error kinds of the construction core.
//!
//! Any of these aborts the whole run; partially written outputs are to be
//! discarded by the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors raised by the builder.
#[derive(Error, Debug)]
pub enum SdbgError {
    /// The memory budget cannot fit the largest bucket or a minimal batch.
    #[error(
        "{budget} bytes is not enough for the two-level sort, \
         set the memory budget to at least {required} bytes"
    )]
    BudgetInsufficient {
        /// The configured budget in bytes.
        budget: u64,
        /// A lower bound on the budget that would work.
        required: u64,
    },

    /// Read/write/open failure on an input or output file.
    #[error("I/O failure on {path}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Unparseable `.info` file, truncated edge file, zero multiplicity.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Too many dummy nodes; the graph contains too many tips.
    #[error("too many dummy nodes (>= {0}), the graph contains too many tips")]
    GraphTooDense(u64),

    /// An internal invariant did not hold.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl SdbgError {
    /// Attach a path to an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SdbgError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, SdbgError>;
