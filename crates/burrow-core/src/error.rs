//! Error types for Burrow constructors.
//!
//! Data-path operations (`add`, `find`, `delete`) keep a boolean contract —
//! a miss or a duplicate is a reportable outcome, not an error — so the
//! enum only covers what can go wrong while building a store or an engine.

use std::error::Error;
use std::fmt;

/// Burrow error types with context for debugging.
#[derive(Debug, Clone)]
pub enum BurrowError {
    /// A configuration parameter is outside its documented range.
    Config {
        /// The offending parameter name
        parameter: &'static str,
        /// Human-readable description of the constraint
        reason: String,
    },

    /// A background thread could not be spawned.
    Thread {
        /// Thread name that failed to start
        name: String,
        /// Underlying OS error description
        message: String,
    },

    /// A fixed-capacity resource ran out.
    Exhausted {
        /// What ran out
        resource: &'static str,
    },
}

impl fmt::Display for BurrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BurrowError::Config { parameter, reason } => {
                write!(f, "invalid configuration: {}: {}", parameter, reason)
            }

            BurrowError::Thread { name, message } => {
                write!(f, "failed to spawn thread {}: {}", name, message)
            }

            BurrowError::Exhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
        }
    }
}

impl Error for BurrowError {}

/// Result type alias for Burrow operations
pub type BurrowResult<T> = Result<T, BurrowError>;
