//! Error types for recipe loading and validation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for recipe operations.
#[derive(Debug, Error)]
pub enum RecipeError {
    /// Recipe file could not be read.
    #[error("failed to read recipe file {path}")]
    Io {
        /// Path to the recipe file.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Recipe file was not valid YAML for the expected schema.
    #[error("failed to parse recipe file {path}")]
    Parse {
        /// Path to the recipe file.
        path: PathBuf,
        /// Source deserialisation error.
        #[source]
        source: serde_yaml::Error,
    },
    /// Field contained an invalid value.
    #[error("invalid value for '{field}' in '{section}': {reason}")]
    InvalidField {
        /// Section that failed validation.
        section: &'static str,
        /// Field that failed validation.
        field: &'static str,
        /// Human-readable reason for the failure.
        reason: String,
    },
    /// Entry point reference was not of the form `module:attribute`.
    #[error("invalid entry point '{value}': expected '<module>:<attribute>'")]
    InvalidEntryPoint {
        /// Entry point payload provided by the caller.
        value: String,
    },
    /// Source exclusion glob failed to compile.
    #[error("invalid source exclusion glob '{pattern}': {reason}")]
    InvalidGlob {
        /// Offending glob pattern.
        pattern: String,
        /// Compilation error detail.
        reason: String,
    },
    /// Declared exposed port diverged from the launch command port.
    #[error("declared exposed port {exposed} does not match launch port {launch}")]
    PortMismatch {
        /// Port declared in the recipe's `expose` field.
        exposed: u16,
        /// Port passed to the launch command.
        launch: u16,
    },
}

/// Convenience alias for recipe results.
pub type RecipeResult<T> = Result<T, RecipeError>;
