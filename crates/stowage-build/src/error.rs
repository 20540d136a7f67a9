//! # Design
//!
//! - Structured, constant-message errors for the build pipeline boundary.
//! - Capture the inputs that triggered a failure (paths, references, line
//!   numbers) so reports are reproducible in tests.
//! - Keep source errors intact instead of flattening them into strings.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for build operations.
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors produced while building or exporting images.
#[derive(Debug, Error)]
pub enum BuildError {
    /// IO failures while interacting with the image store or source tree.
    #[error("build io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// JSON failures while reading or writing store records.
    #[error("build json failure")]
    Json {
        /// Operation that triggered the JSON failure.
        operation: &'static str,
        /// Path involved in the JSON failure.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// The requested base image is not present in the store.
    #[error("base image not found")]
    BaseMissing {
        /// The `name:tag` reference that failed to resolve.
        reference: String,
        /// Store directory that was searched.
        searched: PathBuf,
    },
    /// The dependency manifest named by the recipe does not exist.
    #[error("dependency manifest not found")]
    ManifestMissing {
        /// Path the manifest was expected at.
        path: PathBuf,
    },
    /// A manifest line does not follow the `name==version` pin grammar.
    #[error("malformed manifest entry")]
    ManifestSyntax {
        /// One-based line number of the offending entry.
        line: usize,
        /// The offending entry text.
        entry: String,
    },
    /// A pinned requirement has no archive in the package index.
    #[error("package not found in index")]
    PackageMissing {
        /// The `name==version` pin that failed to resolve.
        requirement: String,
        /// Index directory that was searched.
        searched: PathBuf,
    },
    /// The requested image record does not exist in the store.
    #[error("image not found")]
    ImageMissing {
        /// Image identifier that failed to resolve.
        image_id: String,
    },
    /// A layer referenced by an image record is missing from the store.
    #[error("layer missing from store")]
    LayerMissing {
        /// Digest of the missing layer.
        digest: String,
    },
}

impl BuildError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: serde_json::Error,
    ) -> Self {
        Self::Json {
            operation,
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn error_helpers_build_variants() {
        let io_err = BuildError::io("read", "path", io::Error::other("io"));
        assert!(matches!(io_err, BuildError::Io { .. }));
        assert!(io_err.source().is_some());

        let json_source = serde_json::from_str::<serde_json::Value>("invalid")
            .expect_err("invalid json should fail to parse");
        let json_err = BuildError::json("parse", "path", json_source);
        assert!(matches!(json_err, BuildError::Json { .. }));
        assert!(json_err.source().is_some());
    }

    #[test]
    fn domain_variants_carry_inputs() {
        let missing = BuildError::ManifestMissing {
            path: "src/requirements.txt".into(),
        };
        assert_eq!(missing.to_string(), "dependency manifest not found");

        let syntax = BuildError::ManifestSyntax {
            line: 3,
            entry: "flask >= 2".to_string(),
        };
        assert!(matches!(syntax, BuildError::ManifestSyntax { line: 3, .. }));
    }
}
