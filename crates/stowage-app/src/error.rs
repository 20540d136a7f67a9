//! # Design
//!
//! - Centralise application-level errors for the bootstrap sequence.
//! - Keep error messages constant while carrying context fields for
//!   debugging.
//! - Preserve typed source errors where the producing crate exposes them.

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// A recipe failed to load or validate.
    #[error("recipe operation failed")]
    Recipe {
        /// Operation identifier.
        operation: &'static str,
        /// Source recipe error.
        source: stowage_config::RecipeError,
    },
    /// Image store or build-record operations failed.
    #[error("image store operation failed")]
    Store {
        /// Operation identifier.
        operation: &'static str,
        /// Source store error.
        source: stowage_build::BuildError,
    },
    /// The build pipeline failed.
    #[error("image build failed")]
    Build {
        /// Operation identifier.
        operation: &'static str,
        /// Rendered failure chain from the pipeline.
        message: String,
    },
    /// Container lifecycle operations failed.
    #[error("container operation failed")]
    Runtime {
        /// Operation identifier.
        operation: &'static str,
        /// Rendered failure chain from the runtime.
        message: String,
    },
    /// Telemetry operations failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Rendered failure chain from telemetry setup.
        message: String,
    },
}

impl AppError {
    pub(crate) const fn recipe(
        operation: &'static str,
        source: stowage_config::RecipeError,
    ) -> Self {
        Self::Recipe { operation, source }
    }

    pub(crate) const fn store(operation: &'static str, source: stowage_build::BuildError) -> Self {
        Self::Store { operation, source }
    }

    pub(crate) fn build(operation: &'static str, source: &anyhow::Error) -> Self {
        Self::Build {
            operation,
            message: format!("{source:#}"),
        }
    }

    pub(crate) fn runtime(operation: &'static str, source: &anyhow::Error) -> Self {
        Self::Runtime {
            operation,
            message: format!("{source:#}"),
        }
    }

    pub(crate) fn telemetry(operation: &'static str, source: &anyhow::Error) -> Self {
        Self::Telemetry {
            operation,
            message: format!("{source:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn typed_sources_are_preserved() {
        let source = stowage_build::BuildError::ImageMissing {
            image_id: "missing".to_string(),
        };
        let error = AppError::store("image.load", source);
        assert!(matches!(error, AppError::Store { .. }));
        assert!(error.source().is_some());
    }

    #[test]
    fn rendered_variants_keep_the_failure_chain() {
        let chain = anyhow::anyhow!("inner").context("outer");
        let error = AppError::build("build.run", &chain);
        let AppError::Build { message, .. } = &error else {
            panic!("expected build variant");
        };
        assert!(message.contains("outer"));
        assert!(message.contains("inner"));
    }
}
