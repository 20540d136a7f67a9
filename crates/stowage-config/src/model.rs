//! Typed recipe models for the bootstrap sequence.
//!
//! # Design
//! - Pure data carriers used by the build pipeline, runtime, and CLI.
//! - Keeps domain types separate from IO/wiring code in `loader.rs`.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::defaults::{DEFAULT_BIND_HOST, DEFAULT_EXPOSE_PORT};
use crate::error::{RecipeError, RecipeResult};
use crate::validate;

/// Complete build recipe: the static inputs of the bootstrap sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipe {
    /// Base runtime image providing the execution environment.
    pub base: BaseImage,
    /// Absolute working directory inside the image.
    pub workdir: PathBuf,
    /// Dependency manifest path, relative to the source tree root.
    pub manifest: PathBuf,
    /// Dependency installation options.
    #[serde(default)]
    pub install: InstallOptions,
    /// Source tree copy rules.
    #[serde(default)]
    pub source: SourceRules,
    /// Documentary network port declared as exposed.
    #[serde(default = "default_expose")]
    pub expose: u16,
    /// Launch command description executed at container start.
    pub runtime: RuntimeSpec,
}

impl Recipe {
    /// Validate the recipe against the bootstrap invariants.
    ///
    /// # Errors
    ///
    /// Returns an error when any field is out of range, when an exclusion
    /// glob fails to compile, or when the declared exposed port diverges
    /// from the launch command port.
    pub fn validate(&self) -> RecipeResult<()> {
        validate::validate(self)
    }
}

/// Immutable pre-built execution environment reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseImage {
    /// Image name (e.g. `python-slim`).
    pub name: String,
    /// Version tag (e.g. `3.11`).
    pub tag: String,
}

impl BaseImage {
    /// Render the `name:tag` reference string.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// Options applied to the dependency install step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InstallOptions {
    /// Skip reads and writes of the shared package download cache.
    #[serde(default)]
    pub no_cache: bool,
}

/// Rules applied while copying the application source tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SourceRules {
    /// Glob patterns excluded from the copy.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Launch command description: one process, one host:port pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeSpec {
    /// Server program invoked at container start.
    pub server: String,
    /// Entry point reference handed to the server.
    pub entrypoint: EntryPoint,
    /// Bind address for the launched process.
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Port the launched process must bind.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl RuntimeSpec {
    /// Arguments passed to the server program at container start.
    #[must_use]
    pub fn command_args(&self) -> Vec<String> {
        vec![
            self.entrypoint.to_string(),
            "--host".to_string(),
            self.host.to_string(),
            "--port".to_string(),
            self.port.to_string(),
        ]
    }
}

/// Reference to the application object served at launch, expressed as
/// `module:attribute`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct EntryPoint {
    /// Dotted module path containing the application object.
    pub module: String,
    /// Attribute name of the application object within the module.
    pub attribute: String,
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.module, self.attribute)
    }
}

impl FromStr for EntryPoint {
    type Err = RecipeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((module, attribute)) = value.split_once(':') else {
            return Err(RecipeError::InvalidEntryPoint {
                value: value.to_string(),
            });
        };

        let module_valid = !module.is_empty()
            && module
                .split('.')
                .all(validate::is_identifier);
        if !module_valid || !validate::is_identifier(attribute) {
            return Err(RecipeError::InvalidEntryPoint {
                value: value.to_string(),
            });
        }

        Ok(Self {
            module: module.to_string(),
            attribute: attribute.to_string(),
        })
    }
}

impl TryFrom<String> for EntryPoint {
    type Error = RecipeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntryPoint> for String {
    fn from(entry: EntryPoint) -> Self {
        entry.to_string()
    }
}

const fn default_expose() -> u16 {
    DEFAULT_EXPOSE_PORT
}

const fn default_host() -> IpAddr {
    DEFAULT_BIND_HOST
}

const fn default_port() -> u16 {
    DEFAULT_EXPOSE_PORT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_parses_and_formats() {
        let entry: EntryPoint = "main:app".parse().expect("entry point should parse");
        assert_eq!(entry.module, "main");
        assert_eq!(entry.attribute, "app");
        assert_eq!(entry.to_string(), "main:app");

        let nested: EntryPoint = "pkg.web.main:application"
            .parse()
            .expect("dotted module should parse");
        assert_eq!(nested.module, "pkg.web.main");
    }

    #[test]
    fn entry_point_rejects_malformed_references() {
        for bad in ["main", ":app", "main:", "1st:app", "main:app.run", "a b:c"] {
            assert!(
                bad.parse::<EntryPoint>().is_err(),
                "'{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn runtime_spec_renders_launch_arguments() {
        let spec = RuntimeSpec {
            server: "uvicorn".to_string(),
            entrypoint: "main:app".parse().expect("entry point"),
            host: DEFAULT_BIND_HOST,
            port: 8000,
        };
        assert_eq!(
            spec.command_args(),
            vec!["main:app", "--host", "0.0.0.0", "--port", "8000"]
        );
    }

    #[test]
    fn base_image_reference_joins_name_and_tag() {
        let base = BaseImage {
            name: "python-slim".to_string(),
            tag: "3.11".to_string(),
        };
        assert_eq!(base.reference(), "python-slim:3.11");
    }
}
