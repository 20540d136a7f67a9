//! Test fixtures: scratch image stores, source trees, and environment probes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use stowage_config::Recipe;
use tempfile::TempDir;

/// Returns `true` if a Python 3 interpreter is reachable for end-to-end tests.
#[must_use]
pub fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Scratch environment for bootstrap tests: an image store seeded with a base
/// image and a package index, plus an application source tree.
pub struct BootstrapFixture {
    temp: TempDir,
}

impl BootstrapFixture {
    /// Base image name seeded into the scratch store.
    pub const BASE_NAME: &'static str = "python-slim";
    /// Base image tag seeded into the scratch store.
    pub const BASE_TAG: &'static str = "3.11";

    /// Create a scratch store with the default base image and an empty
    /// source tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the scratch directories cannot be created.
    pub fn new() -> Result<Self> {
        let temp = TempDir::new().context("failed to create scratch directory")?;
        let fixture = Self { temp };

        let base = fixture
            .store_root()
            .join("bases")
            .join(Self::BASE_NAME)
            .join(Self::BASE_TAG);
        fs::create_dir_all(base.join("bin")).context("failed to seed base image")?;
        fs::write(base.join("bin").join("python3"), b"#!stub interpreter\n")
            .context("failed to seed base interpreter stub")?;

        fs::create_dir_all(fixture.store_root().join("packages"))
            .context("failed to seed package index")?;
        fs::create_dir_all(fixture.source_root()).context("failed to create source tree")?;

        Ok(fixture)
    }

    /// Root of the scratch image store.
    #[must_use]
    pub fn store_root(&self) -> PathBuf {
        self.temp.path().join("store")
    }

    /// Root of the scratch application source tree.
    #[must_use]
    pub fn source_root(&self) -> PathBuf {
        self.temp.path().join("src")
    }

    /// Add a `name==version` package archive to the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be written.
    pub fn add_package(&self, name: &str, version: &str) -> Result<()> {
        let archive = self
            .store_root()
            .join("packages")
            .join(format!("{name}-{version}.pkg"));
        fs::write(&archive, format!("package {name} {version}\n"))
            .with_context(|| format!("failed to write package archive {}", archive.display()))
    }

    /// Write the dependency manifest into the source tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be written.
    pub fn write_manifest(&self, lines: &[&str]) -> Result<()> {
        self.write_source_file("requirements.txt", &format!("{}\n", lines.join("\n")))
    }

    /// Write a file (creating parents) inside the source tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_source_file(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.source_root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, contents)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// A recipe matching the scratch environment, declaring port `port` and
    /// launching `server`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rendered recipe fails validation.
    pub fn recipe(&self, server: &str, port: u16) -> Result<Recipe> {
        let yaml = format!(
            r"
base:
  name: {name}
  tag: '{tag}'
workdir: /app
manifest: requirements.txt
install:
  no_cache: false
source:
  exclude: ['**/.git/**', '**/__pycache__/**']
expose: {port}
runtime:
  server: {server}
  entrypoint: 'main:app'
  host: 127.0.0.1
  port: {port}
",
            name = Self::BASE_NAME,
            tag = Self::BASE_TAG,
        );
        Recipe::from_yaml(&yaml).context("fixture recipe failed validation")
    }

    /// Path helper for assertions against the scratch store.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}
