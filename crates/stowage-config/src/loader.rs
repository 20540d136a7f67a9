//! YAML recipe loading.
//!
//! # Design
//! - Keep IO at the edge: `load` reads and delegates to `from_yaml`, which is
//!   what unit tests use directly.
//! - Every loaded recipe is validated before it is handed out; an invalid
//!   recipe never reaches the build pipeline.

use std::fs;
use std::path::Path;

use crate::error::{RecipeError, RecipeResult};
use crate::model::Recipe;

impl Recipe {
    /// Load and validate a recipe from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, fails to parse, or
    /// fails validation.
    pub fn load(path: &Path) -> RecipeResult<Self> {
        let raw = fs::read_to_string(path).map_err(|source| RecipeError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let recipe: Self =
            serde_yaml::from_str(&raw).map_err(|source| RecipeError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        recipe.validate()?;
        Ok(recipe)
    }

    /// Parse and validate a recipe from an in-memory YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document fails to parse or fails validation.
    pub fn from_yaml(raw: &str) -> RecipeResult<Self> {
        let recipe: Self =
            serde_yaml::from_str(raw).map_err(|source| RecipeError::Parse {
                path: Path::new("<inline>").to_path_buf(),
                source,
            })?;

        recipe.validate()?;
        Ok(recipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RECIPE: &str = r"
base:
  name: python-slim
  tag: '3.11'
workdir: /app
manifest: requirements.txt
install:
  no_cache: true
source:
  exclude: ['**/.git/**', '**/__pycache__/**']
expose: 8000
runtime:
  server: uvicorn
  entrypoint: 'main:app'
  host: 0.0.0.0
  port: 8000
";

    #[test]
    fn parses_full_recipe() {
        let recipe = Recipe::from_yaml(SAMPLE_RECIPE).expect("recipe should parse");
        assert_eq!(recipe.base.reference(), "python-slim:3.11");
        assert!(recipe.install.no_cache);
        assert_eq!(recipe.expose, 8000);
        assert_eq!(recipe.runtime.entrypoint.to_string(), "main:app");
        assert_eq!(recipe.source.exclude.len(), 2);
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let minimal = r"
base:
  name: python-slim
  tag: '3.11'
workdir: /app
manifest: requirements.txt
runtime:
  server: uvicorn
  entrypoint: 'main:app'
";
        let recipe = Recipe::from_yaml(minimal).expect("minimal recipe should parse");
        assert!(!recipe.install.no_cache);
        assert!(recipe.source.exclude.is_empty());
        assert_eq!(recipe.expose, 8000);
        assert_eq!(recipe.runtime.port, 8000);
        assert_eq!(recipe.runtime.host.to_string(), "0.0.0.0");
    }

    #[test]
    fn malformed_entry_point_fails_parse() {
        let bad = SAMPLE_RECIPE.replace("'main:app'", "'main'");
        assert!(matches!(
            Recipe::from_yaml(&bad).unwrap_err(),
            RecipeError::Parse { .. }
        ));
    }

    #[test]
    fn missing_file_reports_io_error() {
        let err = Recipe::load(Path::new("/definitely/missing/stowage.yaml")).unwrap_err();
        assert!(matches!(err, RecipeError::Io { .. }));
    }
}
