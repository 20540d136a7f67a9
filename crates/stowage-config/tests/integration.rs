//! File-based recipe loading scenarios.

use std::fs;

use stowage_config::{DEFAULT_RECIPE_FILE, Recipe, RecipeError};
use tempfile::TempDir;

const RECIPE: &str = r"
base:
  name: python-slim
  tag: '3.11'
workdir: /app
manifest: requirements.txt
install:
  no_cache: true
expose: 8000
runtime:
  server: uvicorn
  entrypoint: 'main:app'
  host: 0.0.0.0
  port: 8000
";

#[test]
fn loads_recipe_from_disk() {
    let temp = TempDir::new().expect("tempdir");
    let path = temp.path().join(DEFAULT_RECIPE_FILE);
    fs::write(&path, RECIPE).expect("write recipe");

    let recipe = Recipe::load(&path).expect("recipe should load");
    assert_eq!(recipe.base.name, "python-slim");
    assert_eq!(recipe.workdir.to_string_lossy(), "/app");
    assert_eq!(recipe.runtime.port, recipe.expose);
}

#[test]
fn mismatched_ports_fail_at_load_time() {
    let temp = TempDir::new().expect("tempdir");
    let path = temp.path().join(DEFAULT_RECIPE_FILE);
    fs::write(&path, RECIPE.replace("port: 8000", "port: 9000")).expect("write recipe");

    let err = Recipe::load(&path).unwrap_err();
    assert!(matches!(
        err,
        RecipeError::PortMismatch {
            exposed: 8000,
            launch: 9000
        }
    ));
}

#[test]
fn garbage_yaml_fails_parse() {
    let temp = TempDir::new().expect("tempdir");
    let path = temp.path().join(DEFAULT_RECIPE_FILE);
    fs::write(&path, "base: [not, a, mapping]").expect("write recipe");

    assert!(matches!(
        Recipe::load(&path).unwrap_err(),
        RecipeError::Parse { .. }
    ));
}
