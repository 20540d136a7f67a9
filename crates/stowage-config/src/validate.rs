//! Validation helpers for build recipes.
//!
//! The one invariant with teeth here is port consistency: a mismatch
//! between the declared exposed port and the launch command's port would
//! surface only as external connection failures at runtime, so a recipe
//! with diverging values is rejected at load time instead.

use globset::Glob;

use crate::error::{RecipeError, RecipeResult};
use crate::model::Recipe;

#[allow(clippy::redundant_pub_crate)]
pub(crate) fn validate(recipe: &Recipe) -> RecipeResult<()> {
    ensure_non_empty("base", "name", &recipe.base.name)?;
    ensure_non_empty("base", "tag", &recipe.base.tag)?;
    ensure_non_empty("runtime", "server", &recipe.runtime.server)?;

    if !recipe.workdir.is_absolute() {
        return Err(RecipeError::InvalidField {
            section: "recipe",
            field: "workdir",
            reason: "must be an absolute path".to_string(),
        });
    }

    if recipe.manifest.as_os_str().is_empty() || recipe.manifest.is_absolute() {
        return Err(RecipeError::InvalidField {
            section: "recipe",
            field: "manifest",
            reason: "must be a non-empty path relative to the source tree".to_string(),
        });
    }

    ensure_port("recipe", "expose", recipe.expose)?;
    ensure_port("runtime", "port", recipe.runtime.port)?;

    for pattern in &recipe.source.exclude {
        Glob::new(pattern).map_err(|err| RecipeError::InvalidGlob {
            pattern: pattern.clone(),
            reason: err.to_string(),
        })?;
    }

    if recipe.expose != recipe.runtime.port {
        return Err(RecipeError::PortMismatch {
            exposed: recipe.expose,
            launch: recipe.runtime.port,
        });
    }

    Ok(())
}

#[allow(clippy::redundant_pub_crate)]
pub(crate) fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn ensure_non_empty(section: &'static str, field: &'static str, value: &str) -> RecipeResult<()> {
    if value.trim().is_empty() {
        return Err(RecipeError::InvalidField {
            section,
            field,
            reason: "cannot be empty".to_string(),
        });
    }
    Ok(())
}

fn ensure_port(section: &'static str, field: &'static str, port: u16) -> RecipeResult<()> {
    if port == 0 {
        return Err(RecipeError::InvalidField {
            section,
            field,
            reason: "must be between 1 and 65535".to_string(),
        });
    }
    Ok(())
}
