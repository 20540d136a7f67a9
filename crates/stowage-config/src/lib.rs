#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Typed build recipes for the Stowage bootstrap sequence.
//!
//! Layout: `model.rs` (recipe models), `validate.rs` (validation/parsing
//! helpers), `loader.rs` (YAML file loading), `defaults.rs` (pinned default
//! values), `error.rs` (boundary errors).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use defaults::{DEFAULT_BIND_HOST, DEFAULT_EXPOSE_PORT, DEFAULT_RECIPE_FILE};
pub use error::{RecipeError, RecipeResult};
pub use model::{BaseImage, EntryPoint, InstallOptions, Recipe, RuntimeSpec, SourceRules};
