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

//! Layer-cached image build pipeline for the Stowage bootstrap sequence.
//!
//! A build consumes a validated [`stowage_config::Recipe`] plus a source
//! tree and produces an immutable image in the local [`store::ImageStore`].
//! Each step derives a content digest chained from its parent, so a rebuild
//! over unchanged inputs reuses every cached layer and yields the same
//! image identifier.
//!
//! Layout: `store.rs` (store layout and layer commits), `manifest.rs`
//! (dependency manifest parsing), `image.rs` (image manifest records),
//! `service.rs` (the step pipeline), `export.rs` (tarball export).

pub mod error;
pub mod export;
pub mod image;
pub mod manifest;
pub mod service;
pub mod store;

pub use error::{BuildError, BuildResult};
pub use export::export_image;
pub use image::{ImageConfig, ImageManifest, LaunchSpec, LayerRecord};
pub use manifest::Requirement;
pub use service::{BuildReport, BuildRequest, BuildService};
pub use store::ImageStore;
