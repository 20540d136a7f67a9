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

//! Telemetry primitives shared across the Stowage workspace.
//!
//! This crate centralises logging and metrics so the build pipeline, the
//! container runtime, and the delivery surfaces adopt a consistent
//! observability story.
//!
//! Layout: `init.rs` (tracing subscriber setup), `context.rs` (application
//! span guard), `metrics.rs` (Prometheus registry and snapshots).

pub mod context;
pub mod init;
pub mod metrics;

pub use context::GlobalContextGuard;
pub use init::{DEFAULT_LOG_LEVEL, LogFormat, LoggingConfig, build_sha, init_logging};
pub use metrics::{Metrics, MetricsSnapshot};
