//! Default values pinned for build recipes.
//!
//! # Design
//! - Centralize defaults so recipe parsing and CLI expectations stay consistent.

use std::net::{IpAddr, Ipv4Addr};

/// Recipe file name consulted when no explicit path is provided.
pub const DEFAULT_RECIPE_FILE: &str = "stowage.yaml";
/// Port declared as exposed when the recipe omits one.
pub const DEFAULT_EXPOSE_PORT: u16 = 8000;
/// Bind host used when the recipe omits one (all interfaces).
pub const DEFAULT_BIND_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
