//! Per-flake package metadata indexing and querying.
//!
//! A locked flake exposes a lazy tree of package derivations. This crate
//! evaluates such trees through an opaque [`eval::AttrCursor`], persists the
//! extracted package attributes into a per-fingerprint SQLite database
//! ( a "PkgDb" ), and answers ranked package queries used for interactive
//! search and for deterministic dependency resolution.
//!
//! The main entry points are:
//! - [`registry::RegistryRaw`] + [`db::PkgDbRegistry`] to open/create the
//!   databases for a set of named flake inputs,
//! - [`db::PkgDbInput::scrape_systems`] to populate them,
//! - [`db::PkgQuery`] to run ranked queries against them.

pub mod db;
pub mod eval;
pub mod flake;
pub mod package;
pub mod ranges;
pub mod registry;
pub mod types;
pub mod versions;
