//! Shared type aliases and enumerations used across the crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A platform identifier such as `x86_64-linux`.
pub type System = String;

/// An attribute path such as `["legacyPackages", "x86_64-linux", "hello"]`.
pub type AttrPath = Vec<String>;

/// An attribute path which may contain a glob ( `None` ) for its
/// `system` element.
pub type AttrPathGlob = Vec<Option<String>>;

/// Systems recognized by query validation.
pub const DEFAULT_SYSTEMS: [&str; 4] = [
    "aarch64-darwin",
    "aarch64-linux",
    "x86_64-darwin",
    "x86_64-linux",
];

/// The fixed set of catalog stabilities.
pub const STABILITIES: [&str; 3] = ["stable", "staging", "unstable"];

/// The `system` of the host running this process.
pub fn host_system() -> System {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    format!("{}-{}", std::env::consts::ARCH, os)
}

/// The top-level category under a flake's output tree.
///
/// `packages` and `legacyPackages` paths have the shape
/// `<subtree>.<system>.<attrs..>`, while `catalog` paths carry an additional
/// stability: `catalog.<system>.<stability>.<attrs..>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subtree {
    Packages,
    LegacyPackages,
    Catalog,
}

impl Subtree {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subtree::Packages => "packages",
            Subtree::LegacyPackages => "legacyPackages",
            Subtree::Catalog => "catalog",
        }
    }

    /// The number of leading path elements before the first package
    /// attribute: `<subtree>.<system>` plus `<stability>` for catalogs.
    pub fn prefix_len(&self) -> usize {
        match self {
            Subtree::Catalog => 3,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized subtree '{0}'")]
pub struct ParseSubtreeError(pub String);

impl FromStr for Subtree {
    type Err = ParseSubtreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "packages" => Ok(Subtree::Packages),
            "legacyPackages" => Ok(Subtree::LegacyPackages),
            "catalog" => Ok(Subtree::Catalog),
            other => Err(ParseSubtreeError(other.to_string())),
        }
    }
}

impl fmt::Display for Subtree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a dotted attribute path string into its components.
pub fn split_attr_path(path: &str) -> AttrPath {
    path.split('.').map(|part| part.to_string()).collect()
}
