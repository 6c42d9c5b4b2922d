//! Deterministic dependency resolution against pkgdb databases.
//!
//! A user manifest declares *install descriptors* partitioned into groups;
//! the [`environment::Environment`] locker maps them onto concrete packages
//! from a registry of flake inputs, reusing entries from a prior lockfile
//! group by group where nothing invalidated them.

pub mod descriptor;
pub mod environment;
pub mod lockfile;
pub mod manifest;
pub mod search;

pub use descriptor::{DescriptorError, ManifestDescriptor, ManifestDescriptorRaw};
pub use environment::{Environment, LockerContext, ResolutionError, Upgrades};
pub use lockfile::{
    LockedInputRaw,
    LockedPackageInfo,
    LockedPackageRaw,
    Lockfile,
    LockfileError,
    LockfileRaw,
    SystemPackages,
};
pub use manifest::{InstallId, Manifest, ManifestError, ManifestRaw, DEFAULT_GROUP_NAME};
pub use search::{search, SearchError, SearchHit, SearchParams, SearchQuery, SearchResults};
