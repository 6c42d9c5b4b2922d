//! The durable artifact pinning every install id to a concrete package in
//! a concrete locked input.

use std::collections::BTreeMap;

use pkgdb::db::PackageRow;
use pkgdb::flake::{Fingerprint, LockedFlake};
use pkgdb::registry::RegistryRaw;
use pkgdb::types::{AttrPath, System};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::manifest::{InstallId, Manifest, ManifestError, ManifestRaw};

/// The lockfile format version written by this build.
pub const LOCKFILE_VERSION: u64 = 0;

#[derive(Debug, thiserror::Error)]
pub enum LockfileError {
    #[error("failed to parse lockfile: {0}")]
    ParseJson(#[source] serde_json::Error),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// The locked input a package was resolved from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedInputRaw {
    pub fingerprint: Fingerprint,
    pub url: String,
    pub attrs: serde_json::Value,
}

impl From<&LockedFlake> for LockedInputRaw {
    fn from(flake: &LockedFlake) -> Self {
        LockedInputRaw {
            fingerprint: flake.fingerprint,
            url: flake.locked_ref.string.clone(),
            attrs: flake.locked_ref.attrs.clone(),
        }
    }
}

/// Compact projection of package metadata recorded next to the lock.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedPackageInfo {
    pub pname: Option<String>,
    pub version: Option<String>,
    pub license: Option<String>,
    pub broken: Option<bool>,
    pub unfree: Option<bool>,
}

impl From<&PackageRow> for LockedPackageInfo {
    fn from(row: &PackageRow) -> Self {
        LockedPackageInfo {
            pname: row.pname.clone(),
            version: row.version.clone(),
            license: row.license.clone(),
            broken: row.broken,
            unfree: row.unfree,
        }
    }
}

/// One locked install entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockedPackageRaw {
    pub input: LockedInputRaw,
    pub attr_path: AttrPath,
    pub priority: u64,
    pub info: LockedPackageInfo,
}

/// Locked entries of one system. `None` records a descriptor which was
/// deliberately out of scope for the system.
pub type SystemPackages = BTreeMap<InstallId, Option<LockedPackageRaw>>;

/// The wire form of a lockfile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LockfileRaw {
    pub manifest: ManifestRaw,
    pub registry: RegistryRaw,
    pub packages: BTreeMap<System, SystemPackages>,
    pub lockfile_version: u64,
}

/// A parsed lockfile with its embedded manifest re-validated.
#[derive(Debug, Clone, PartialEq)]
pub struct Lockfile {
    raw: LockfileRaw,
    manifest: Manifest,
}

impl Lockfile {
    pub fn from_raw(raw: LockfileRaw) -> Result<Self, LockfileError> {
        let manifest = Manifest::from_raw(raw.manifest.clone())?;
        Ok(Lockfile { raw, manifest })
    }

    pub fn from_json(json: serde_json::Value) -> Result<Self, LockfileError> {
        let raw: LockfileRaw =
            serde_json::from_value(json).map_err(LockfileError::ParseJson)?;
        Self::from_raw(raw)
    }

    pub fn raw(&self) -> &LockfileRaw {
        &self.raw
    }

    /// The manifest this lockfile was produced from.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Locked entries for one system, empty if the system was never
    /// locked.
    pub fn system_packages(&self, system: &str) -> SystemPackages {
        self.raw.packages.get(system).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn example() -> serde_json::Value {
        json!({
            "manifest": {
                "install": { "hello": { "version": "^2.12" } },
            },
            "registry": {
                "inputs": { "nixpkgs": { "from": "github:NixOS/nixpkgs" } },
            },
            "packages": {
                "x86_64-linux": {
                    "hello": {
                        "input": {
                            "fingerprint": pkgdb::flake::Fingerprint::of_bytes(b"nixpkgs").to_hex(),
                            "url": "github:NixOS/nixpkgs",
                            "attrs": { "type": "github" },
                        },
                        "attr-path": ["legacyPackages", "x86_64-linux", "hello"],
                        "priority": 5,
                        "info": {
                            "pname": "hello",
                            "version": "2.12.1",
                            "license": "GPL-3.0-or-later",
                            "broken": false,
                            "unfree": false,
                        },
                    },
                    "skipped": null,
                },
            },
            "lockfile-version": 0,
        })
    }

    #[test]
    fn round_trips_through_json() {
        let lockfile = Lockfile::from_json(example()).unwrap();
        let serialized = serde_json::to_value(lockfile.raw()).unwrap();
        assert_eq!(serialized, example());
    }

    #[test]
    fn null_entries_record_out_of_scope_descriptors() {
        let lockfile = Lockfile::from_json(example()).unwrap();
        let packages = lockfile.system_packages("x86_64-linux");
        assert!(packages["hello"].is_some());
        assert!(packages["skipped"].is_none());
        assert!(lockfile.system_packages("aarch64-linux").is_empty());
    }

    #[test]
    fn rejects_unknown_fields_and_bad_fingerprints() {
        let mut with_extra = example();
        with_extra["color"] = json!("red");
        assert!(matches!(
            Lockfile::from_json(with_extra),
            Err(LockfileError::ParseJson(_))
        ));

        let mut bad_hash = example();
        bad_hash["packages"]["x86_64-linux"]["hello"]["input"]["fingerprint"] =
            json!("not-a-hash");
        let err = Lockfile::from_json(bad_hash).unwrap_err();
        assert!(err.to_string().contains("fingerprint") || err.to_string().contains("hash"));
    }
}
