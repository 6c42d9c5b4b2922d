//! The normalized manifest: validated descriptors partitioned into groups.

mod raw;

use indexmap::IndexMap;
use pkgdb::flake::{FlakeError, FlakeLocker};
use pkgdb::registry::RegistryRaw;
pub use raw::{Allows, EnvBaseRaw, HookRaw, ManifestRaw, Options, SemverOptions};

use crate::descriptor::{DescriptorError, ManifestDescriptor};

/// The stable key by which a descriptor is addressed in a manifest.
pub type InstallId = String;

/// Descriptors keyed by install id, in manifest declaration order.
pub type InstallDescriptors = IndexMap<InstallId, ManifestDescriptor>;

/// The sentinel group for descriptors without an explicit `package-group`.
pub const DEFAULT_GROUP_NAME: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    ParseJson(#[source] serde_json::Error),
    #[error("manifest may only define one of 'env-base.floxhub' or 'env-base.dir'")]
    EnvBaseConflict,
    #[error("manifest may only define one of 'hook.script' or 'hook.file'")]
    HookConflict,
    #[error("invalid descriptor 'install.{install_id}': {source}")]
    InvalidDescriptor {
        install_id: InstallId,
        #[source]
        source: DescriptorError,
    },
}

/// A validated manifest with normalized descriptors. The default value is
/// the empty manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    raw: ManifestRaw,
    descriptors: InstallDescriptors,
}

impl Manifest {
    /// Validate a raw manifest and normalize its descriptors.
    ///
    /// A descriptor specifying none of `name`/`path`/`abs-path` defaults
    /// its `name` to the install id.
    pub fn from_raw(raw: ManifestRaw) -> Result<Self, ManifestError> {
        if let Some(env_base) = &raw.env_base {
            env_base.check()?;
        }
        if let Some(hook) = &raw.hook {
            hook.check()?;
        }
        let mut descriptors = IndexMap::new();
        for (install_id, raw_descriptor) in raw.install.iter().flatten() {
            let mut descriptor =
                ManifestDescriptor::try_from(raw_descriptor).map_err(|source| {
                    ManifestError::InvalidDescriptor {
                        install_id: install_id.clone(),
                        source,
                    }
                })?;
            if descriptor.name.is_none() && descriptor.path.is_none() {
                descriptor.name = Some(install_id.clone());
            }
            descriptors.insert(install_id.clone(), descriptor);
        }
        Ok(Manifest { raw, descriptors })
    }

    /// Parse a manifest from its JSON form.
    pub fn from_json(json: serde_json::Value) -> Result<Self, ManifestError> {
        let raw: ManifestRaw =
            serde_json::from_value(json).map_err(ManifestError::ParseJson)?;
        Self::from_raw(raw)
    }

    pub fn raw(&self) -> &ManifestRaw {
        &self.raw
    }

    pub fn descriptors(&self) -> &InstallDescriptors {
        &self.descriptors
    }

    /// The manifest's registry, empty if undeclared.
    pub fn registry_raw(&self) -> RegistryRaw {
        self.raw.registry.clone().unwrap_or_default()
    }

    /// Partition descriptors into their groups, preserving declaration
    /// order within each group.
    pub fn grouped_descriptors(&self) -> IndexMap<String, InstallDescriptors> {
        let mut groups: IndexMap<String, InstallDescriptors> = IndexMap::new();
        for (install_id, descriptor) in &self.descriptors {
            let group = descriptor
                .group
                .clone()
                .unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string());
            groups
                .entry(group)
                .or_default()
                .insert(install_id.clone(), descriptor.clone());
        }
        groups
    }

    /// The manifest's registry with every input locked.
    pub fn locked_registry(
        &self,
        locker: &dyn FlakeLocker,
    ) -> Result<RegistryRaw, FlakeError> {
        lock_registry(&self.registry_raw(), locker)
    }
}

/// Lock every input of a registry, pinning its `from` reference.
pub fn lock_registry(
    registry: &RegistryRaw,
    locker: &dyn FlakeLocker,
) -> Result<RegistryRaw, FlakeError> {
    let mut locked = registry.clone();
    for (_, input) in locked.inputs.iter_mut() {
        let locked_flake = locker.lock_flake(&input.from)?;
        input.from = locked_flake.locked_ref.attrs;
    }
    Ok(locked)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn manifest(json: serde_json::Value) -> Manifest {
        Manifest::from_json(json).unwrap()
    }

    #[test]
    fn parses_a_full_manifest() {
        let parsed = manifest(json!({
            "install": {
                "hello": { "version": "^2.12" },
                "pip": { "path": "python3Packages.pip", "package-group": "python" },
            },
            "registry": {
                "inputs": {
                    "nixpkgs": { "from": "github:NixOS/nixpkgs" },
                },
            },
            "vars": { "GREETING": "hi" },
            "hook": { "script": "echo hi" },
            "options": { "systems": ["x86_64-linux"] },
        }));
        assert_eq!(parsed.descriptors().len(), 2);
        // Descriptors without name/path default their name to the id.
        assert_eq!(
            parsed.descriptors()["hello"].name.as_deref(),
            Some("hello")
        );
        // Descriptors with a path keep their name unset.
        assert_eq!(parsed.descriptors()["pip"].name, None);
    }

    #[test]
    fn groups_partition_by_package_group() {
        let parsed = manifest(json!({
            "install": {
                "hello": {},
                "curl": {},
                "pip": { "package-group": "python" },
                "requests": { "package-group": "python" },
            },
        }));
        let groups = parsed.grouped_descriptors();
        assert_eq!(
            groups.keys().collect::<Vec<_>>(),
            vec!["default", "python"]
        );
        assert_eq!(
            groups["default"].keys().collect::<Vec<_>>(),
            vec!["hello", "curl"]
        );
        assert_eq!(
            groups["python"].keys().collect::<Vec<_>>(),
            vec!["pip", "requests"]
        );
    }

    #[test]
    fn invalid_descriptors_carry_their_install_id() {
        let result = Manifest::from_json(json!({
            "install": {
                "hello": { "package-repository": "github:a/b", "input": "nixpkgs" },
            },
        }));
        let message = result.unwrap_err().to_string();
        assert!(
            message.contains("install.hello"),
            "unexpected message: {message}"
        );
    }

    #[test]
    fn exclusive_field_pairs_are_rejected() {
        assert!(matches!(
            Manifest::from_json(json!({
                "env-base": { "floxhub": "owner/env", "dir": "/tmp/env" },
            })),
            Err(ManifestError::EnvBaseConflict)
        ));
        assert!(matches!(
            Manifest::from_json(json!({
                "hook": { "script": "echo", "file": "hook.sh" },
            })),
            Err(ManifestError::HookConflict)
        ));
    }

    #[test]
    fn locks_registry_inputs() {
        use pkgdb::eval::memory::MemoryEvaluator;

        let evaluator = MemoryEvaluator::new();
        let parsed = manifest(json!({
            "registry": {
                "inputs": { "nixpkgs": { "from": "github:NixOS/nixpkgs" } },
            },
        }));
        let locked = parsed.locked_registry(&evaluator).unwrap();
        assert_eq!(
            locked.inputs["nixpkgs"].from,
            json!("github:NixOS/nixpkgs")
        );
    }
}
