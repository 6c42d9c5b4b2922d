//! The raw ( wire ) form of a manifest and its option tables.
//!
//! The core consumes manifests as JSON; TOML/YAML conversion is the
//! front-end's concern. Unknown keys fail with a field-qualified error at
//! every level.

use indexmap::IndexMap;
use pkgdb::db::PkgQueryArgs;
use pkgdb::registry::RegistryRaw;
use pkgdb::types::System;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::ManifestError;
use crate::descriptor::ManifestDescriptorRaw;
use crate::manifest::InstallId;

/// Package admission switches.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Allows {
    /// Whether to allow packages marked `unfree`.
    pub unfree: Option<bool>,
    /// Whether to allow packages marked `broken`.
    pub broken: Option<bool>,
    /// Restrict results to these license identifiers.
    pub licenses: Option<Vec<String>>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SemverOptions {
    /// Whether pre-release versions rank above releases.
    pub prefer_pre_releases: Option<bool>,
}

/// Global options applying to every descriptor of a manifest.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Options {
    /// The systems to resolve and lock for.
    pub systems: Option<Vec<System>>,
    pub allow: Option<Allows>,
    pub semver: Option<SemverOptions>,
}

impl Options {
    /// Clobber our fields with those set in `overrides`, field by field.
    pub fn merge(&mut self, overrides: Options) {
        if overrides.systems.is_some() {
            self.systems = overrides.systems;
        }
        if let Some(allow) = overrides.allow {
            let ours = self.allow.get_or_insert_with(Allows::default);
            if allow.unfree.is_some() {
                ours.unfree = allow.unfree;
            }
            if allow.broken.is_some() {
                ours.broken = allow.broken;
            }
            if allow.licenses.is_some() {
                ours.licenses = allow.licenses;
            }
        }
        if let Some(semver) = overrides.semver {
            let ours = self.semver.get_or_insert_with(SemverOptions::default);
            if semver.prefer_pre_releases.is_some() {
                ours.prefer_pre_releases = semver.prefer_pre_releases;
            }
        }
    }

    /// Layer these options onto a base set of query arguments.
    pub fn fill_pkg_query_args(&self, args: &mut PkgQueryArgs) {
        if let Some(systems) = &self.systems {
            args.systems = systems.clone();
        }
        if let Some(allow) = &self.allow {
            if let Some(unfree) = allow.unfree {
                args.allow_unfree = unfree;
            }
            if let Some(broken) = allow.broken {
                args.allow_broken = broken;
            }
            if allow.licenses.is_some() {
                args.licenses = allow.licenses.clone();
            }
        }
        if let Some(prefer) = self.semver.as_ref().and_then(|semver| semver.prefer_pre_releases) {
            args.prefer_pre_releases = prefer;
        }
    }
}

/// An inline activation hook. At most one of the fields may be set.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookRaw {
    /// Inline script sourced during activation.
    pub script: Option<String>,
    /// Path of a script file sourced during activation.
    pub file: Option<String>,
}

impl HookRaw {
    pub fn check(&self) -> Result<(), ManifestError> {
        if self.script.is_some() && self.file.is_some() {
            return Err(ManifestError::HookConflict);
        }
        Ok(())
    }
}

/// Base environment to extend. At most one of the fields may be set.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvBaseRaw {
    pub floxhub: Option<String>,
    pub dir: Option<String>,
}

impl EnvBaseRaw {
    pub fn check(&self) -> Result<(), ManifestError> {
        if self.floxhub.is_some() && self.dir.is_some() {
            return Err(ManifestError::EnvBaseConflict);
        }
        Ok(())
    }
}

/// The raw form of a whole manifest.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ManifestRaw {
    /// Install descriptors keyed by install id.
    pub install: Option<IndexMap<InstallId, ManifestDescriptorRaw>>,
    /// Input flakes available for resolution.
    pub registry: Option<RegistryRaw>,
    /// Environment variables set during activation.
    pub vars: Option<IndexMap<String, String>>,
    pub hook: Option<HookRaw>,
    pub options: Option<Options>,
    pub env_base: Option<EnvBaseRaw>,
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn merge_is_last_wins_per_field() {
        let mut base: Options = serde_json::from_value(json!({
            "systems": ["x86_64-linux"],
            "allow": { "unfree": false, "broken": false },
        }))
        .unwrap();
        let overlay: Options = serde_json::from_value(json!({
            "allow": { "unfree": true },
            "semver": { "prefer-pre-releases": true },
        }))
        .unwrap();
        base.merge(overlay);
        assert_eq!(base.systems, Some(vec!["x86_64-linux".to_string()]));
        let allow = base.allow.unwrap();
        assert_eq!(allow.unfree, Some(true));
        assert_eq!(allow.broken, Some(false));
        assert_eq!(
            base.semver.unwrap().prefer_pre_releases,
            Some(true)
        );
    }

    #[test]
    fn options_fill_query_args() {
        let options: Options = serde_json::from_value(json!({
            "systems": ["x86_64-linux", "aarch64-linux"],
            "allow": { "unfree": false, "licenses": ["MIT"] },
            "semver": { "prefer-pre-releases": true },
        }))
        .unwrap();
        let mut args = PkgQueryArgs::default();
        options.fill_pkg_query_args(&mut args);
        assert!(!args.allow_unfree);
        assert!(!args.allow_broken);
        assert_eq!(args.licenses, Some(vec!["MIT".to_string()]));
        assert!(args.prefer_pre_releases);
        assert_eq!(args.systems.len(), 2);
    }

    #[test]
    fn unknown_keys_are_field_qualified_errors() {
        let result: Result<ManifestRaw, _> = serde_json::from_value(json!({
            "install": {},
            "color": "red",
        }));
        let message = result.unwrap_err().to_string();
        assert!(message.contains("color"), "unexpected message: {message}");
    }

    #[test]
    fn hook_and_env_base_exclusivity() {
        let hook: HookRaw = serde_json::from_value(json!({
            "script": "echo hi",
            "file": "hook.sh",
        }))
        .unwrap();
        assert!(hook.check().is_err());

        let env_base: EnvBaseRaw = serde_json::from_value(json!({
            "floxhub": "owner/env",
            "dir": "/some/dir",
        }))
        .unwrap();
        assert!(env_base.check().is_err());
    }
}
