//! Install descriptors: the per-package entries of a manifest's `install`
//! table, in raw and normalized form.

use pkgdb::db::PkgQueryArgs;
use pkgdb::flake::FlakeRef;
use pkgdb::ranges::range_prefers_pre_releases;
use pkgdb::types::{split_attr_path, AttrPath, AttrPathGlob, Subtree, System};
use pkgdb::versions::is_semver;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Default priority of an install entry when unset.
pub const DEFAULT_PRIORITY: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("'abs-path' must have at least three elements")]
    AbsPathTooShort,
    #[error("'abs-path' must have at least four elements for catalog paths")]
    CatalogPathTooShort,
    #[error("'abs-path' may only contain a glob as its second element")]
    BadGlob,
    #[error("unrecognized subtree '{0}' in 'abs-path'")]
    InvalidSubtree(String),
    #[error("'stability' cannot be used with non-catalog paths")]
    StabilityConflict,
    #[error("'systems' conflicts with the 'abs-path' system element")]
    SystemsConflict,
    #[error("'path' conflicts with 'abs-path'")]
    PathConflict,
    #[error("'package-repository' may not be used with 'input'")]
    RepositoryInputConflict,
}

/// A dot separated attribute path, or its list representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelPathRaw {
    Parts(AttrPath),
    Dotted(String),
}

impl RelPathRaw {
    fn split(&self) -> AttrPath {
        match self {
            RelPathRaw::Parts(parts) => parts.clone(),
            RelPathRaw::Dotted(dotted) => split_attr_path(dotted),
        }
    }
}

/// An absolute attribute path which may glob its `system` element, either
/// as a dotted string ( `legacyPackages.*.hello` ) or a list whose second
/// element may be `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AbsPathRaw {
    Glob(AttrPathGlob),
    Dotted(String),
}

impl AbsPathRaw {
    fn split(&self) -> AttrPathGlob {
        match self {
            AbsPathRaw::Glob(glob) => glob.clone(),
            AbsPathRaw::Dotted(dotted) => split_attr_path(dotted)
                .into_iter()
                .enumerate()
                .map(|(idx, part)| {
                    // `null` or `*` in the second element is a system glob.
                    if idx == 1 && (part == "null" || part == "*") {
                        None
                    } else {
                        Some(part)
                    }
                })
                .collect(),
        }
    }
}

/// The raw form of one `install.<id>` table entry.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ManifestDescriptorRaw {
    /// Match `name`, `pname`, or the package attribute name.
    pub name: Option<String>,
    /// Match an exact version or a semver range, depending on its shape.
    pub version: Option<String>,
    /// Match a catalog stability.
    pub stability: Option<String>,
    /// Match a relative attribute path.
    pub path: Option<RelPathRaw>,
    /// Match an absolute attribute path, allowing a glob for `system`.
    pub abs_path: Option<AbsPathRaw>,
    /// Only resolve for the given systems.
    pub systems: Option<Vec<System>>,
    /// Whether resolution is allowed to fail without producing errors.
    pub optional: Option<bool>,
    /// Named group that the package is a member of.
    pub package_group: Option<String>,
    /// Force resolution from a given flake reference.
    pub package_repository: Option<FlakeRef>,
    /// Force resolution from a named registry input.
    pub input: Option<FlakeRef>,
    /// Installation priority of the entry.
    pub priority: Option<u64>,
}

/// A normalized install descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDescriptor {
    pub name: Option<String>,
    /// An exact version to match.
    pub version: Option<String>,
    /// A semver range to match. Mutually exclusive with `version`.
    pub semver: Option<String>,
    pub optional: bool,
    pub group: Option<String>,
    pub subtree: Option<Subtree>,
    pub systems: Option<Vec<System>>,
    pub stability: Option<String>,
    pub path: Option<AttrPath>,
    pub input: Option<FlakeRef>,
    pub priority: u64,
}

impl TryFrom<&ManifestDescriptorRaw> for ManifestDescriptor {
    type Error = DescriptorError;

    fn try_from(raw: &ManifestDescriptorRaw) -> Result<Self, Self::Error> {
        let mut descriptor = ManifestDescriptor {
            name: raw.name.clone(),
            version: None,
            semver: None,
            optional: raw.optional.unwrap_or(false),
            group: raw.package_group.clone(),
            subtree: None,
            systems: None,
            stability: None,
            path: None,
            input: None,
            priority: raw.priority.unwrap_or(DEFAULT_PRIORITY),
        };

        // NOTE: "4.2.0" is an exact version, but "4.2" is a range! An exact
        // match on a loose version needs the "=4.2" form.
        if let Some(version) = &raw.version {
            match version.chars().next() {
                Some('=') => descriptor.version = Some(version[1..].to_string()),
                Some('*' | '~' | '^' | '>' | '<') => descriptor.semver = Some(version.clone()),
                _ if is_semver(version) => descriptor.version = Some(version.clone()),
                _ => descriptor.semver = Some(version.clone()),
            }
        }

        if let Some(abs_path) = &raw.abs_path {
            init_from_abs_path(&mut descriptor, raw, &abs_path.split())?;
        } else if let Some(stability) = &raw.stability {
            descriptor.subtree = Some(Subtree::Catalog);
            descriptor.stability = Some(stability.clone());
        }

        // Only set if it wasn't pinned by `abs-path`.
        if descriptor.systems.is_none() {
            descriptor.systems = raw.systems.clone();
        }

        if let Some(rel_path) = &raw.path {
            let rel_path = rel_path.split();
            match &descriptor.path {
                Some(from_abs) if *from_abs != rel_path => {
                    return Err(DescriptorError::PathConflict);
                },
                _ => descriptor.path = Some(rel_path),
            }
        }

        match (&raw.package_repository, &raw.input) {
            (Some(_), Some(_)) => return Err(DescriptorError::RepositoryInputConflict),
            (Some(repository), None) => descriptor.input = Some(repository.clone()),
            (None, Some(input)) => descriptor.input = Some(input.clone()),
            (None, None) => (),
        }

        Ok(descriptor)
    }
}

/// Derive `subtree`, `stability`, `systems`, and `path` from an absolute
/// attribute path.
fn init_from_abs_path(
    descriptor: &mut ManifestDescriptor,
    raw: &ManifestDescriptorRaw,
    glob: &AttrPathGlob,
) -> Result<(), DescriptorError> {
    if glob.len() < 3 {
        return Err(DescriptorError::AbsPathTooShort);
    }
    let subtree_name = glob[0].as_ref().ok_or(DescriptorError::BadGlob)?;
    let subtree: Subtree = subtree_name
        .parse()
        .map_err(|_| DescriptorError::InvalidSubtree(subtree_name.clone()))?;
    descriptor.subtree = Some(subtree);

    if raw.stability.is_some() && subtree != Subtree::Catalog {
        return Err(DescriptorError::StabilityConflict);
    }

    let rel_start = if subtree == Subtree::Catalog {
        if glob.len() < 4 {
            return Err(DescriptorError::CatalogPathTooShort);
        }
        descriptor.stability = Some(glob[2].clone().ok_or(DescriptorError::BadGlob)?);
        3
    } else {
        2
    };
    let mut rel_path = Vec::with_capacity(glob.len() - rel_start);
    for element in &glob[rel_start..] {
        rel_path.push(element.clone().ok_or(DescriptorError::BadGlob)?);
    }
    descriptor.path = Some(rel_path);

    if let Some(system) = &glob[1] {
        let systems = vec![system.clone()];
        if let Some(raw_systems) = &raw.systems {
            if *raw_systems != systems {
                return Err(DescriptorError::SystemsConflict);
            }
        }
        descriptor.systems = Some(systems);
    }
    Ok(())
}

impl ManifestDescriptor {
    /// Whether `system` is in scope for this descriptor.
    pub fn in_scope_for(&self, system: &str) -> bool {
        self.systems
            .as_ref()
            .is_none_or(|systems| systems.iter().any(|candidate| candidate == system))
    }

    /// Whether this descriptor would produce the same resolution as
    /// `other` for `system`.
    ///
    /// `priority` plays no part in resolution and is ignored; `systems`
    /// lists are compared only by whether `system` is in scope in both.
    pub fn same_resolution(&self, other: &Self, system: &str) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.semver == other.semver
            && self.subtree == other.subtree
            && self.stability == other.stability
            && self.path == other.path
            && self.input == other.input
            && self.group == other.group
            && self.optional == other.optional
            && self.in_scope_for(system) == other.in_scope_for(system)
    }

    /// Layer this descriptor's requirements onto a set of query arguments.
    pub fn fill_pkg_query_args(&self, args: &mut PkgQueryArgs) {
        if let Some(name) = &self.name {
            args.match_name = Some(name.clone());
        }
        if let Some(version) = &self.version {
            args.version = Some(version.clone());
        } else if let Some(semver) = &self.semver {
            args.semver = Some(semver.clone());
            // `~<VERSION>-<TAG>` ranges ask for pre-release ordering.
            if range_prefers_pre_releases(semver) {
                args.prefer_pre_releases = true;
            }
        }
        if let Some(subtree) = self.subtree {
            args.subtrees = Some(vec![subtree]);
        }
        if let Some(systems) = &self.systems {
            args.systems = systems.clone();
        }
        if let Some(stability) = &self.stability {
            args.stabilities = Some(vec![stability.clone()]);
        }
        if let Some(path) = &self.path {
            args.rel_path = Some(path.clone());
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn descriptor(json: serde_json::Value) -> Result<ManifestDescriptor, DescriptorError> {
        let raw: ManifestDescriptorRaw = serde_json::from_value(json).unwrap();
        ManifestDescriptor::try_from(&raw)
    }

    #[test]
    fn version_forms_split_into_exact_and_range() {
        let exact = descriptor(json!({ "version": "4.2.0" })).unwrap();
        assert_eq!(exact.version.as_deref(), Some("4.2.0"));
        assert_eq!(exact.semver, None);

        let range = descriptor(json!({ "version": "4.2" })).unwrap();
        assert_eq!(range.version, None);
        assert_eq!(range.semver.as_deref(), Some("4.2"));

        let pinned = descriptor(json!({ "version": "=4.2" })).unwrap();
        assert_eq!(pinned.version.as_deref(), Some("4.2"));
        assert_eq!(pinned.semver, None);

        let caret = descriptor(json!({ "version": "^4.2" })).unwrap();
        assert_eq!(caret.semver.as_deref(), Some("^4.2"));
    }

    #[test]
    fn abs_path_derives_subtree_system_and_path() {
        let parsed = descriptor(json!({
            "abs-path": "legacyPackages.x86_64-linux.python3Packages.pip",
        }))
        .unwrap();
        assert_eq!(parsed.subtree, Some(Subtree::LegacyPackages));
        assert_eq!(parsed.systems, Some(vec!["x86_64-linux".to_string()]));
        assert_eq!(
            parsed.path,
            Some(vec!["python3Packages".to_string(), "pip".to_string()])
        );
    }

    #[test]
    fn abs_path_glob_leaves_systems_unset() {
        let dotted = descriptor(json!({ "abs-path": "legacyPackages.*.hello" })).unwrap();
        assert_eq!(dotted.systems, None);
        assert_eq!(dotted.path, Some(vec!["hello".to_string()]));

        let listed = descriptor(json!({
            "abs-path": ["legacyPackages", null, "hello"],
        }))
        .unwrap();
        assert_eq!(listed, dotted);
    }

    #[test]
    fn catalog_abs_path_carries_stability() {
        let parsed = descriptor(json!({
            "abs-path": "catalog.x86_64-linux.stable.hello",
        }))
        .unwrap();
        assert_eq!(parsed.subtree, Some(Subtree::Catalog));
        assert_eq!(parsed.stability.as_deref(), Some("stable"));
        assert_eq!(parsed.path, Some(vec!["hello".to_string()]));

        assert_eq!(
            descriptor(json!({ "abs-path": "catalog.x86_64-linux.hello" })),
            Err(DescriptorError::CatalogPathTooShort)
        );
    }

    #[test]
    fn abs_path_rejections() {
        assert_eq!(
            descriptor(json!({ "abs-path": "legacyPackages.x86_64-linux" })),
            Err(DescriptorError::AbsPathTooShort)
        );
        assert_eq!(
            descriptor(json!({ "abs-path": [null, "x86_64-linux", "hello"] })),
            Err(DescriptorError::BadGlob)
        );
        assert_eq!(
            descriptor(json!({ "abs-path": "junk.x86_64-linux.hello" })),
            Err(DescriptorError::InvalidSubtree("junk".to_string()))
        );
        assert_eq!(
            descriptor(json!({
                "abs-path": "legacyPackages.x86_64-linux.hello",
                "stability": "stable",
            })),
            Err(DescriptorError::StabilityConflict)
        );
        assert_eq!(
            descriptor(json!({
                "abs-path": "legacyPackages.x86_64-linux.hello",
                "systems": ["aarch64-linux"],
            })),
            Err(DescriptorError::SystemsConflict)
        );
        assert_eq!(
            descriptor(json!({
                "abs-path": "legacyPackages.x86_64-linux.hello",
                "path": "goodbye",
            })),
            Err(DescriptorError::PathConflict)
        );
    }

    #[test]
    fn stability_without_abs_path_selects_the_catalog() {
        let parsed = descriptor(json!({ "stability": "staging" })).unwrap();
        assert_eq!(parsed.subtree, Some(Subtree::Catalog));
        assert_eq!(parsed.stability.as_deref(), Some("staging"));
    }

    #[test]
    fn repository_and_input_are_mutually_exclusive() {
        assert_eq!(
            descriptor(json!({
                "package-repository": "github:example/flake",
                "input": "nixpkgs",
            })),
            Err(DescriptorError::RepositoryInputConflict)
        );
        let parsed = descriptor(json!({ "package-repository": "github:example/flake" })).unwrap();
        assert_eq!(parsed.input, Some(json!("github:example/flake")));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: Result<ManifestDescriptorRaw, _> =
            serde_json::from_value(json!({ "nmae": "hello" }));
        let message = parsed.unwrap_err().to_string();
        assert!(message.contains("nmae"), "unexpected message: {message}");
    }

    #[test]
    fn same_resolution_ignores_priority_and_out_of_scope_systems() {
        let base = descriptor(json!({ "name": "hello", "priority": 1 })).unwrap();
        let reprioritized = descriptor(json!({ "name": "hello", "priority": 9 })).unwrap();
        assert!(base.same_resolution(&reprioritized, "x86_64-linux"));

        // Adding an unrelated system does not invalidate this system.
        let scoped = descriptor(json!({
            "name": "hello",
            "systems": ["x86_64-linux", "aarch64-darwin"],
        }))
        .unwrap();
        assert!(base.same_resolution(&scoped, "x86_64-linux"));
        assert!(!base.same_resolution(&scoped, "aarch64-linux"));

        let regrouped = descriptor(json!({ "name": "hello", "package-group": "red" })).unwrap();
        assert!(!base.same_resolution(&regrouped, "x86_64-linux"));
    }

    #[test]
    fn fills_query_args() {
        let parsed = descriptor(json!({
            "name": "hello",
            "version": "~2.12-rc",
            "systems": ["x86_64-linux"],
        }))
        .unwrap();
        let mut args = PkgQueryArgs::default();
        parsed.fill_pkg_query_args(&mut args);
        assert_eq!(args.match_name.as_deref(), Some("hello"));
        assert_eq!(args.semver.as_deref(), Some("~2.12-rc"));
        assert!(args.prefer_pre_releases);
        assert_eq!(args.systems, vec!["x86_64-linux".to_string()]);
    }
}
