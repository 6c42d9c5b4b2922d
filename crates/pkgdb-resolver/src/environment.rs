//! Per-group, per-system resolution policy: decide which lockfile entries
//! survive and re-resolve the rest against the registry.

use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use itertools::Itertools;
use pkgdb::db::{
    PkgDbError,
    PkgDbInput,
    PkgDbRegistry,
    PkgQuery,
    PkgQueryArgs,
    PkgQueryError,
    RegistryError,
    RowId,
};
use pkgdb::eval::Evaluator;
use pkgdb::flake::{FlakeError, FlakeLocker};
use pkgdb::registry::RegistryRaw;
use pkgdb::types::{host_system, System};
use tracing::debug;

use crate::descriptor::ManifestDescriptor;
use crate::lockfile::{
    LockedInputRaw,
    LockedPackageInfo,
    LockedPackageRaw,
    Lockfile,
    LockfileError,
    LockfileRaw,
    SystemPackages,
    LOCKFILE_VERSION,
};
use crate::manifest::{
    lock_registry,
    InstallDescriptors,
    InstallId,
    Manifest,
    Options,
    DEFAULT_GROUP_NAME,
};

/// Which install ids must be re-resolved even when their group is
/// otherwise untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Upgrades {
    #[default]
    None,
    All,
    Only(Vec<InstallId>),
}

impl Upgrades {
    fn forces_relock(&self, group: &InstallDescriptors) -> bool {
        match self {
            Upgrades::None => false,
            Upgrades::All => true,
            Upgrades::Only(install_ids) => install_ids
                .iter()
                .any(|install_id| group.contains_key(install_id)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    /// No group-consistent resolution exists.
    #[error("failed to resolve some package(s):{0}")]
    ResolutionFailure(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Db(#[from] PkgDbError),
    #[error(transparent)]
    Query(#[from] PkgQueryError),
    #[error(transparent)]
    Flake(#[from] FlakeError),
    #[error(transparent)]
    Lockfile(#[from] LockfileError),
}

/// External services needed to produce a lock: the flake-lock oracle, the
/// evaluator, and the database cache directory.
pub struct LockerContext<'a> {
    pub locker: &'a dyn FlakeLocker,
    pub evaluator: Rc<dyn Evaluator>,
    pub cache_dir: &'a Path,
}

/// A manifest ( plus optional global manifest and prior lockfile ) ready
/// to be resolved for a set of systems.
pub struct Environment<'a> {
    global_manifest: Option<&'a Manifest>,
    manifest: &'a Manifest,
    old_lockfile: Option<&'a Lockfile>,
    upgrades: Upgrades,
}

impl<'a> Environment<'a> {
    pub fn new(
        global_manifest: Option<&'a Manifest>,
        manifest: &'a Manifest,
        old_lockfile: Option<&'a Lockfile>,
        upgrades: Upgrades,
    ) -> Self {
        Environment {
            global_manifest,
            manifest,
            old_lockfile,
            upgrades,
        }
    }

    /// Effective options: global, clobbered by the lockfile's manifest,
    /// clobbered by the project manifest.
    pub(crate) fn combined_options(&self) -> Options {
        let mut options = self
            .global_manifest
            .and_then(|manifest| manifest.raw().options.clone())
            .unwrap_or_default();
        if let Some(old_options) = self
            .old_lockfile
            .and_then(|lockfile| lockfile.manifest().raw().options.clone())
        {
            options.merge(old_options);
        }
        if let Some(project_options) = self.manifest.raw().options.clone() {
            options.merge(project_options);
        }
        options
    }

    /// Effective registry: the union of the global and project
    /// registries, with project inputs overriding by name.
    pub(crate) fn combined_registry(&self) -> RegistryRaw {
        let mut registry = self
            .global_manifest
            .map(Manifest::registry_raw)
            .unwrap_or_default();
        registry.merge(self.manifest.registry_raw());
        registry
    }

    fn base_query_args(&self, options: &Options) -> PkgQueryArgs {
        let mut args = PkgQueryArgs::default();
        options.fill_pkg_query_args(&mut args);
        args
    }

    /// Whether every member of `group` may be copied from the previous
    /// lockfile for `system`.
    fn group_is_locked(&self, group: &InstallDescriptors, system: &str) -> bool {
        let Some(old_lockfile) = self.old_lockfile else {
            return false;
        };
        if self.upgrades.forces_relock(group) {
            return false;
        }
        let old_descriptors = old_lockfile.manifest().descriptors();
        let old_packages = old_lockfile.system_packages(system);
        for (install_id, descriptor) in group {
            let Some(old_descriptor) = old_descriptors.get(install_id) else {
                return false;
            };
            if !descriptor.same_resolution(old_descriptor, system) {
                return false;
            }
            // The previous lock must actually contain an entry, even if it
            // is a null out-of-scope marker.
            if !old_packages.contains_key(install_id) {
                return false;
            }
        }
        true
    }

    /// Resolve one descriptor in one input, `None` when nothing matches
    /// or `system` is out of scope.
    fn try_resolve_descriptor_in(
        &self,
        descriptor: &ManifestDescriptor,
        input: &PkgDbInput,
        system: &str,
        base_args: &PkgQueryArgs,
    ) -> Result<Option<RowId>, ResolutionError> {
        if !descriptor.in_scope_for(system) {
            return Ok(None);
        }
        let mut args = base_args.clone();
        input.fill_pkg_query_args(&mut args);
        descriptor.fill_pkg_query_args(&mut args);
        // Resolution is always per-system.
        args.systems = vec![system.to_string()];
        let query = PkgQuery::new(args).map_err(PkgQueryError::from)?;
        let rows = query.execute(input.get_db_ro())?;
        Ok(rows.first().copied())
    }

    /// Try to resolve a whole group from a single input. `None` when some
    /// non-optional member has no match there.
    fn try_resolve_group_in(
        &self,
        group: &InstallDescriptors,
        input: &PkgDbInput,
        system: &str,
        base_args: &PkgQueryArgs,
    ) -> Result<Option<SystemPackages>, ResolutionError> {
        let mut rows: Vec<(&InstallId, Option<RowId>)> = Vec::with_capacity(group.len());
        for (install_id, descriptor) in group {
            if !descriptor.in_scope_for(system) {
                rows.push((install_id, None));
                continue;
            }
            let row = self.try_resolve_descriptor_in(descriptor, input, system, base_args)?;
            if row.is_none() && !descriptor.optional {
                return Ok(None);
            }
            rows.push((install_id, row));
        }

        let locked_input = LockedInputRaw::from(input.flake());
        let db = input.get_db_ro();
        let mut packages = SystemPackages::new();
        for (install_id, row) in rows {
            let locked = row
                .map(|row| -> Result<LockedPackageRaw, ResolutionError> {
                    let info = db.get_package(row)?;
                    Ok(LockedPackageRaw {
                        input: locked_input.clone(),
                        attr_path: info.abs_path.clone(),
                        priority: group[install_id].priority,
                        info: LockedPackageInfo::from(&info),
                    })
                })
                .transpose()?;
            packages.insert(install_id.clone(), locked);
        }
        Ok(Some(packages))
    }

    /// Lock all groups for one system.
    fn lock_system(
        &self,
        system: &System,
        registry: &PkgDbRegistry,
        options: &Options,
    ) -> Result<SystemPackages, ResolutionError> {
        let base_args = self.base_query_args(options);
        let mut packages = SystemPackages::new();
        let mut failed: Vec<(String, Vec<InstallId>)> = Vec::new();

        for (group_name, group) in self.manifest.grouped_descriptors() {
            if self.group_is_locked(&group, system) {
                debug!(group = %group_name, system = %system, "reusing locked group");
                let old_packages = self
                    .old_lockfile
                    .map(|lockfile| lockfile.system_packages(system))
                    .unwrap_or_default();
                for install_id in group.keys() {
                    if let Some(entry) = old_packages.get(install_id) {
                        packages.insert(install_id.clone(), entry.clone());
                    }
                }
                continue;
            }

            debug!(group = %group_name, system = %system, "resolving group");
            let mut resolved = None;
            for (input_name, input) in registry.iter() {
                if let Some(group_packages) =
                    self.try_resolve_group_in(&group, input, system, &base_args)?
                {
                    debug!(group = %group_name, input = input_name, "group resolved");
                    resolved = Some(group_packages);
                    break;
                }
            }
            match resolved {
                Some(group_packages) => packages.extend(group_packages),
                None => failed.push((group_name, group.keys().cloned().collect())),
            }
        }

        if !failed.is_empty() {
            let mut message = String::new();
            for (group_name, install_ids) in &failed {
                if group_name == DEFAULT_GROUP_NAME {
                    message.push_str(&format!(
                        "\n  one of the following failed to resolve: {}",
                        install_ids.iter().join(", ")
                    ));
                } else {
                    message.push_str(&format!(
                        "\n  some package in group '{}' failed to resolve: {}",
                        group_name,
                        install_ids.iter().join(", ")
                    ));
                }
            }
            return Err(ResolutionError::ResolutionFailure(message));
        }
        Ok(packages)
    }

    /// Produce a lockfile for the manifest's systems, reusing previous
    /// entries group by group where nothing invalidated them.
    pub fn create_lockfile(&self, context: &LockerContext<'_>) -> Result<Lockfile, ResolutionError> {
        let options = self.combined_options();
        let registry_raw = self.combined_registry();
        let systems = options
            .systems
            .clone()
            .unwrap_or_else(|| vec![host_system()]);

        let registry = PkgDbRegistry::from_raw(
            &registry_raw,
            context.locker,
            Rc::clone(&context.evaluator),
            context.cache_dir,
        )?;
        registry.scrape_systems(&systems)?;

        let mut packages = BTreeMap::new();
        for system in &systems {
            packages.insert(system.clone(), self.lock_system(system, &registry, &options)?);
        }

        let raw = LockfileRaw {
            manifest: self.manifest.raw().clone(),
            registry: lock_registry(&registry_raw, context.locker)?,
            packages,
            lockfile_version: LOCKFILE_VERSION,
        };
        Ok(Lockfile::from_raw(raw)?)
    }
}
