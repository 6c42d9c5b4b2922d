//! Managing package database inputs: one locked flake, one database.

use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use super::query::PkgQueryArgs;
use super::read::{db_path_for, PkgDbError, PkgDbReadOnly, SqlVersions};
use super::schemas::{TABLES_SCHEMA_VERSION, VIEWS_SCHEMA_VERSION};
use super::write::{PkgDb, ScrapeError};
use crate::eval::Evaluator;
use crate::flake::{FlakeError, FlakeLocker, LockedFlake};
use crate::registry::{InputPreferences, RegistryRaw};
use crate::types::{Subtree, System};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Flake(#[from] FlakeError),
    #[error(transparent)]
    Db(#[from] PkgDbError),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
}

/// One flake input and its package database.
///
/// The read-only handle is opened once at construction and reused for the
/// input's lifetime; read-write handles are scoped to each scrape.
pub struct PkgDbInput {
    name: Option<String>,
    flake: LockedFlake,
    db_path: PathBuf,
    evaluator: Rc<dyn Evaluator>,
    prefs: InputPreferences,
    db: PkgDbReadOnly,
}

impl fmt::Debug for PkgDbInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkgDbInput")
            .field("name", &self.name)
            .field("fingerprint", &self.flake.fingerprint.to_hex())
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl PkgDbInput {
    /// Open ( creating or migrating as needed ) the database for `flake`
    /// under `cache_dir`.
    ///
    /// A tables schema mismatch deletes and re-creates the file; a
    /// views-only mismatch re-creates the views in place. A mismatch which
    /// survives both is fatal.
    pub fn new(
        name: Option<String>,
        flake: LockedFlake,
        prefs: InputPreferences,
        cache_dir: &Path,
        evaluator: Rc<dyn Evaluator>,
    ) -> Result<Self, PkgDbError> {
        let db_path = db_path_for(cache_dir, &flake.fingerprint);
        if !db_path.exists() {
            debug!(path = %db_path.display(), "creating database");
            PkgDb::open(&flake, &db_path)?;
        }
        let mut db = PkgDbReadOnly::open(&db_path)?;
        let versions = db.get_db_versions()?;
        if versions.tables != TABLES_SCHEMA_VERSION {
            debug!(path = %db_path.display(), "clearing outdated database");
            drop(db);
            std::fs::remove_file(&db_path)
                .map_err(|err| PkgDbError::RemoveStale(db_path.clone(), err))?;
            PkgDb::open(&flake, &db_path)?;
            db = PkgDbReadOnly::open(&db_path)?;
        } else if versions.views != VIEWS_SCHEMA_VERSION {
            debug!(path = %db_path.display(), "updating outdated database views");
            drop(db);
            PkgDb::open(&flake, &db_path)?.rebuild_views()?;
            db = PkgDbReadOnly::open(&db_path)?;
        }

        let versions = db.get_db_versions()?;
        if versions != SqlVersions::current() {
            return Err(PkgDbError::SchemaIncompatible {
                path: db_path,
                tables: versions.tables,
                views: versions.views,
            });
        }
        if db.fingerprint != flake.fingerprint {
            return Err(PkgDbError::FingerprintMismatch {
                path: db_path,
                actual: db.fingerprint.to_hex(),
                expected: flake.fingerprint.to_hex(),
            });
        }
        Ok(PkgDbInput {
            name,
            flake,
            db_path,
            evaluator,
            prefs,
            db,
        })
    }

    /// The input's registry name, or its locked URL when unnamed.
    pub fn name_or_url(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or(&self.flake.locked_ref.string)
    }

    pub fn flake(&self) -> &LockedFlake {
        &self.flake
    }

    /// The long-lived read-only handle.
    pub fn get_db_ro(&self) -> &PkgDbReadOnly {
        &self.db
    }

    /// Scrape one prefix, acquiring a scoped read-write handle if the
    /// prefix has not been completed yet.
    pub fn scrape_prefix(&self, prefix: &[String]) -> Result<(), ScrapeError> {
        if self.db.completed_attr_set(prefix)? {
            return Ok(());
        }
        let db = PkgDb::open(&self.flake, &self.db_path)?;
        db.scrape_prefix(self.evaluator.as_ref(), prefix)
    }

    /// Scrape `( subtrees × systems × stabilities? )` per this input's
    /// preferences. Unset subtrees fall back to all three; unset
    /// stabilities fall back to `stable`.
    pub fn scrape_systems(&self, systems: &[System]) -> Result<(), ScrapeError> {
        let subtrees = self.prefs.subtrees.clone().unwrap_or_else(|| {
            vec![Subtree::Packages, Subtree::LegacyPackages, Subtree::Catalog]
        });
        let stabilities = self
            .prefs
            .stabilities
            .clone()
            .unwrap_or_else(|| vec!["stable".to_string()]);
        for subtree in &subtrees {
            for system in systems {
                let mut prefix = vec![subtree.as_str().to_string(), system.clone()];
                if *subtree == Subtree::Catalog {
                    for stability in &stabilities {
                        prefix.push(stability.clone());
                        self.scrape_prefix(&prefix)?;
                        prefix.pop();
                    }
                } else {
                    self.scrape_prefix(&prefix)?;
                }
            }
        }
        Ok(())
    }

    /// Apply this input's preferences to a set of query arguments.
    pub fn fill_pkg_query_args(&self, args: &mut PkgQueryArgs) {
        if let Some(subtrees) = &self.prefs.subtrees {
            args.subtrees = Some(subtrees.clone());
        }
        if let Some(stabilities) = &self.prefs.stabilities {
            args.stabilities = Some(stabilities.clone());
        }
    }
}

/// All `PkgDbInput`s of a registry, in effective priority order.
#[derive(Debug)]
pub struct PkgDbRegistry {
    inputs: Vec<(String, Rc<PkgDbInput>)>,
}

impl PkgDbRegistry {
    /// Lock every registry input and open ( creating if needed ) its
    /// database.
    pub fn from_raw(
        raw: &RegistryRaw,
        locker: &dyn FlakeLocker,
        evaluator: Rc<dyn Evaluator>,
        cache_dir: &Path,
    ) -> Result<Self, RegistryError> {
        let mut inputs = Vec::new();
        for (name, registry_input) in raw.iter_in_order() {
            let locked = locker.lock_flake(&registry_input.from)?;
            let prefs = registry_input.prefs.or(&raw.defaults);
            let input = PkgDbInput::new(
                Some(name.clone()),
                locked,
                prefs,
                cache_dir,
                Rc::clone(&evaluator),
            )?;
            inputs.push((name.clone(), Rc::new(input)));
        }
        Ok(PkgDbRegistry { inputs })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rc<PkgDbInput>)> {
        self.inputs
            .iter()
            .map(|(name, input)| (name.as_str(), input))
    }

    pub fn get(&self, name: &str) -> Option<&Rc<PkgDbInput>> {
        self.inputs
            .iter()
            .find(|(input_name, _)| input_name == name)
            .map(|(_, input)| input)
    }

    /// Scrape every input for `systems`.
    pub fn scrape_systems(&self, systems: &[System]) -> Result<(), RegistryError> {
        for (_, input) in self.iter() {
            input.scrape_systems(systems)?;
        }
        Ok(())
    }
}
