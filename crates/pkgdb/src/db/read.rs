//! Reading a SQLite package database.

use std::path::{Path, PathBuf};

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::schemas::{TABLES_SCHEMA_VERSION, VIEWS_SCHEMA_VERSION};
use crate::flake::{FlakeError, Fingerprint, LockedFlake, LockedFlakeRef};
use crate::types::{AttrPath, Subtree, System};
use crate::versions::DateVersion;

/// A row index in a SQLite table.
pub type RowId = i64;

#[derive(Debug, thiserror::Error)]
pub enum PkgDbError {
    #[error("no such database '{0}'")]
    NoSuchDatabase(PathBuf),
    #[error("database '{path}' has an incompatible schema ( tables {tables}, views {views} )")]
    SchemaIncompatible {
        path: PathBuf,
        tables: String,
        views: String,
    },
    #[error("failed to write database '{path}' ( {context} )")]
    StoreWriteFailed {
        path: PathBuf,
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("no such {kind} '{entity}' in database '{path}'")]
    NoSuchEntity {
        path: PathBuf,
        kind: &'static str,
        entity: String,
    },
    #[error("database '{path}' fingerprint '{actual}' does not match expected '{expected}'")]
    FingerprintMismatch {
        path: PathBuf,
        actual: String,
        expected: String,
    },
    #[error("database '{path}' query failed ( {context} )")]
    Sql {
        path: PathBuf,
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("database '{path}' is corrupt ( {context} )")]
    Corrupt { path: PathBuf, context: String },
    #[error("failed to create database directory '{0}'")]
    CreateDbDir(PathBuf, #[source] std::io::Error),
    #[error("failed to remove stale database '{0}'")]
    RemoveStale(PathBuf, #[source] std::io::Error),
    #[error(transparent)]
    Flake(#[from] FlakeError),
}

/// The persisted `( tables, views )` schema version pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlVersions {
    pub tables: String,
    pub views: String,
}

impl SqlVersions {
    /// The versions written by this build.
    pub fn current() -> Self {
        SqlVersions {
            tables: TABLES_SCHEMA_VERSION.to_string(),
            views: VIEWS_SCHEMA_VERSION.to_string(),
        }
    }
}

/// The default cache directory for package databases.
///
/// `PKGDB_CACHEDIR` takes precedence, then `XDG_CACHE_HOME`, then the
/// platform cache directory derived from `HOME`.
pub fn pkgdb_cache_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("PKGDB_CACHEDIR") {
        return PathBuf::from(dir);
    }
    let cache_home = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(dirs::cache_dir)
        .unwrap_or_else(|| PathBuf::from(".cache"));
    let major = TABLES_SCHEMA_VERSION.split('.').next().unwrap_or("0");
    cache_home.join("flox").join(format!("pkgdb-v{major}"))
}

/// Absolute path of the database for a given fingerprint.
pub fn db_path_for(cache_dir: &Path, fingerprint: &Fingerprint) -> PathBuf {
    cache_dir.join(format!("{}.sqlite", fingerprint.to_hex()))
}

/// Register the scalar functions our views depend on. Must run on every
/// connection before any view is read.
pub(crate) fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "version_date",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let version: Option<String> = ctx.get(0)?;
            Ok(version
                .as_deref()
                .and_then(DateVersion::parse)
                .map(|date| date.stamp()))
        },
    )
}

/// A single package row as projected by `v_PackagesSearch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRow {
    pub id: RowId,
    /// The full attribute path of the package inside the input.
    pub abs_path: AttrPath,
    pub subtree: Subtree,
    pub system: System,
    pub stability: Option<String>,
    /// The part of the attribute path after `<subtree>.<system>`
    /// ( and `<stability>` for catalogs ).
    pub rel_path: AttrPath,
    pub name: String,
    pub pname: Option<String>,
    pub version: Option<String>,
    pub semver: Option<String>,
    pub license: Option<String>,
    pub outputs: Vec<String>,
    pub outputs_to_install: Option<Vec<String>>,
    pub broken: Option<bool>,
    pub unfree: Option<bool>,
    pub description: Option<String>,
}

/// A read-only connection to the package database of a single locked flake.
#[derive(Debug)]
pub struct PkgDbReadOnly {
    pub fingerprint: Fingerprint,
    pub db_path: PathBuf,
    pub locked_ref: LockedFlakeRef,
    pub(crate) conn: Connection,
}

impl PkgDbReadOnly {
    /// Open an existing database read-only. Fails if the file is missing.
    pub fn open(db_path: &Path) -> Result<Self, PkgDbError> {
        if !db_path.exists() {
            return Err(PkgDbError::NoSuchDatabase(db_path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|source| PkgDbError::Sql {
                path: db_path.to_path_buf(),
                context: "open read-only connection".into(),
                source,
            })?;
        Self::from_connection(conn, db_path)
    }

    pub(crate) fn from_connection(conn: Connection, db_path: &Path) -> Result<Self, PkgDbError> {
        register_functions(&conn).map_err(|source| PkgDbError::Sql {
            path: db_path.to_path_buf(),
            context: "register scalar functions".into(),
            source,
        })?;
        let (fingerprint, locked_ref) = load_locked_flake(&conn, db_path)?;
        Ok(PkgDbReadOnly {
            fingerprint,
            db_path: db_path.to_path_buf(),
            locked_ref,
            conn,
        })
    }

    pub(crate) fn sql(&self, context: &str, source: rusqlite::Error) -> PkgDbError {
        PkgDbError::Sql {
            path: self.db_path.clone(),
            context: context.to_string(),
            source,
        }
    }

    /// The locked flake this database caches.
    pub fn locked_flake(&self) -> LockedFlake {
        LockedFlake {
            fingerprint: self.fingerprint,
            locked_ref: self.locked_ref.clone(),
        }
    }

    /// The persisted schema version pair.
    pub fn get_db_versions(&self) -> Result<SqlVersions, PkgDbError> {
        let get = |name: &str| -> Result<String, PkgDbError> {
            self.conn
                .query_row(
                    "SELECT version FROM DbVersions WHERE name = :name",
                    [name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| self.sql("read DbVersions", err))?
                .ok_or_else(|| PkgDbError::Corrupt {
                    path: self.db_path.clone(),
                    context: format!("missing DbVersions row '{name}'"),
                })
        };
        Ok(SqlVersions {
            tables: get("pkgdb_tables_schema")?,
            views: get("pkgdb_views_schema")?,
        })
    }

    /// Resolve an attribute path to its `AttrSets.id`, `None` if missing.
    pub fn maybe_attr_set_id(&self, path: &[String]) -> Result<Option<RowId>, PkgDbError> {
        let mut id: RowId = 0;
        for attr_name in path {
            let row = self
                .conn
                .query_row(
                    "SELECT id FROM AttrSets \
                     WHERE ( attrName = :attrName ) AND ( parent = :parent )",
                    rusqlite::named_params! { ":attrName": attr_name, ":parent": id },
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| self.sql("lookup AttrSets.id", err))?;
            match row {
                Some(next) => id = next,
                None => return Ok(None),
            }
        }
        Ok(Some(id))
    }

    /// Resolve an attribute path to its `AttrSets.id`, erroring if missing.
    pub fn get_attr_set_id(&self, path: &[String]) -> Result<RowId, PkgDbError> {
        self.maybe_attr_set_id(path)?
            .ok_or_else(|| PkgDbError::NoSuchEntity {
                path: self.db_path.clone(),
                kind: "AttrSet",
                entity: path.join("."),
            })
    }

    pub fn has_attr_set(&self, path: &[String]) -> Result<bool, PkgDbError> {
        Ok(self.maybe_attr_set_id(path)?.is_some())
    }

    /// Whether the attribute set exists and its subtree has been fully
    /// scraped.
    pub fn completed_attr_set(&self, path: &[String]) -> Result<bool, PkgDbError> {
        match self.maybe_attr_set_id(path)? {
            Some(id) => self.completed_attr_set_id(id),
            None => Ok(false),
        }
    }

    pub fn completed_attr_set_id(&self, id: RowId) -> Result<bool, PkgDbError> {
        Ok(self
            .conn
            .query_row("SELECT done FROM AttrSets WHERE id = :id", [id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|err| self.sql("read AttrSets.done", err))?
            .unwrap_or(false))
    }

    /// Reconstruct the attribute path of an `AttrSets.id`.
    pub fn get_attr_set_path(&self, id: RowId) -> Result<AttrPath, PkgDbError> {
        let mut path = Vec::new();
        let mut current = id;
        while current != 0 {
            let (parent, attr_name): (RowId, String) = self
                .conn
                .query_row(
                    "SELECT parent, attrName FROM AttrSets WHERE id = :id",
                    [current],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|err| self.sql("read AttrSets row", err))?
                .ok_or_else(|| PkgDbError::NoSuchEntity {
                    path: self.db_path.clone(),
                    kind: "AttrSet",
                    entity: format!("id {current}"),
                })?;
            path.push(attr_name);
            current = parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Resolve an absolute package path to its `Packages.id`.
    pub fn get_package_id(&self, path: &[String]) -> Result<RowId, PkgDbError> {
        let no_such = || PkgDbError::NoSuchEntity {
            path: self.db_path.clone(),
            kind: "Package",
            entity: path.join("."),
        };
        let (parent_path, attr_name) = match path.split_last() {
            Some((attr_name, parent_path)) => (parent_path, attr_name),
            None => return Err(no_such()),
        };
        let parent = self.get_attr_set_id(parent_path)?;
        self.conn
            .query_row(
                "SELECT id FROM Packages \
                 WHERE ( parentId = :parentId ) AND ( attrName = :attrName )",
                rusqlite::named_params! { ":parentId": parent, ":attrName": attr_name },
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| self.sql("lookup Packages.id", err))?
            .ok_or_else(no_such)
    }

    pub fn get_package_path(&self, id: RowId) -> Result<AttrPath, PkgDbError> {
        let (parent, attr_name): (RowId, String) = self
            .conn
            .query_row(
                "SELECT parentId, attrName FROM Packages WHERE id = :id",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| self.sql("read Packages row", err))?
            .ok_or_else(|| PkgDbError::NoSuchEntity {
                path: self.db_path.clone(),
                kind: "Package",
                entity: format!("id {id}"),
            })?;
        let mut path = self.get_attr_set_path(parent)?;
        path.push(attr_name);
        Ok(path)
    }

    pub fn has_package(&self, path: &[String]) -> Result<bool, PkgDbError> {
        let (parent_path, attr_name) = match path.split_last() {
            Some((attr_name, parent_path)) => (parent_path, attr_name),
            None => return Ok(false),
        };
        let Some(parent) = self.maybe_attr_set_id(parent_path)? else {
            return Ok(false);
        };
        let id: Option<RowId> = self
            .conn
            .query_row(
                "SELECT id FROM Packages \
                 WHERE ( parentId = :parentId ) AND ( attrName = :attrName )",
                rusqlite::named_params! { ":parentId": parent, ":attrName": attr_name },
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| self.sql("lookup Packages.id", err))?;
        Ok(id.is_some())
    }

    pub fn get_description(&self, id: RowId) -> Result<String, PkgDbError> {
        self.conn
            .query_row(
                "SELECT description FROM Descriptions WHERE id = :id",
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| self.sql("read Descriptions row", err))?
            .ok_or_else(|| PkgDbError::NoSuchEntity {
                path: self.db_path.clone(),
                kind: "Description",
                entity: format!("id {id}"),
            })
    }

    /// All `AttrSets.id`s descending from `root`, breadth-first, excluding
    /// `root` itself.
    pub fn get_descendant_attr_sets(&self, root: RowId) -> Result<Vec<RowId>, PkgDbError> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                WITH RECURSIVE Tree AS (
                  SELECT id, parent, 0 AS depth FROM AttrSets WHERE ( id = :root )
                  UNION ALL SELECT O.id, O.parent, ( Parent.depth + 1 ) AS depth
                  FROM AttrSets O JOIN Tree AS Parent ON ( Parent.id = O.parent )
                ) SELECT id FROM Tree
                WHERE ( id != :root ) ORDER BY depth, parent, id
                "#,
            )
            .map_err(|err| self.sql("prepare descendant query", err))?;
        let ids = stmt
            .query_map(rusqlite::named_params! { ":root": root }, |row| row.get(0))
            .and_then(|rows| rows.collect::<Result<Vec<RowId>, _>>())
            .map_err(|err| self.sql("collect descendant AttrSets", err))?;
        Ok(ids)
    }

    /// Full metadata of a single package row.
    pub fn get_package(&self, id: RowId) -> Result<PackageRow, PkgDbError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, path, subtree, system, stability, relPath, name, pname \
                      , version, semver, license, outputs, outputsToInstall \
                      , broken, unfree, description \
                 FROM v_PackagesSearch WHERE id = :id",
                [id],
                |row| {
                    Ok(RawPackageRow {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        subtree: row.get(2)?,
                        system: row.get(3)?,
                        stability: row.get(4)?,
                        rel_path: row.get(5)?,
                        name: row.get(6)?,
                        pname: row.get(7)?,
                        version: row.get(8)?,
                        semver: row.get(9)?,
                        license: row.get(10)?,
                        outputs: row.get(11)?,
                        outputs_to_install: row.get(12)?,
                        broken: row.get(13)?,
                        unfree: row.get(14)?,
                        description: row.get(15)?,
                    })
                },
            )
            .optional()
            .map_err(|err| self.sql("read v_PackagesSearch row", err))?
            .ok_or_else(|| PkgDbError::NoSuchEntity {
                path: self.db_path.clone(),
                kind: "Package",
                entity: format!("id {id}"),
            })?;
        row.finish(self)
    }

    /// Look a package up by its absolute attribute path.
    pub fn get_package_by_path(&self, path: &[String]) -> Result<PackageRow, PkgDbError> {
        let id = self.get_package_id(path)?;
        self.get_package(id)
    }
}

/// Raw column values before JSON fields are decoded.
struct RawPackageRow {
    id: RowId,
    path: String,
    subtree: String,
    system: String,
    stability: Option<String>,
    rel_path: String,
    name: String,
    pname: Option<String>,
    version: Option<String>,
    semver: Option<String>,
    license: Option<String>,
    outputs: String,
    outputs_to_install: Option<String>,
    broken: Option<bool>,
    unfree: Option<bool>,
    description: Option<String>,
}

impl RawPackageRow {
    fn finish(self, db: &PkgDbReadOnly) -> Result<PackageRow, PkgDbError> {
        let corrupt = |context: String| PkgDbError::Corrupt {
            path: db.db_path.clone(),
            context,
        };
        let parse_path = |field: &str, text: &str| -> Result<AttrPath, PkgDbError> {
            serde_json::from_str(text)
                .map_err(|err| corrupt(format!("invalid {field} JSON '{text}': {err}")))
        };
        let subtree: Subtree = self
            .subtree
            .parse()
            .map_err(|_| corrupt(format!("invalid subtree '{}'", self.subtree)))?;
        let outputs: Vec<String> = serde_json::from_str(&self.outputs)
            .map_err(|err| corrupt(format!("invalid outputs JSON: {err}")))?;
        let outputs_to_install = self
            .outputs_to_install
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|err| corrupt(format!("invalid outputsToInstall JSON: {err}")))?;
        Ok(PackageRow {
            id: self.id,
            abs_path: parse_path("path", &self.path)?,
            subtree,
            system: self.system,
            stability: self.stability,
            rel_path: parse_path("relPath", &self.rel_path)?,
            name: self.name,
            pname: self.pname,
            version: self.version,
            semver: self.semver,
            license: self.license,
            outputs,
            outputs_to_install,
            broken: self.broken,
            unfree: self.unfree,
            description: self.description,
        })
    }
}

fn load_locked_flake(
    conn: &Connection,
    db_path: &Path,
) -> Result<(Fingerprint, LockedFlakeRef), PkgDbError> {
    let (fingerprint, string, attrs): (String, String, String) = conn
        .query_row(
            "SELECT fingerprint, string, attrs FROM LockedFlake LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|source| PkgDbError::Sql {
            path: db_path.to_path_buf(),
            context: "read LockedFlake".into(),
            source,
        })?
        .ok_or_else(|| PkgDbError::Corrupt {
            path: db_path.to_path_buf(),
            context: "missing LockedFlake row".into(),
        })?;
    let fingerprint = Fingerprint::from_hex(&fingerprint)?;
    let attrs = serde_json::from_str(&attrs).map_err(|err| PkgDbError::Corrupt {
        path: db_path.to_path_buf(),
        context: format!("invalid LockedFlake.attrs JSON: {err}"),
    })?;
    Ok((fingerprint, LockedFlakeRef { string, attrs }))
}
