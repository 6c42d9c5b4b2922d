//! Writing to a SQLite package database, including the scraper.

use std::collections::VecDeque;
use std::ops::Deref;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, trace};

use super::read::{register_functions, PkgDbError, PkgDbReadOnly, RowId};
use super::schemas::{
    SQL_ATTR_SETS,
    SQL_DROP_VIEWS,
    SQL_INPUT,
    SQL_PACKAGES,
    SQL_VERSIONS,
    SQL_VIEWS,
    TABLES_SCHEMA_VERSION,
    VIEWS_SCHEMA_VERSION,
};
use crate::eval::{open_cursor, Cursor, EvalError, Evaluator};
use crate::flake::LockedFlake;
use crate::package::{Package, PackageError};
use crate::types::AttrPath;

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Db(#[from] PkgDbError),
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl ScrapeError {
    /// Whether this error came from the evaluator rather than the store.
    /// Evaluation errors are local to a single attribute in tolerant
    /// subtrees.
    pub fn is_eval_error(&self) -> bool {
        matches!(
            self,
            ScrapeError::Eval(_) | ScrapeError::Package(PackageError::Eval(_))
        )
    }
}

/// Pending scrape targets: `( path, cursor, AttrSets.id )`.
type Todos = VecDeque<(AttrPath, Cursor, RowId)>;

/// A read-write connection to a package database.
///
/// Opening creates the file, tables, and views as needed and records the
/// locked flake. All read primitives are available through deref.
#[derive(Debug)]
pub struct PkgDb {
    ro: PkgDbReadOnly,
}

impl Deref for PkgDb {
    type Target = PkgDbReadOnly;

    fn deref(&self) -> &Self::Target {
        &self.ro
    }
}

impl PkgDb {
    /// Open ( creating if necessary ) the database at `db_path` for
    /// `flake`.
    pub fn open(flake: &LockedFlake, db_path: &Path) -> Result<Self, PkgDbError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| PkgDbError::CreateDbDir(parent.to_path_buf(), err))?;
        }
        let conn = Connection::open(db_path).map_err(|source| PkgDbError::Sql {
            path: db_path.to_path_buf(),
            context: "open read-write connection".into(),
            source,
        })?;
        init_tables(&conn, db_path)?;
        write_input(&conn, db_path, flake)?;
        let ro = PkgDbReadOnly::from_connection(conn, db_path)?;
        if ro.fingerprint != flake.fingerprint {
            return Err(PkgDbError::FingerprintMismatch {
                path: db_path.to_path_buf(),
                actual: ro.fingerprint.to_hex(),
                expected: flake.fingerprint.to_hex(),
            });
        }
        Ok(PkgDb { ro })
    }

    /// Drop and re-create the derived views, refreshing their recorded
    /// schema version. Table data is untouched.
    pub fn rebuild_views(&self) -> Result<(), PkgDbError> {
        self.ro
            .conn
            .execute_batch(SQL_DROP_VIEWS)
            .map_err(|err| self.store_err("drop views", err))?;
        self.ro
            .conn
            .execute_batch(SQL_VIEWS)
            .map_err(|err| self.store_err("re-create views", err))?;
        self.ro
            .conn
            .execute(
                "UPDATE DbVersions SET version = :version \
                 WHERE name = 'pkgdb_views_schema'",
                rusqlite::named_params! { ":version": VIEWS_SCHEMA_VERSION },
            )
            .map_err(|err| self.store_err("update views schema version", err))?;
        Ok(())
    }

    fn store_err(&self, context: &str, source: rusqlite::Error) -> PkgDbError {
        PkgDbError::StoreWriteFailed {
            path: self.ro.db_path.clone(),
            context: context.to_string(),
            source,
        }
    }

    /// Upsert a single attribute set keyed on `( parent, attrName )`.
    pub fn add_or_get_attr_set(&self, attr_name: &str, parent: RowId) -> Result<RowId, PkgDbError> {
        let existing: Option<RowId> = self
            .ro
            .conn
            .query_row(
                "SELECT id FROM AttrSets \
                 WHERE ( attrName = :attrName ) AND ( parent = :parent )",
                rusqlite::named_params! { ":attrName": attr_name, ":parent": parent },
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| self.ro.sql("lookup AttrSets.id", err))?;
        if let Some(id) = existing {
            return Ok(id);
        }
        self.ro
            .conn
            .execute(
                "INSERT INTO AttrSets ( attrName, parent ) \
                 VALUES ( :attrName, :parent )",
                rusqlite::named_params! { ":attrName": attr_name, ":parent": parent },
            )
            .map_err(|err| self.store_err("insert AttrSets row", err))?;
        Ok(self.ro.conn.last_insert_rowid())
    }

    /// Upsert a whole attribute path, returning the id of its last element.
    pub fn add_or_get_attr_set_id(&self, path: &[String]) -> Result<RowId, PkgDbError> {
        let mut id = 0;
        for attr_name in path {
            id = self.add_or_get_attr_set(attr_name, id)?;
        }
        Ok(id)
    }

    /// Deduplicated description storage.
    pub fn add_or_get_description_id(&self, description: &str) -> Result<RowId, PkgDbError> {
        let existing: Option<RowId> = self
            .ro
            .conn
            .query_row(
                "SELECT id FROM Descriptions WHERE description = :description LIMIT 1",
                rusqlite::named_params! { ":description": description },
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| self.ro.sql("lookup Descriptions.id", err))?;
        if let Some(id) = existing {
            trace!(description, "found existing description in database");
            return Ok(id);
        }
        trace!(description, "adding new description to database");
        self.ro
            .conn
            .execute(
                "INSERT INTO Descriptions ( description ) VALUES ( :description )",
                rusqlite::named_params! { ":description": description },
            )
            .map_err(|err| self.store_err("insert Descriptions row", err))?;
        Ok(self.ro.conn.last_insert_rowid())
    }

    /// Extract a package from `cursor` and insert it under
    /// `( parent_id, attr_name )`. With `replace` an existing row for the
    /// same key is replaced, otherwise the insert is ignored on conflict.
    pub fn add_package(
        &self,
        parent_id: RowId,
        attr_name: &str,
        cursor: &Cursor,
        replace: bool,
        check_drv: bool,
    ) -> Result<RowId, ScrapeError> {
        let package = Package::from_cursor(cursor, cursor.path(), check_drv)?;
        let description_id = package
            .description
            .as_deref()
            .map(|description| self.add_or_get_description_id(description))
            .transpose()?;
        let sql = if replace {
            "INSERT OR REPLACE INTO Packages ( \
               parentId, attrName, name, pname, version, semver, license \
             , outputs, outputsToInstall, broken, unfree, descriptionId \
             ) VALUES ( \
               :parentId, :attrName, :name, :pname, :version, :semver, :license \
             , :outputs, :outputsToInstall, :broken, :unfree, :descriptionId \
             )"
        } else {
            "INSERT OR IGNORE INTO Packages ( \
               parentId, attrName, name, pname, version, semver, license \
             , outputs, outputsToInstall, broken, unfree, descriptionId \
             ) VALUES ( \
               :parentId, :attrName, :name, :pname, :version, :semver, :license \
             , :outputs, :outputsToInstall, :broken, :unfree, :descriptionId \
             )"
        };
        let outputs = serde_json::Value::from(package.outputs.clone()).to_string();
        let outputs_to_install =
            serde_json::Value::from(package.outputs_to_install.clone()).to_string();
        self.ro
            .conn
            .execute(
                sql,
                rusqlite::named_params! {
                    ":parentId": parent_id,
                    ":attrName": attr_name,
                    ":name": package.name,
                    ":pname": package.pname,
                    ":version": package.version,
                    ":semver": package.semver,
                    ":license": package.license,
                    ":outputs": outputs,
                    ":outputsToInstall": outputs_to_install,
                    ":broken": package.broken,
                    ":unfree": package.unfree,
                    ":descriptionId": description_id,
                },
            )
            .map_err(|err| self.store_err("insert Packages row", err))?;
        Ok(self.ro.conn.last_insert_rowid())
    }

    /// Mark `prefix` and every descendant attribute set as ( not ) done.
    pub fn set_prefix_done(&self, prefix: &[String], done: bool) -> Result<(), PkgDbError> {
        let root = self.add_or_get_attr_set_id(prefix)?;
        self.ro
            .conn
            .execute(
                r#"
                UPDATE AttrSets SET done = :done WHERE id IN (
                  WITH RECURSIVE Tree AS (
                    SELECT id FROM AttrSets WHERE ( id = :root )
                    UNION ALL SELECT O.id
                    FROM AttrSets O JOIN Tree ON ( O.parent = Tree.id )
                  ) SELECT id FROM Tree
                )
                "#,
                rusqlite::named_params! { ":done": done, ":root": root },
            )
            .map_err(|err| self.store_err("set AttrSets.done for subtree", err))?;
        Ok(())
    }

    /// Scrape the subtree rooted at `prefix` into the database.
    ///
    /// The whole traversal runs in one transaction: either every package of
    /// the subtree lands and the prefix is marked done, or the database is
    /// left untouched.
    pub fn scrape_prefix(
        &self,
        evaluator: &dyn Evaluator,
        prefix: &[String],
    ) -> Result<(), ScrapeError> {
        if self.completed_attr_set(prefix)? {
            return Ok(());
        }
        let flake = self.locked_flake();
        let Some(root) = open_cursor(evaluator, &flake, prefix)? else {
            return Ok(());
        };
        let root_id = self.add_or_get_attr_set_id(prefix)?;

        let txn = self
            .ro
            .conn
            .unchecked_transaction()
            .map_err(|err| self.ro.sql("begin scrape transaction", err))?;
        let mut todo: Todos = VecDeque::new();
        todo.push_back((prefix.to_vec(), root, root_id));
        while let Some((path, cursor, parent_id)) = todo.pop_front() {
            self.scrape_target(&path, &cursor, parent_id, &mut todo)?;
        }
        self.set_prefix_done(prefix, true)?;
        txn.commit()
            .map_err(|err| self.ro.sql("commit scrape transaction", err))?;
        Ok(())
    }

    /// Visit the children of one attribute set, inserting derivations and
    /// queueing nested package sets.
    fn scrape_target(
        &self,
        path: &[String],
        cursor: &Cursor,
        parent_id: RowId,
        todo: &mut Todos,
    ) -> Result<(), ScrapeError> {
        if self.completed_attr_set_id(parent_id)? {
            return Ok(());
        }
        // Under `packages` every member must be a derivation, so evaluation
        // errors are fatal there and recursion never happens.
        let tolerant = path.first().map(String::as_str) != Some("packages");
        debug!(path = %path.join("."), "evaluating package set");
        for attr_name in cursor.list_attrs()? {
            if attr_name == "recurseForDerivations" {
                continue;
            }
            match self.scrape_child(cursor, &attr_name, path, parent_id, tolerant, todo) {
                Ok(()) => (),
                Err(err) if tolerant && err.is_eval_error() => {
                    debug!(
                        path = %path.join("."),
                        attr = %attr_name,
                        %err,
                        "skipping attribute that failed to evaluate"
                    );
                },
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn scrape_child(
        &self,
        parent: &Cursor,
        attr_name: &str,
        path: &[String],
        parent_id: RowId,
        tolerant: bool,
        todo: &mut Todos,
    ) -> Result<(), ScrapeError> {
        let Some(child) = parent.maybe_child(attr_name)? else {
            return Ok(());
        };
        if child.is_derivation()? {
            self.add_package(parent_id, attr_name, &child, true, false)?;
            return Ok(());
        }
        if !tolerant {
            return Ok(());
        }
        if child.maybe_child("recurseForDerivations")?.is_some()
            && child.get_bool("recurseForDerivations")?
        {
            let mut child_path = path.to_vec();
            child_path.push(attr_name.to_string());
            trace!(path = %child_path.join("."), "queueing package set");
            let child_id = self.add_or_get_attr_set(attr_name, parent_id)?;
            todo.push_back((child_path, child, child_id));
        }
        Ok(())
    }
}

fn init_tables(conn: &Connection, db_path: &Path) -> Result<(), PkgDbError> {
    let exec = |context: &str, sql: &str| -> Result<(), PkgDbError> {
        conn.execute_batch(sql)
            .map_err(|source| PkgDbError::StoreWriteFailed {
                path: db_path.to_path_buf(),
                context: context.to_string(),
                source,
            })
    };
    exec("initialize DbVersions table", SQL_VERSIONS)?;
    exec("initialize LockedFlake table", SQL_INPUT)?;
    exec("initialize AttrSets table", SQL_ATTR_SETS)?;
    exec("initialize Packages tables", SQL_PACKAGES)?;
    // View bodies are prepared at CREATE VIEW time, so the scalar functions
    // they reference must exist before the views do.
    register_functions(conn).map_err(|source| PkgDbError::Sql {
        path: db_path.to_path_buf(),
        context: "register scalar functions".into(),
        source,
    })?;
    exec("initialize views", SQL_VIEWS)?;
    conn.execute(
        "INSERT OR IGNORE INTO DbVersions ( name, version ) VALUES \
           ( 'pkgdb', :pkgdb ) \
         , ( 'pkgdb_tables_schema', :tables ) \
         , ( 'pkgdb_views_schema', :views )",
        rusqlite::named_params! {
            ":pkgdb": env!("CARGO_PKG_VERSION"),
            ":tables": TABLES_SCHEMA_VERSION,
            ":views": VIEWS_SCHEMA_VERSION,
        },
    )
    .map_err(|source| PkgDbError::StoreWriteFailed {
        path: db_path.to_path_buf(),
        context: "write DbVersions info".to_string(),
        source,
    })?;
    Ok(())
}

fn write_input(conn: &Connection, db_path: &Path, flake: &LockedFlake) -> Result<(), PkgDbError> {
    conn.execute(
        "INSERT OR IGNORE INTO LockedFlake ( fingerprint, string, attrs ) \
         VALUES ( :fingerprint, :string, :attrs )",
        rusqlite::named_params! {
            ":fingerprint": flake.fingerprint.to_hex(),
            ":string": flake.locked_ref.string,
            ":attrs": flake.locked_ref.attrs.to_string(),
        },
    )
    .map_err(|source| PkgDbError::StoreWriteFailed {
        path: db_path.to_path_buf(),
        context: "write LockedFlake info".to_string(),
        source,
    })?;
    Ok(())
}
