//! Per-fingerprint SQLite package databases.
//!
//! Each locked flake owns exactly one database file named by its
//! fingerprint. The split between [`PkgDbReadOnly`] and [`PkgDb`] mirrors
//! the handle lifecycle: read-only handles live as long as their input,
//! read-write handles are scoped acquisitions around a scrape.

mod input;
mod query;
mod read;
mod schemas;
mod write;

pub use input::{PkgDbInput, PkgDbRegistry, RegistryError};
pub use query::{
    match_strength,
    InvalidPkgQueryArg,
    PkgQuery,
    PkgQueryArgs,
    PkgQueryError,
};
pub use read::{
    db_path_for,
    pkgdb_cache_dir,
    PackageRow,
    PkgDbError,
    PkgDbReadOnly,
    RowId,
    SqlVersions,
};
pub use schemas::{TABLES_SCHEMA_VERSION, VIEWS_SCHEMA_VERSION};
pub use write::{PkgDb, ScrapeError};
