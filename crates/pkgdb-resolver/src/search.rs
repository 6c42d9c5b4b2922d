//! Interactive, ranked package search across a registry.
//!
//! Search shares the option/registry layering of the locker but runs one
//! free-form query against every input, concatenating results in registry
//! priority order.

use pkgdb::db::{
    PackageRow,
    PkgDbRegistry,
    PkgQuery,
    PkgQueryArgs,
    PkgQueryError,
    RegistryError,
};
use pkgdb::types::host_system;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::debug;

use crate::environment::{Environment, LockerContext, Upgrades};
use crate::lockfile::Lockfile;
use crate::manifest::Manifest;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid search term '{0}', try quoting the search term if this isn't what you searched for")]
    SearchTerm(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Query(#[from] PkgQueryError),
    #[error(transparent)]
    Db(#[from] pkgdb::db::PkgDbError),
}

/// A set of options defining one search query.
///
/// The options aren't mutually exclusive: `hello@>=2` populates `match`
/// with `hello` and `semver` with `>=2`. The result is the logical AND of
/// all provided parameters.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SearchQuery {
    /// Match against the full name of the package, `<pname>-<version>`.
    pub name: Option<String>,
    /// Match against the `pname` of the package.
    pub pname: Option<String>,
    /// Match against the exact version of the package.
    pub version: Option<String>,
    /// Match against a semver range.
    pub semver: Option<String>,
    /// Fuzzy match against `pname` and `description`.
    pub r#match: Option<String>,
    /// Exact match against `name`, `pname`, or the attribute name.
    pub match_name: Option<String>,
    /// Limit the number of returned results.
    pub limit: Option<usize>,
}

impl SearchQuery {
    /// Construct a query from a search term and an optional result limit.
    ///
    /// A term containing `@` splits into a package part and a semver range,
    /// `hello@^2.12`. A trailing `@` most likely means an unquoted range
    /// operator and is rejected.
    pub fn from_term_and_limit(
        search_term: &str,
        prefer_match_name: bool,
        limit: Option<usize>,
    ) -> Result<Self, SearchError> {
        let mut query = SearchQuery {
            limit,
            ..SearchQuery::default()
        };
        let package = match search_term.split_once('@') {
            Some((_, range)) if range.is_empty() => {
                return Err(SearchError::SearchTerm(search_term.to_string()));
            },
            Some((package, range)) => {
                query.semver = Some(range.to_string());
                package
            },
            None => search_term,
        };
        if prefer_match_name {
            query.match_name = Some(package.to_string());
        } else {
            query.r#match = Some(package.to_string());
        }
        Ok(query)
    }

    fn fill_pkg_query_args(&self, args: &mut PkgQueryArgs) {
        args.name.clone_from(&self.name);
        args.pname.clone_from(&self.pname);
        args.version.clone_from(&self.version);
        args.semver.clone_from(&self.semver);
        args.r#match.clone_from(&self.r#match);
        args.match_name.clone_from(&self.match_name);
    }
}

/// The full input of one search: option/registry context plus the query.
#[derive(Debug, Default)]
pub struct SearchParams {
    pub global_manifest: Option<Manifest>,
    pub manifest: Option<Manifest>,
    pub lockfile: Option<Lockfile>,
    pub query: SearchQuery,
}

/// One search hit: the registry input it came from plus the package row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub input: String,
    #[serde(flatten)]
    pub package: PackageRow,
}

/// Ranked search results with the pre-limit total.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub results: Vec<SearchHit>,
    pub count: usize,
}

/// Run `params.query` against every registry input, scraping any database
/// that is not complete yet.
pub fn search(
    params: &SearchParams,
    context: &LockerContext<'_>,
) -> Result<SearchResults, SearchError> {
    let empty = Manifest::default();
    let manifest = params.manifest.as_ref().unwrap_or(&empty);
    let environment = Environment::new(
        params.global_manifest.as_ref(),
        manifest,
        params.lockfile.as_ref(),
        Upgrades::None,
    );
    let options = environment.combined_options();
    let registry_raw = environment.combined_registry();
    let systems = options
        .systems
        .clone()
        .unwrap_or_else(|| vec![host_system()]);

    let registry = PkgDbRegistry::from_raw(
        &registry_raw,
        context.locker,
        std::rc::Rc::clone(&context.evaluator),
        context.cache_dir,
    )?;
    registry.scrape_systems(&systems)?;

    let mut base_args = PkgQueryArgs {
        systems: systems.clone(),
        ..PkgQueryArgs::default()
    };
    options.fill_pkg_query_args(&mut base_args);

    let mut results = Vec::new();
    for (input_name, input) in registry.iter() {
        let mut args = base_args.clone();
        input.fill_pkg_query_args(&mut args);
        params.query.fill_pkg_query_args(&mut args);
        let query = PkgQuery::new(args).map_err(PkgQueryError::from)?;
        let db = input.get_db_ro();
        let rows = query.execute(db)?;
        debug!(input = input_name, hits = rows.len(), "searched input");
        for row in rows {
            results.push(SearchHit {
                input: input_name.to_string(),
                package: db.get_package(row)?,
            });
        }
    }
    let count = results.len();
    if let Some(limit) = params.query.limit {
        results.truncate(limit);
    }
    Ok(SearchResults { results, count })
}
