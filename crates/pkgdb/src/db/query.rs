//! Compiling query arguments into ranked SQL over `v_PackagesSearch`.

use std::collections::HashSet;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::read::{PkgDbError, PkgDbReadOnly, RowId};
use crate::ranges::{self, RangeError, SemverRange};
use crate::types::{host_system, AttrPath, Subtree, System, DEFAULT_SYSTEMS, STABILITIES};

/// Ranks assigned to free-text matches, ordered strongest first.
pub mod match_strength {
    pub const EXACT_PNAME: u8 = 0;
    pub const PARTIAL_PNAME_DESC: u8 = 1;
    pub const PARTIAL_PNAME: u8 = 2;
    pub const PARTIAL_DESC: u8 = 3;
    pub const NONE: u8 = 4;
}

/// Violations of the query-argument constraints.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPkgQueryArg {
    #[error("queries may not mix 'name' with any of 'pname', 'version', or 'semver'")]
    MixName,
    #[error("queries may not mix 'version' and 'semver'")]
    MixVersionSemver,
    #[error("failed to parse semver range '{0}'")]
    InvalidSemver(String),
    #[error("query 'licenses' entries may not contain the \"'\" character")]
    InvalidLicense,
    #[error("unrecognized subtree '{0}'")]
    InvalidSubtree(String),
    #[error("'stabilities' may only be used with the 'catalog' subtree")]
    ConflictingSubtree,
    #[error("unrecognized or unsupported system '{0}'")]
    InvalidSystem(String),
    #[error("unrecognized stability '{0}'")]
    InvalidStability(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PkgQueryError {
    #[error(transparent)]
    InvalidArgs(#[from] InvalidPkgQueryArg),
    #[error(transparent)]
    Db(#[from] PkgDbError),
    #[error(transparent)]
    Range(#[from] RangeError),
}

/// Collection of query parameters used to look packages up in a database.
///
/// Filtering and ranking run in SQL; a `semver` range is applied as a
/// post-processing step which preserves the SQL ordering.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PkgQueryArgs {
    /// Filter results by exact `name`.
    pub name: Option<String>,
    /// Filter results by exact `pname`.
    pub pname: Option<String>,
    /// Filter results by exact `version`.
    pub version: Option<String>,
    /// Filter results by a semantic version range.
    pub semver: Option<String>,
    /// Filter results by partial `pname`/`description` match.
    pub r#match: Option<String>,
    /// Filter results by an exact match on any of `name`, `pname`, or the
    /// package's attribute name.
    pub match_name: Option<String>,
    /// Filter results to those explicitly marked with one of these
    /// licenses.
    pub licenses: Option<Vec<String>>,
    /// Whether to include packages explicitly marked `broken`.
    pub allow_broken: bool,
    /// Whether to include packages explicitly marked `unfree`.
    pub allow_unfree: bool,
    /// Whether pre-release versions should rank above releases.
    pub prefer_pre_releases: bool,
    /// Ordered list of subtrees to search.
    pub subtrees: Option<Vec<Subtree>>,
    /// Ordered list of systems to search.
    pub systems: Vec<System>,
    /// Ordered list of stabilities to search ( catalog only ).
    pub stabilities: Option<Vec<String>>,
    /// Filter results by relative attribute path.
    pub rel_path: Option<AttrPath>,
}

impl Default for PkgQueryArgs {
    fn default() -> Self {
        PkgQueryArgs {
            name: None,
            pname: None,
            version: None,
            semver: None,
            r#match: None,
            match_name: None,
            licenses: None,
            allow_broken: false,
            allow_unfree: true,
            prefer_pre_releases: false,
            subtrees: None,
            systems: vec![host_system()],
            stabilities: None,
            rel_path: None,
        }
    }
}

impl PkgQueryArgs {
    /// Sanity check parameters.
    ///
    /// `name` must not be combined with `pname`/`version`/`semver`,
    /// `version` must not be combined with `semver`, the semver range must
    /// parse, licenses must not contain `'`, and systems/stabilities must
    /// come from the supported sets.
    pub fn validate(&self) -> Result<(), InvalidPkgQueryArg> {
        if self.name.is_some()
            && (self.pname.is_some() || self.version.is_some() || self.semver.is_some())
        {
            return Err(InvalidPkgQueryArg::MixName);
        }
        if self.version.is_some() && self.semver.is_some() {
            return Err(InvalidPkgQueryArg::MixVersionSemver);
        }
        if let Some(semver) = &self.semver {
            SemverRange::parse(semver)
                .map_err(|_| InvalidPkgQueryArg::InvalidSemver(semver.clone()))?;
        }
        if let Some(licenses) = &self.licenses {
            if licenses.iter().any(|license| license.contains('\'')) {
                return Err(InvalidPkgQueryArg::InvalidLicense);
            }
        }
        for system in &self.systems {
            if !DEFAULT_SYSTEMS.contains(&system.as_str()) {
                return Err(InvalidPkgQueryArg::InvalidSystem(system.clone()));
            }
        }
        if let Some(stabilities) = &self.stabilities {
            for stability in stabilities {
                if !STABILITIES.contains(&stability.as_str()) {
                    return Err(InvalidPkgQueryArg::InvalidStability(stability.clone()));
                }
            }
            if let Some(subtrees) = &self.subtrees {
                if !subtrees.contains(&Subtree::Catalog) {
                    return Err(InvalidPkgQueryArg::ConflictingSubtree);
                }
            }
        }
        Ok(())
    }
}

/// A compiled query: SQL text plus host parameters and the semver
/// post-filter.
#[derive(Debug, Clone)]
pub struct PkgQuery {
    args: PkgQueryArgs,
    selects: Vec<String>,
    wheres: Vec<String>,
    orders: Vec<String>,
    binds: Vec<(&'static str, String)>,
}

impl PkgQuery {
    pub fn new(args: PkgQueryArgs) -> Result<Self, InvalidPkgQueryArg> {
        args.validate()?;
        let mut query = PkgQuery {
            args,
            selects: Vec::new(),
            wheres: Vec::new(),
            orders: Vec::new(),
            binds: Vec::new(),
        };
        query.init();
        Ok(query)
    }

    pub fn args(&self) -> &PkgQueryArgs {
        &self.args
    }

    fn add_selection(&mut self, column: impl Into<String>) {
        self.selects.push(column.into());
    }

    fn add_where(&mut self, condition: impl Into<String>) {
        self.wheres.push(format!("( {} )", condition.into()));
    }

    fn add_order_by(&mut self, order: impl Into<String>) {
        self.orders.push(order.into());
    }

    fn init(&mut self) {
        self.add_selection("*");
        self.init_match();
        self.init_filters();
        self.init_subtrees();
        self.init_systems();
        self.init_stabilities();
        self.init_order_by();
    }

    /// Fuzzy `pname`/`description` filtering and its strength ranking.
    fn init_match(&mut self) {
        match self.args.r#match.clone() {
            Some(term) if !term.is_empty() => {
                self.add_where("( pname LIKE :match ) OR ( description LIKE :match )");
                // `:match` is bound as `%<TERM>%` so `LIKE` works; the exact
                // `pname` test re-adds the wrapping on the column instead.
                self.add_selection(format!(
                    "iif( ( ( '%' || LOWER( pname ) || '%' ) = LOWER( :match ) ), {exact}, \
                       iif( ( pname LIKE :match ), \
                            iif( ( description LIKE :match ), {both}, {pname_only} ), \
                            {desc_only} ) ) AS matchStrength",
                    exact = match_strength::EXACT_PNAME,
                    both = match_strength::PARTIAL_PNAME_DESC,
                    pname_only = match_strength::PARTIAL_PNAME,
                    desc_only = match_strength::PARTIAL_DESC,
                ));
                self.binds.push((":match", format!("%{term}%")));
            },
            _ => {
                self.add_selection(format!(
                    "{} AS matchStrength",
                    match_strength::NONE
                ));
            },
        }
    }

    fn init_filters(&mut self) {
        if let Some(name) = self.args.name.clone() {
            self.add_where("name = :name");
            self.binds.push((":name", name));
        }
        if let Some(match_name) = self.args.match_name.clone() {
            self.add_where(
                "( name = :matchName ) OR ( pname = :matchName ) \
                 OR ( attrName = :matchName )",
            );
            self.binds.push((":matchName", match_name));
        }
        if let Some(pname) = self.args.pname.clone() {
            self.add_where("pname = :pname");
            self.binds.push((":pname", pname));
        }
        if let Some(version) = self.args.version.clone() {
            self.add_where("version = :version");
            self.binds.push((":version", version));
        } else if self.args.semver.is_some() {
            self.add_where("semver IS NOT NULL");
        }
        if let Some(rel_path) = self.args.rel_path.clone() {
            self.add_where("relPath = :relPath");
            self.binds.push((
                ":relPath",
                serde_json::Value::from(rel_path).to_string(),
            ));
        }
        if let Some(licenses) = self.args.licenses.clone() {
            if !licenses.is_empty() {
                self.add_where("license IS NOT NULL");
                self.add_where(format!("license {}", sql_in_list(licenses.iter())));
            }
        }
        if !self.args.allow_broken {
            self.add_where("( broken IS NULL ) OR ( broken = FALSE )");
        }
        if !self.args.allow_unfree {
            self.add_where("( unfree IS NULL ) OR ( unfree = FALSE )");
        }
    }

    fn init_subtrees(&mut self) {
        match self.args.subtrees.clone() {
            Some(subtrees) => {
                let names: Vec<String> = subtrees
                    .iter()
                    .map(|subtree| subtree.as_str().to_string())
                    .collect();
                self.add_where(format!("subtree {}", sql_in_list(names.iter())));
                if 1 < names.len() {
                    self.add_selection(rank_selection("subtree", &names, "subtreesRank"));
                } else {
                    self.add_selection("0 AS subtreesRank");
                }
            },
            None => self.add_selection("0 AS subtreesRank"),
        }
    }

    fn init_systems(&mut self) {
        let systems = self.args.systems.clone();
        self.add_where(format!("system {}", sql_in_list(systems.iter())));
        if 1 < systems.len() {
            self.add_selection(rank_selection("system", &systems, "systemsRank"));
        } else {
            self.add_selection("0 AS systemsRank");
        }
    }

    fn init_stabilities(&mut self) {
        match self.args.stabilities.clone() {
            Some(stabilities) => {
                self.add_where(format!(
                    "( stability IS NULL ) OR ( stability {} )",
                    sql_in_list(stabilities.iter())
                ));
                if 1 < stabilities.len() {
                    // Rows without a stability ( non-catalog ) rank NULL.
                    self.add_selection(format!(
                        "iif( ( stability IS NULL ), NULL, {} ) AS stabilitiesRank",
                        rank_expression("stability", &stabilities)
                    ));
                } else {
                    self.add_selection("0 AS stabilitiesRank");
                }
            },
            None => self.add_selection("0 AS stabilitiesRank"),
        }
    }

    fn init_order_by(&mut self) {
        self.add_order_by(
            "matchStrength ASC\n\
             , subtreesRank ASC\n\
             , systemsRank ASC\n\
             , stabilitiesRank ASC NULLS LAST\n\
             , pname ASC\n\
             , major DESC NULLS LAST\n\
             , minor DESC NULLS LAST\n\
             , patch DESC NULLS LAST",
        );
        if self.args.prefer_pre_releases {
            self.add_order_by("preTag DESC NULLS LAST");
        } else {
            self.add_order_by("preTag DESC NULLS FIRST");
        }
        self.add_order_by(
            "versionDate DESC NULLS LAST\n\
             -- Lexicographic as fallback for misc. versions\n\
             , version ASC NULLS LAST\n\
             , brokenRank ASC\n\
             , unfreeRank ASC",
        );
    }

    /// The full SQL statement, still holding unbound host parameters.
    pub fn sql(&self) -> String {
        let mut sql = String::from("SELECT id, semver FROM ( SELECT ");
        sql.push_str(&self.selects.join(", "));
        sql.push_str(" FROM v_PackagesSearch");
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.wheres.join(" AND "));
        }
        if !self.orders.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.orders.join(", "));
        }
        sql.push_str(" )");
        sql
    }

    /// Filter a set of semantic versions by the `semver` range, if any.
    fn filter_semvers(&self, versions: Vec<String>) -> Result<Vec<String>, RangeError> {
        match &self.args.semver {
            None => Ok(versions),
            Some(range) => ranges::semver_sat(range, &versions),
        }
    }

    /// Run the query, returning `Packages.id`s in rank order.
    pub fn execute(&self, db: &PkgDbReadOnly) -> Result<Vec<RowId>, PkgQueryError> {
        let sql = self.sql();
        let mut stmt = db
            .conn
            .prepare(&sql)
            .map_err(|err| PkgQueryError::Db(db.sql("prepare package query", err)))?;
        let params: Vec<(&str, &dyn rusqlite::ToSql)> = self
            .binds
            .iter()
            .map(|(name, value)| (*name, value as &dyn rusqlite::ToSql))
            .collect();
        let rows = stmt
            .query_map(params.as_slice(), |row| {
                Ok((row.get::<_, RowId>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|err| PkgQueryError::Db(db.sql("execute package query", err)))?;

        if self.args.semver.is_none() {
            return Ok(rows.into_iter().map(|(id, _)| id).collect());
        }

        // Semver ranges cannot be expressed in SQL; filter the ordered rows
        // by the satisfying version set.
        let mut seen = HashSet::new();
        let mut versions = Vec::new();
        for (_, version) in &rows {
            if let Some(version) = version {
                if seen.insert(version.clone()) {
                    versions.push(version.clone());
                }
            }
        }
        let satisfied: HashSet<String> = self.filter_semvers(versions)?.into_iter().collect();
        Ok(rows
            .into_iter()
            .filter(|(_, version)| {
                version
                    .as_ref()
                    .is_some_and(|version| satisfied.contains(version))
            })
            .map(|(id, _)| id)
            .collect())
    }
}

/// Render `IN ( 'a', 'b', ... )`. Values must already be validated to not
/// contain apostrophes.
fn sql_in_list<I, S>(values: I) -> String
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    let quoted = values.map(|value| format!("'{}'", value.as_ref())).join(", ");
    format!("IN ( {quoted} )")
}

/// Nested `iif` chain ranking `column` by its position in `values`.
fn rank_expression<S: AsRef<str>>(column: &str, values: &[S]) -> String {
    let mut expression = String::new();
    for (idx, value) in values.iter().enumerate() {
        expression.push_str(&format!(
            "iif( ( {column} = '{}' ), {idx}, ",
            value.as_ref()
        ));
    }
    expression.push_str(&values.len().to_string());
    for _ in values {
        expression.push_str(" )");
    }
    expression
}

fn rank_selection<S: AsRef<str>>(column: &str, values: &[S], alias: &str) -> String {
    format!("{} AS {alias}", rank_expression(column, values))
}

#[cfg(test)]
mod test {
    use super::*;

    fn args() -> PkgQueryArgs {
        PkgQueryArgs {
            systems: vec!["x86_64-linux".to_string()],
            ..PkgQueryArgs::default()
        }
    }

    #[test]
    fn validates_name_mixing() {
        let mut query = args();
        query.name = Some("hello".into());
        query.pname = Some("hello".into());
        assert_eq!(query.validate(), Err(InvalidPkgQueryArg::MixName));

        let mut query = args();
        query.name = Some("hello".into());
        query.semver = Some("^1".into());
        assert_eq!(query.validate(), Err(InvalidPkgQueryArg::MixName));
    }

    #[test]
    fn validates_version_semver_mixing() {
        let mut query = args();
        query.version = Some("1.2.3".into());
        query.semver = Some("^1".into());
        assert_eq!(query.validate(), Err(InvalidPkgQueryArg::MixVersionSemver));
    }

    #[test]
    fn validates_semver_ranges() {
        let mut query = args();
        query.semver = Some("bogus".into());
        assert_eq!(
            query.validate(),
            Err(InvalidPkgQueryArg::InvalidSemver("bogus".into()))
        );
        query.semver = Some("^1.2 || ~2.0".into());
        assert_eq!(query.validate(), Ok(()));
    }

    #[test]
    fn validates_licenses() {
        let mut query = args();
        query.licenses = Some(vec!["GPL-3.0-or-later".into(), "bad'license".into()]);
        assert_eq!(query.validate(), Err(InvalidPkgQueryArg::InvalidLicense));
    }

    #[test]
    fn validates_systems() {
        let mut query = args();
        query.systems = vec!["mips-linux".into()];
        assert_eq!(
            query.validate(),
            Err(InvalidPkgQueryArg::InvalidSystem("mips-linux".into()))
        );
    }

    #[test]
    fn validates_stabilities() {
        let mut query = args();
        query.stabilities = Some(vec!["nightly".into()]);
        assert_eq!(
            query.validate(),
            Err(InvalidPkgQueryArg::InvalidStability("nightly".into()))
        );

        let mut query = args();
        query.stabilities = Some(vec!["stable".into()]);
        query.subtrees = Some(vec![Subtree::Packages]);
        assert_eq!(query.validate(), Err(InvalidPkgQueryArg::ConflictingSubtree));

        query.subtrees = Some(vec![Subtree::Catalog]);
        assert_eq!(query.validate(), Ok(()));
    }

    #[test]
    fn deserializes_kebab_case() {
        let parsed: PkgQueryArgs = serde_json::from_str(
            r#"{
                "match": "hello",
                "allow-broken": true,
                "prefer-pre-releases": true,
                "systems": ["x86_64-linux"]
            }"#,
        )
        .unwrap();
        assert_eq!(parsed.r#match.as_deref(), Some("hello"));
        assert!(parsed.allow_broken);
        assert!(parsed.allow_unfree);
        assert!(parsed.prefer_pre_releases);
    }

    #[test]
    fn builds_rank_expressions() {
        assert_eq!(
            rank_expression("subtree", &["packages", "legacyPackages"]),
            "iif( ( subtree = 'packages' ), 0, \
             iif( ( subtree = 'legacyPackages' ), 1, 2 ) )"
        );
    }

    #[test]
    fn sql_shape() {
        let mut query_args = args();
        query_args.r#match = Some("hello".into());
        let query = PkgQuery::new(query_args).unwrap();
        let sql = query.sql();
        assert!(sql.starts_with("SELECT id, semver FROM ( SELECT *"));
        assert!(sql.contains("matchStrength"));
        assert!(sql.contains("ORDER BY"));
        assert!(sql.contains("system IN ( 'x86_64-linux' )"));
    }
}
