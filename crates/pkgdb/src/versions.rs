//! Version number analysis, especially _semantic version_ processing.
//!
//! Version strings are partitioned into three kinds: proper semantic
//! versions, date-like versions ( `2023-05-31`, `05-31-2023`, optionally
//! tagged ), and everything else. The kinds are totally ordered
//! ( other < date < semver ) and each kind carries its own internal order.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches semantic version strings, e.g. `4.2.0-pre`.
static SEMVER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(0|[1-9][0-9]*)\.(0|[1-9][0-9]*)\.(0|[1-9][0-9]*)(-[0-9A-Za-z_+.-]+)?$")
        .unwrap()
});

/// Coercively matches semantic version strings, e.g. `foo@v1.02-pre`.
static SEMVER_COERCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:.*@)?[vV]?0*([0-9]+)(?:\.0*([0-9]+)(?:\.0*([0-9]+))?)?(-[0-9A-Za-z_+.-]+)?$")
        .unwrap()
});

/// Matches `-` separated date strings, e.g. `2023-05-31` or `5-1-23`.
static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[0-9]{2}(?:[0-9]{2})?-[01]?[0-9]-[0-9]{1,2}|[0-9]{1,2}-[0-9]{1,2}-[0-9]{2}(?:[0-9]{2})?)(?:-[0-9A-Za-z_+.-]+)?$",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("'{0}' is not a semantic version string")]
    NotSemver(String),
    #[error("'{0}' is not a date version string")]
    NotDate(String),
}

/// Classification of a version string, ordered for search ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionKind {
    Other,
    Date,
    Semver,
}

/// Whether `version` is a valid semantic version string.
pub fn is_semver(version: &str) -> bool {
    SEMVER_RE.is_match(version)
}

/// Whether `version` is a datestamp-like version string.
pub fn is_date(version: &str) -> bool {
    DATE_RE.is_match(version)
}

/// Whether `version` can be interpreted as a semantic version.
pub fn is_coercible_to_semver(version: &str) -> bool {
    !is_date(version) && SEMVER_COERCE_RE.is_match(version)
}

pub fn get_version_kind(version: &str) -> VersionKind {
    if is_semver(version) {
        VersionKind::Semver
    } else if is_date(version) {
        VersionKind::Date
    } else {
        VersionKind::Other
    }
}

/// Attempt to coerce strings such as `v1.0.2` or `1.0` to valid semantic
/// version strings.
///
/// Missing `minor`/`patch` components become `0`, leading zeros are
/// stripped, and any pre-release tag is preserved. Date-like strings are
/// never coerced.
pub fn coerce_semver(version: &str) -> Option<String> {
    if is_semver(version) {
        return Some(version.to_string());
    }
    if is_date(version) {
        return None;
    }
    let caps = SEMVER_COERCE_RE.captures(version)?;
    let major = caps.get(1)?.as_str();
    let minor = caps.get(2).map_or("0", |m| m.as_str());
    let patch = caps.get(3).map_or("0", |m| m.as_str());
    let tag = caps.get(4).map_or("", |m| m.as_str());
    Some(format!("{major}.{minor}.{patch}{tag}"))
}

/// The parsed components of a proper semantic version string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SemverParts {
    major: u64,
    minor: u64,
    patch: u64,
    pre_tag: Option<String>,
}

impl SemverParts {
    fn parse(version: &str) -> Option<Self> {
        let caps = SEMVER_RE.captures(version)?;
        Some(SemverParts {
            major: caps.get(1)?.as_str().parse().ok()?,
            minor: caps.get(2)?.as_str().parse().ok()?,
            patch: caps.get(3)?.as_str().parse().ok()?,
            pre_tag: caps.get(4).map(|m| m.as_str().to_string()),
        })
    }

    fn compare(&self, other: &Self, prefer_pre_releases: bool) -> Ordering {
        let core = (self.major, self.minor, self.patch).cmp(&(
            other.major,
            other.minor,
            other.patch,
        ));
        if core != Ordering::Equal {
            return core;
        }
        match (&self.pre_tag, &other.pre_tag) {
            (None, None) => Ordering::Equal,
            // With an otherwise equal core a pre-release ranks below the
            // release, unless pre-releases are preferred.
            (Some(_), None) => {
                if prefer_pre_releases {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            },
            (None, Some(_)) => {
                if prefer_pre_releases {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            },
            (Some(lhs), Some(rhs)) => lhs.cmp(rhs),
        }
    }
}

/// A parsed date-like version, either `%Y-%m-%d` or `%m-%d-%Y`.
///
/// Trailing characters are kept to break ties lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct DateVersion {
    year: u16,
    month: u8,
    day: u8,
    rest: String,
}

impl DateVersion {
    pub(crate) fn parse(version: &str) -> Option<Self> {
        if !is_date(version) {
            return None;
        }
        let mut parts = version.splitn(4, '-');
        let first = parts.next()?;
        let second = parts.next()?;
        let third = parts.next()?;
        let rest = parts.next().map_or(String::new(), |tag| format!("-{tag}"));
        // A four digit leading component is a year, otherwise the string is
        // month-day-year.
        let (year, month, day) = if first.len() == 4 {
            (first, second, third)
        } else {
            (third, first, second)
        };
        let mut year: u16 = year.parse().ok()?;
        if year < 100 {
            year += 2000;
        }
        Some(DateVersion {
            year,
            month: month.parse().ok()?,
            day: day.parse().ok()?,
            rest,
        })
    }

    /// Render as a normalized `YYYY-MM-DD` stamp, dropping any tag.
    pub(crate) fn stamp(&self) -> String {
        format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Compare two semantic version strings.
///
/// No coercion is attempted, any coercion must be performed before
/// attempting a comparison.
pub fn compare_semvers_lt(
    lhs: &str,
    rhs: &str,
    prefer_pre_releases: bool,
) -> Result<bool, VersionError> {
    let left =
        SemverParts::parse(lhs).ok_or_else(|| VersionError::NotSemver(lhs.to_string()))?;
    let right =
        SemverParts::parse(rhs).ok_or_else(|| VersionError::NotSemver(rhs.to_string()))?;
    Ok(left.compare(&right, prefer_pre_releases) == Ordering::Less)
}

/// Compare two date version strings, breaking ties with any trailing
/// characters.
pub fn compare_date_versions_lt(lhs: &str, rhs: &str) -> Result<bool, VersionError> {
    let left = DateVersion::parse(lhs).ok_or_else(|| VersionError::NotDate(lhs.to_string()))?;
    let right = DateVersion::parse(rhs).ok_or_else(|| VersionError::NotDate(rhs.to_string()))?;
    Ok(left < right)
}

/// Compare two version strings of any kind.
///
/// Semantic versions sort above date-like versions which sort above
/// everything else; within a kind the kind's own order applies, with
/// miscellaneous versions compared lexicographically. The result is a
/// strict total order.
pub fn compare_versions_lt(lhs: &str, rhs: &str, prefer_pre_releases: bool) -> bool {
    let kind_l = get_version_kind(lhs);
    let kind_r = get_version_kind(rhs);
    if kind_l != kind_r {
        return kind_l < kind_r;
    }
    match kind_l {
        VersionKind::Semver => match (SemverParts::parse(lhs), SemverParts::parse(rhs)) {
            (Some(left), Some(right)) => {
                left.compare(&right, prefer_pre_releases) == Ordering::Less
            },
            _ => lhs < rhs,
        },
        VersionKind::Date => match (DateVersion::parse(lhs), DateVersion::parse(rhs)) {
            (Some(left), Some(right)) => left < right,
            _ => lhs < rhs,
        },
        VersionKind::Other => lhs < rhs,
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn recognizes_semvers() {
        assert!(is_semver("4.2.0"));
        assert!(is_semver("4.2.0-pre"));
        assert!(is_semver("0.0.1-alpha.1"));
        assert!(!is_semver("4.2"));
        assert!(!is_semver("v4.2.0"));
        assert!(!is_semver("04.2.0"));
    }

    #[test]
    fn recognizes_dates() {
        assert!(is_date("2023-05-31"));
        assert!(is_date("5-1-23"));
        assert!(is_date("05-31-2023"));
        assert!(is_date("2023-05-31-pre"));
        assert!(!is_date("2023-05"));
        assert!(!is_date("4.2.0"));
    }

    #[test]
    fn coerces_loose_versions() {
        assert_eq!(coerce_semver("4.2.0"), Some("4.2.0".to_string()));
        assert_eq!(coerce_semver("v1.0"), Some("1.0.0".to_string()));
        assert_eq!(coerce_semver("1"), Some("1.0.0".to_string()));
        assert_eq!(coerce_semver("foo@v1.02.0-pre"), Some("1.2.0-pre".to_string()));
        assert_eq!(coerce_semver("V2.1"), Some("2.1.0".to_string()));
        assert_eq!(coerce_semver("2023-05-31"), None);
        assert_eq!(coerce_semver("unstable"), None);
    }

    #[test]
    fn partitions_version_kinds() {
        assert_eq!(get_version_kind("4.2.0"), VersionKind::Semver);
        assert_eq!(get_version_kind("2023-05-31"), VersionKind::Date);
        assert_eq!(get_version_kind("4.2"), VersionKind::Other);
        assert!(VersionKind::Other < VersionKind::Date);
        assert!(VersionKind::Date < VersionKind::Semver);
    }

    #[test]
    fn orders_semvers() {
        assert!(compare_semvers_lt("1.0.0", "2.0.0", false).unwrap());
        assert!(compare_semvers_lt("2.0.0", "2.1.0", false).unwrap());
        assert!(compare_semvers_lt("2.1.0", "2.1.1", false).unwrap());
        assert!(!compare_semvers_lt("2.1.1", "2.1.1", false).unwrap());
        assert!(compare_semvers_lt("4.2.0", "unstable", false).is_err());
    }

    #[test]
    fn pre_releases_rank_below_releases_by_default() {
        assert!(compare_semvers_lt("1.0.0-pre", "1.0.0", false).unwrap());
        assert!(!compare_semvers_lt("1.0.0", "1.0.0-pre", false).unwrap());
        // The inverse when pre-releases are preferred.
        assert!(compare_semvers_lt("1.0.0", "1.0.0-pre", true).unwrap());
        // A pre-release of a higher core version still ranks higher.
        assert!(compare_semvers_lt("1.0.0", "1.1.0-pre", false).unwrap());
    }

    #[test]
    fn orders_dates() {
        assert!(compare_date_versions_lt("2022-12-31", "2023-01-01").unwrap());
        assert!(compare_date_versions_lt("05-31-2023", "2023-06-01").unwrap());
        assert!(compare_date_versions_lt("2023-05-31", "2023-05-31-pre").unwrap());
        assert!(compare_date_versions_lt("4.2.0", "2023-01-01").is_err());
    }

    #[test]
    fn orders_across_kinds() {
        assert!(compare_versions_lt("unstable", "2023-05-31", false));
        assert!(compare_versions_lt("2023-05-31", "0.0.1", false));
        assert!(compare_versions_lt("alpha", "beta", false));
        assert!(!compare_versions_lt("beta", "alpha", false));
    }

    proptest! {
        /// Exactly one of `a < b`, `b < a`, or `a == b` holds.
        #[test]
        fn strict_total_order(
            a in "[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,2}(-(pre|rc[0-9]))?",
            b in "[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,2}(-(pre|rc[0-9]))?",
        ) {
            let lt = compare_versions_lt(&a, &b, false);
            let gt = compare_versions_lt(&b, &a, false);
            let eq = a == b;
            prop_assert_eq!(
                1,
                usize::from(lt) + usize::from(gt) + usize::from(eq)
            );
        }

        /// Every version string falls into exactly one kind.
        #[test]
        fn kind_partition(version in "[0-9A-Za-z.-]{1,12}") {
            let kind = get_version_kind(&version);
            let by_kind = [
                is_semver(&version),
                is_date(&version),
                kind == VersionKind::Other,
            ];
            prop_assert_eq!(1, by_kind.iter().filter(|hit| **hit).count());
        }
    }
}
