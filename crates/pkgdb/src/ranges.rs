//! Semantic version _range_ evaluation.
//!
//! Ranges use the grammar popularized by `node-semver`: comparator sets
//! separated by `||`, hyphen ranges, `x`/`X`/`*` wildcards, and the
//! `^`/`~`/`>`/`>=`/`<`/`<=`/`=` operators. Matching always considers
//! pre-release versions eligible and versions are parsed loosely
//! ( `v1.2` is accepted as `1.2.0` ).

use semver::{Prerelease, Version};

use crate::versions::coerce_semver;

/// Range strings which match every version.
const ACCEPT_ALL: [&str; 7] = ["", "*", "any", "^*", "~*", "x", "X"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid semver range '{range}': {reason}")]
pub struct RangeError {
    pub range: String,
    pub reason: String,
}

impl RangeError {
    fn new(range: &str, reason: impl Into<String>) -> Self {
        RangeError {
            range: range.to_string(),
            reason: reason.into(),
        }
    }
}

/// A single lowered comparison against a concrete version.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Bound {
    Lt(Version),
    Le(Version),
    Gt(Version),
    Ge(Version),
    Eq(Version),
}

impl Bound {
    fn matches(&self, version: &Version) -> bool {
        match self {
            Bound::Lt(bound) => version < bound,
            Bound::Le(bound) => version <= bound,
            Bound::Gt(bound) => version > bound,
            Bound::Ge(bound) => version >= bound,
            Bound::Eq(bound) => version == bound,
        }
    }
}

/// A version with possibly missing or wildcarded components, as written in
/// a comparator such as `1.2` or `1.x`.
#[derive(Debug, Clone, Default)]
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Option<String>,
}

impl Partial {
    fn parse(range: &str, text: &str) -> Result<Self, RangeError> {
        let text = text.strip_prefix(['v', 'V']).unwrap_or(text);
        // Build metadata carries no ordering information.
        let text = text.split_once('+').map_or(text, |(head, _)| head);
        if text.is_empty() {
            return Ok(Partial::default());
        }
        let (core, pre) = match text.split_once('-') {
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (text, None),
        };
        let mut components = [None, None, None];
        let mut iter = core.split('.');
        for slot in components.iter_mut() {
            match iter.next() {
                None => break,
                Some("x") | Some("X") | Some("*") | Some("") => (),
                Some(number) => {
                    *slot = Some(number.parse::<u64>().map_err(|_| {
                        RangeError::new(range, format!("invalid version component '{number}'"))
                    })?);
                },
            }
        }
        if iter.next().is_some() {
            return Err(RangeError::new(range, format!("too many components in '{text}'")));
        }
        let [major, minor, patch] = components;
        Ok(Partial {
            major,
            minor,
            patch,
            pre,
        })
    }

    /// The version this partial denotes with missing components zeroed.
    fn floor(&self, range: &str) -> Result<Version, RangeError> {
        let mut version = Version::new(
            self.major.unwrap_or(0),
            self.minor.unwrap_or(0),
            self.patch.unwrap_or(0),
        );
        if let Some(pre) = &self.pre {
            version.pre = Prerelease::new(pre)
                .map_err(|err| RangeError::new(range, format!("invalid pre-release: {err}")))?;
        }
        Ok(version)
    }
}

/// A parsed semantic version range: alternatives of conjoined bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemverRange {
    alternatives: Vec<Vec<Bound>>,
}

impl SemverRange {
    /// Parse a range string. Accept-all forms produce a range with a single
    /// unconstrained alternative.
    pub fn parse(range: &str) -> Result<Self, RangeError> {
        let trimmed = range.trim();
        if ACCEPT_ALL.contains(&trimmed) {
            return Ok(SemverRange {
                alternatives: vec![Vec::new()],
            });
        }
        let mut alternatives = Vec::new();
        for alternative in trimmed.split("||") {
            alternatives.push(parse_alternative(range, alternative.trim())?);
        }
        Ok(SemverRange { alternatives })
    }

    /// Whether `version` satisfies this range. Pre-releases are eligible.
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|bounds| bounds.iter().all(|bound| bound.matches(version)))
    }
}

fn parse_alternative(range: &str, alternative: &str) -> Result<Vec<Bound>, RangeError> {
    if alternative.is_empty() {
        return Ok(Vec::new());
    }
    if let Some((low, high)) = alternative.split_once(" - ") {
        return parse_hyphen(range, low.trim(), high.trim());
    }
    let mut bounds = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in alternative.split_whitespace() {
        // An operator may be separated from its version by whitespace.
        if matches!(token, "<" | "<=" | ">" | ">=" | "=" | "^" | "~") {
            if pending_op.is_some() {
                return Err(RangeError::new(range, format!("dangling operator '{token}'")));
            }
            pending_op = Some(token);
            continue;
        }
        let (op, rest) = match pending_op.take() {
            Some(op) => (op, token),
            None => split_operator(token),
        };
        bounds.extend(parse_comparator(range, op, rest)?);
    }
    if pending_op.is_some() {
        return Err(RangeError::new(range, "trailing operator"));
    }
    Ok(bounds)
}

fn split_operator(token: &str) -> (&str, &str) {
    for op in ["<=", ">=", "<", ">", "=", "^", "~"] {
        if let Some(rest) = token.strip_prefix(op) {
            return (op, rest);
        }
    }
    ("", token)
}

fn parse_hyphen(range: &str, low: &str, high: &str) -> Result<Vec<Bound>, RangeError> {
    let mut bounds = parse_comparator(range, ">=", low)?;
    let high = Partial::parse(range, high)?;
    match (high.major, high.minor, high.patch) {
        (None, _, _) => (),
        (Some(major), None, _) => bounds.push(Bound::Lt(Version::new(major + 1, 0, 0))),
        (Some(major), Some(minor), None) => {
            bounds.push(Bound::Lt(Version::new(major, minor + 1, 0)));
        },
        (Some(_), Some(_), Some(_)) => bounds.push(Bound::Le(high.floor(range)?)),
    }
    Ok(bounds)
}

/// Lower one comparator to primitive bounds.
fn parse_comparator(range: &str, op: &str, text: &str) -> Result<Vec<Bound>, RangeError> {
    let partial = Partial::parse(range, text)?;
    let floor = partial.floor(range)?;
    let bounds = match op {
        "" | "=" => match (partial.major, partial.minor, partial.patch) {
            (None, _, _) => Vec::new(),
            (Some(_), None, _) => {
                vec![
                    Bound::Ge(floor),
                    Bound::Lt(Version::new(partial.major.unwrap_or(0) + 1, 0, 0)),
                ]
            },
            (Some(major), Some(minor), None) => {
                vec![Bound::Ge(floor), Bound::Lt(Version::new(major, minor + 1, 0))]
            },
            (Some(_), Some(_), Some(_)) => vec![Bound::Eq(floor)],
        },
        "^" => match partial.major {
            None => Vec::new(),
            Some(major) if major > 0 => {
                vec![Bound::Ge(floor), Bound::Lt(Version::new(major + 1, 0, 0))]
            },
            Some(_) => match partial.minor {
                None => vec![Bound::Ge(floor), Bound::Lt(Version::new(1, 0, 0))],
                Some(minor) if minor > 0 => {
                    vec![Bound::Ge(floor), Bound::Lt(Version::new(0, minor + 1, 0))]
                },
                Some(minor) => match partial.patch {
                    None => vec![Bound::Ge(floor), Bound::Lt(Version::new(0, minor + 1, 0))],
                    Some(patch) => {
                        vec![Bound::Ge(floor), Bound::Lt(Version::new(0, minor, patch + 1))]
                    },
                },
            },
        },
        "~" => match (partial.major, partial.minor) {
            (None, _) => Vec::new(),
            (Some(major), None) => {
                vec![Bound::Ge(floor), Bound::Lt(Version::new(major + 1, 0, 0))]
            },
            (Some(major), Some(minor)) => {
                vec![Bound::Ge(floor), Bound::Lt(Version::new(major, minor + 1, 0))]
            },
        },
        ">" => match (partial.major, partial.minor, partial.patch) {
            (None, _, _) => vec![Bound::Lt(Version::new(0, 0, 0))],
            (Some(major), None, _) => vec![Bound::Ge(Version::new(major + 1, 0, 0))],
            (Some(major), Some(minor), None) => {
                vec![Bound::Ge(Version::new(major, minor + 1, 0))]
            },
            (Some(_), Some(_), Some(_)) => vec![Bound::Gt(floor)],
        },
        ">=" => vec![Bound::Ge(floor)],
        "<" => vec![Bound::Lt(floor)],
        "<=" => match (partial.major, partial.minor, partial.patch) {
            (None, _, _) => Vec::new(),
            (Some(major), None, _) => vec![Bound::Lt(Version::new(major + 1, 0, 0))],
            (Some(major), Some(minor), None) => {
                vec![Bound::Lt(Version::new(major, minor + 1, 0))]
            },
            (Some(_), Some(_), Some(_)) => vec![Bound::Le(floor)],
        },
        other => return Err(RangeError::new(range, format!("unknown operator '{other}'"))),
    };
    Ok(bounds)
}

/// Parse a version string loosely into a [`Version`], coercing forms such
/// as `v1.2` or `foo@1.2.3-pre`.
pub fn parse_version_loose(version: &str) -> Option<Version> {
    Version::parse(&coerce_semver(version)?).ok()
}

/// Filter `versions` down to those satisfying `range`, preserving the input
/// order. Versions which cannot be coerced to a semantic version never
/// satisfy a (non accept-all) range.
pub fn semver_sat(range: &str, versions: &[String]) -> Result<Vec<String>, RangeError> {
    if ACCEPT_ALL.contains(&range.trim()) {
        return Ok(versions.to_vec());
    }
    let parsed = SemverRange::parse(range)?;
    Ok(versions
        .iter()
        .filter(|version| {
            parse_version_loose(version).is_some_and(|version| parsed.matches(&version))
        })
        .cloned()
        .collect())
}

/// Whether a range of the form `~MAJOR.MINOR-TAG` asks for pre-release
/// ordering preference.
pub fn range_prefers_pre_releases(range: &str) -> bool {
    range.starts_with('~')
        && range
            .split_whitespace()
            .next()
            .is_some_and(|comparator| comparator.contains('-'))
}

#[cfg(test)]
mod test {
    use super::*;

    fn sat(range: &str, versions: &[&str]) -> Vec<String> {
        let versions: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
        semver_sat(range, &versions).unwrap()
    }

    #[test]
    fn accept_all_tokens() {
        for range in ACCEPT_ALL {
            assert_eq!(sat(range, &["1.0.0", "junk"]), vec!["1.0.0", "junk"]);
        }
    }

    #[test]
    fn caret_ranges() {
        assert_eq!(sat("^2", &["1.9.0", "2.0.0", "2.12.1", "3.0.0"]), vec![
            "2.0.0", "2.12.1"
        ]);
        assert_eq!(sat("^0.2.3", &["0.2.3", "0.2.9", "0.3.0"]), vec![
            "0.2.3", "0.2.9"
        ]);
        assert_eq!(sat("^0.0.3", &["0.0.3", "0.0.4"]), vec!["0.0.3"]);
    }

    #[test]
    fn tilde_ranges() {
        assert_eq!(sat("~1.2", &["1.1.9", "1.2.0", "1.2.5", "1.3.0"]), vec![
            "1.2.0", "1.2.5"
        ]);
        assert_eq!(sat("~1", &["0.9.0", "1.4.2", "2.0.0"]), vec!["1.4.2"]);
    }

    #[test]
    fn comparison_ranges() {
        assert_eq!(sat(">=2.1.0 <3.0.0", &["2.0.0", "2.1.0", "2.9.9", "3.0.0"]), vec![
            "2.1.0", "2.9.9"
        ]);
        assert_eq!(sat(">1.2", &["1.2.9", "1.3.0"]), vec!["1.3.0"]);
        assert_eq!(sat("<=1.2", &["1.2.9", "1.3.0"]), vec!["1.2.9"]);
        assert_eq!(sat("=1.2.3", &["1.2.3", "1.2.4"]), vec!["1.2.3"]);
    }

    #[test]
    fn or_and_hyphen_ranges() {
        assert_eq!(sat("1.2.3 || ^2", &["1.2.3", "1.2.4", "2.4.0"]), vec![
            "1.2.3", "2.4.0"
        ]);
        assert_eq!(sat("1.2 - 2.3.4", &["1.1.0", "1.2.0", "2.3.4", "2.3.5"]), vec![
            "1.2.0", "2.3.4"
        ]);
        assert_eq!(sat("1.2 - 2.3", &["2.3.9", "2.4.0"]), vec!["2.3.9"]);
    }

    #[test]
    fn wildcards() {
        assert_eq!(sat("1.x", &["1.0.0", "1.9.9", "2.0.0"]), vec!["1.0.0", "1.9.9"]);
        assert_eq!(sat("1.2.X", &["1.2.0", "1.3.0"]), vec!["1.2.0"]);
    }

    #[test]
    fn pre_releases_are_eligible() {
        assert_eq!(sat("^2", &["2.1.0-pre", "2.1.0"]), vec!["2.1.0-pre", "2.1.0"]);
        assert_eq!(sat("<2.0.0", &["2.0.0-rc1", "2.0.0"]), vec!["2.0.0-rc1"]);
    }

    #[test]
    fn loose_versions() {
        assert_eq!(sat("^1", &["v1.2", "1", "junk"]), vec!["v1.2", "1"]);
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert!(semver_sat("bogus", &[]).is_err());
        assert!(semver_sat(">= ", &[]).is_err());
        assert!(semver_sat("1.2.3.4", &[]).is_err());
    }

    #[test]
    fn detects_pre_release_preference() {
        assert!(range_prefers_pre_releases("~1.2-pre"));
        assert!(!range_prefers_pre_releases("~1.2"));
        assert!(!range_prefers_pre_releases("^1.2-pre"));
    }
}
