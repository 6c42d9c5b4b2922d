//! Extraction of a uniform package record from a derivation cursor.

use serde::{Deserialize, Serialize};

use crate::eval::{Cursor, EvalError};
use crate::types::{AttrPath, Subtree, System};
use crate::versions::coerce_semver;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackageError {
    #[error("package attribute path '{0}' is too short, expected at least {1} elements")]
    PathTooShort(String, usize),
    #[error("invalid subtree '{0}'")]
    InvalidSubtree(String),
    #[error("attribute set at '{0}' is not a derivation")]
    NotADerivation(String),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// A package record extracted from a derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub pname: String,
    pub version: Option<String>,
    pub semver: Option<String>,
    pub outputs: Vec<String>,
    pub outputs_to_install: Vec<String>,
    pub license: Option<String>,
    pub broken: Option<bool>,
    pub unfree: Option<bool>,
    pub description: Option<String>,
    pub path: AttrPath,
    pub subtree: Subtree,
    pub system: System,
}

impl Package {
    /// Extract a package from a cursor positioned at a derivation.
    ///
    /// `name` is required; `pname` and `version` fall back to splitting the
    /// derivation name. With `check_drv` the cursor must confirm
    /// `type = "derivation"`.
    pub fn from_cursor(
        cursor: &Cursor,
        path: AttrPath,
        check_drv: bool,
    ) -> Result<Self, PackageError> {
        let subtree: Subtree = path
            .first()
            .map(String::as_str)
            .unwrap_or("")
            .parse()
            .map_err(|_| {
                PackageError::InvalidSubtree(path.first().cloned().unwrap_or_default())
            })?;
        let min_len = subtree.prefix_len() + 1;
        if path.len() < min_len {
            return Err(PackageError::PathTooShort(path.join("."), min_len));
        }
        if check_drv && !cursor.is_derivation()? {
            return Err(PackageError::NotADerivation(path.join(".")));
        }

        let name = cursor.get_string("name")?;
        let (derived_pname, derived_version) = split_drv_name(&name);
        let pname = cursor
            .get_string("pname")
            .ok()
            .unwrap_or_else(|| derived_pname.to_string());
        let version = cursor.get_string("version").ok().or(derived_version);
        let semver = version.as_deref().and_then(coerce_semver);

        let meta = cursor.maybe_child("meta").ok().flatten();
        let license = meta.as_ref().and_then(|meta| {
            match meta.maybe_child("license").ok().flatten() {
                Some(license) => license
                    .get_string("spdxId")
                    .ok()
                    .or_else(|| meta.get_string("license").ok()),
                None => None,
            }
        });
        let broken = meta.as_ref().and_then(|meta| meta.get_bool("broken").ok());
        let unfree = meta.as_ref().and_then(|meta| meta.get_bool("unfree").ok());
        let description = meta
            .as_ref()
            .and_then(|meta| meta.get_string("description").ok());

        let outputs = cursor
            .get_list_of_strings("outputs")
            .ok()
            .unwrap_or_else(|| vec!["out".to_string()]);
        let outputs_to_install = meta
            .as_ref()
            .and_then(|meta| meta.get_list_of_strings("outputsToInstall").ok())
            .unwrap_or_else(|| default_outputs_to_install(&outputs));

        let system = path[1].clone();
        Ok(Package {
            name,
            pname,
            version,
            semver,
            outputs,
            outputs_to_install,
            license,
            broken,
            unfree,
            description,
            path,
            subtree,
            system,
        })
    }
}

/// The prefix of `outputs` up to and including `"out"`.
fn default_outputs_to_install(outputs: &[String]) -> Vec<String> {
    let mut to_install = Vec::new();
    for output in outputs {
        to_install.push(output.clone());
        if output == "out" {
            break;
        }
    }
    to_install
}

/// Split a derivation name into its package name and trailing version, the
/// way `builtins.parseDrvName` does: the split is at the first dash
/// followed by a non-letter.
pub fn split_drv_name(name: &str) -> (&str, Option<String>) {
    let bytes = name.as_bytes();
    for (idx, byte) in bytes.iter().enumerate() {
        if *byte == b'-' {
            match bytes.get(idx + 1) {
                Some(next) if !next.is_ascii_alphabetic() => {
                    return (&name[..idx], Some(name[idx + 1..].to_string()));
                },
                _ => (),
            }
        }
    }
    (name, None)
}
