//! Named collections of input flakes with per-input preferences.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::flake::FlakeRef;
use crate::types::Subtree;

/// Preferences associated with a registry input.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPreferences {
    /// Ordered list of subtrees to be searched. Results are grouped by
    /// subtree in the order they appear here.
    pub subtrees: Option<Vec<Subtree>>,
    /// Ordered list of stabilities to be searched ( catalog only ).
    pub stabilities: Option<Vec<String>>,
}

impl InputPreferences {
    /// Whether no preference is set.
    pub fn is_unset(&self) -> bool {
        self.subtrees.is_none() && self.stabilities.is_none()
    }

    /// These preferences with unset fields filled from `defaults`.
    pub fn or(&self, defaults: &InputPreferences) -> InputPreferences {
        InputPreferences {
            subtrees: self.subtrees.clone().or_else(|| defaults.subtrees.clone()),
            stabilities: self
                .stabilities
                .clone()
                .or_else(|| defaults.stabilities.clone()),
        }
    }
}

/// Preferences associated with a named registry input.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryInput {
    /// The flake this input draws packages from.
    pub from: FlakeRef,
    #[serde(flatten)]
    pub prefs: InputPreferences,
}

/// A set of user inputs used to set input preferences during search
/// and resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryRaw {
    /// Settings and fetcher information associated with named inputs.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, RegistryInput>,
    /// Default/fallback settings for inputs.
    #[serde(skip_serializing_if = "InputPreferences::is_unset")]
    pub defaults: InputPreferences,
    /// Priority order used to process inputs. Inputs which do not appear
    /// here are handled in the stable order of the input map afterwards.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub priority: Vec<String>,
}

impl RegistryRaw {
    /// Inputs in effective iteration order.
    pub fn iter_in_order(&self) -> impl Iterator<Item = (&String, &RegistryInput)> {
        let mut ordered = Vec::with_capacity(self.inputs.len());
        for name in &self.priority {
            if let Some(entry) = self.inputs.get_key_value(name) {
                ordered.push(entry);
            }
        }
        for entry in &self.inputs {
            if !self.priority.contains(entry.0) {
                ordered.push(entry);
            }
        }
        ordered.into_iter()
    }

    /// Union with `other`, whose inputs override ours by name. `defaults`
    /// and `priority` are clobbered when `other` sets them.
    pub fn merge(&mut self, other: RegistryRaw) {
        for (name, input) in other.inputs {
            self.inputs.insert(name, input);
        }
        if other.defaults.subtrees.is_some() {
            self.defaults.subtrees = other.defaults.subtrees;
        }
        if other.defaults.stabilities.is_some() {
            self.defaults.stabilities = other.defaults.stabilities;
        }
        if !other.priority.is_empty() {
            self.priority = other.priority;
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn registry(json: serde_json::Value) -> RegistryRaw {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn parses_example_registry() {
        let parsed = registry(json!({
            "inputs": {
                "nixpkgs": {
                    "from": { "type": "github", "owner": "NixOS", "repo": "nixpkgs" },
                    "subtrees": ["legacyPackages"],
                },
                "floco": {
                    "from": { "type": "github", "owner": "aakropotkin", "repo": "floco" },
                },
            },
            "defaults": { "stabilities": ["stable"] },
            "priority": ["floco"],
        }));
        assert_eq!(
            parsed.inputs["nixpkgs"].prefs.subtrees,
            Some(vec![Subtree::LegacyPackages])
        );
        let effective = parsed.inputs["floco"].prefs.or(&parsed.defaults);
        assert_eq!(effective.stabilities, Some(vec!["stable".to_string()]));
    }

    #[test]
    fn iterates_priority_first_then_map_order() {
        let parsed = registry(json!({
            "inputs": {
                "alpha": { "from": "github:example/alpha" },
                "beta": { "from": "github:example/beta" },
                "gamma": { "from": "github:example/gamma" },
            },
            "priority": ["gamma"],
        }));
        let order: Vec<&str> = parsed
            .iter_in_order()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(order, vec!["gamma", "alpha", "beta"]);
    }

    #[test]
    fn merge_overrides_by_name() {
        let mut base = registry(json!({
            "inputs": {
                "nixpkgs": { "from": "github:NixOS/nixpkgs/23.05" },
                "extra": { "from": "github:example/extra" },
            },
        }));
        let overlay = registry(json!({
            "inputs": {
                "nixpkgs": { "from": "github:NixOS/nixpkgs/23.11" },
            },
            "priority": ["nixpkgs"],
        }));
        base.merge(overlay);
        assert_eq!(base.inputs.len(), 2);
        assert_eq!(
            base.inputs["nixpkgs"].from,
            json!("github:NixOS/nixpkgs/23.11")
        );
        assert_eq!(base.priority, vec!["nixpkgs"]);
    }
}
