//! The attribute-cursor contract fulfilled by the host evaluator.
//!
//! A [`Cursor`] is a cheap handle into a lazily evaluated attribute tree.
//! Evaluation failures are catchable per cursor; the scraper relies on this
//! to isolate evaluation-hostile attributes in tolerant subtrees.

use std::rc::Rc;

use crate::flake::LockedFlake;
use crate::types::AttrPath;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("attribute '{0}' does not exist")]
    NoSuchAttr(String),
    #[error("attribute '{0}' is not of the expected type")]
    WrongType(String),
    #[error("evaluation of '{0}' failed: {1}")]
    Eval(String, String),
    #[error("no such flake '{0}'")]
    NoSuchFlake(String),
}

pub type Cursor = Rc<dyn AttrCursor>;

/// Read-only view of one node in a lazy package tree.
pub trait AttrCursor {
    /// The absolute attribute path of this cursor.
    fn path(&self) -> AttrPath;

    /// Attribute names of this node, in the evaluator's declared order.
    fn list_attrs(&self) -> Result<Vec<String>, EvalError>;

    /// Descend to a child attribute, `None` if it does not exist.
    fn maybe_child(&self, name: &str) -> Result<Option<Cursor>, EvalError>;

    /// Whether this node is a derivation ( `type = "derivation"` ).
    fn is_derivation(&self) -> Result<bool, EvalError>;

    /// Force a string-valued field of this node.
    fn get_string(&self, field: &str) -> Result<String, EvalError>;

    /// Force a boolean-valued field of this node.
    fn get_bool(&self, field: &str) -> Result<bool, EvalError>;

    /// Force a list-of-strings field of this node.
    fn get_list_of_strings(&self, field: &str) -> Result<Vec<String>, EvalError>;

    /// All children with their names, in declared order.
    fn children(&self) -> Result<Vec<(String, Cursor)>, EvalError> {
        let mut children = Vec::new();
        for name in self.list_attrs()? {
            if let Some(child) = self.maybe_child(&name)? {
                children.push((name, child));
            }
        }
        Ok(children)
    }
}

/// Host capability: open the root cursor of a locked flake's output tree.
pub trait Evaluator {
    fn open_flake(&self, flake: &LockedFlake) -> Result<Cursor, EvalError>;
}

/// Open a cursor at `prefix` inside `flake`, `None` if any component of the
/// path is missing.
pub fn open_cursor(
    evaluator: &dyn Evaluator,
    flake: &LockedFlake,
    prefix: &[String],
) -> Result<Option<Cursor>, EvalError> {
    let mut cursor = evaluator.open_flake(flake)?;
    for name in prefix {
        match cursor.maybe_child(name)? {
            Some(child) => cursor = child,
            None => return Ok(None),
        }
    }
    Ok(Some(cursor))
}

#[cfg(any(test, feature = "tests"))]
pub mod memory {
    //! An in-memory evaluator backed by JSON trees, for tests.
    //!
    //! Derivations are objects with `"type": "derivation"`. An object
    //! containing an `"__error"` key fails every evaluation of that node,
    //! which lets tests inject evaluation-hostile attributes.

    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use serde_json::Value;

    use super::{AttrCursor, Cursor, EvalError, Evaluator};
    use crate::flake::{FlakeError, FlakeLocker, FlakeRef, Fingerprint, LockedFlake, LockedFlakeRef};
    use crate::types::AttrPath;

    #[derive(Debug, Default)]
    pub struct MemoryEvaluator {
        flakes: RefCell<HashMap<String, Rc<Value>>>,
    }

    impl MemoryEvaluator {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register `tree` as the output tree of `flake_ref` and return the
        /// locked form.
        pub fn add_flake(&self, flake_ref: &FlakeRef, tree: Value) -> LockedFlake {
            let locked = lock(flake_ref);
            self.flakes
                .borrow_mut()
                .insert(locked.fingerprint.to_hex(), Rc::new(tree));
            locked
        }
    }

    /// Fingerprint a flake reference by hashing its canonical JSON form,
    /// making locks deterministic across runs.
    fn lock(flake_ref: &FlakeRef) -> LockedFlake {
        let canonical = flake_ref.to_string();
        let string = match flake_ref {
            Value::String(uri) => uri.clone(),
            other => other.to_string(),
        };
        LockedFlake {
            fingerprint: Fingerprint::of_bytes(canonical.as_bytes()),
            locked_ref: LockedFlakeRef {
                string,
                attrs: flake_ref.clone(),
            },
        }
    }

    impl FlakeLocker for MemoryEvaluator {
        fn lock_flake(&self, flake_ref: &FlakeRef) -> Result<LockedFlake, FlakeError> {
            Ok(lock(flake_ref))
        }
    }

    impl Evaluator for MemoryEvaluator {
        fn open_flake(&self, flake: &LockedFlake) -> Result<Cursor, EvalError> {
            let tree = self
                .flakes
                .borrow()
                .get(&flake.fingerprint.to_hex())
                .cloned()
                .ok_or_else(|| EvalError::NoSuchFlake(flake.locked_ref.string.clone()))?;
            Ok(Rc::new(MemoryCursor {
                value: tree,
                path: Vec::new(),
            }))
        }
    }

    struct MemoryCursor {
        value: Rc<Value>,
        path: AttrPath,
    }

    impl MemoryCursor {
        fn check(&self) -> Result<&serde_json::Map<String, Value>, EvalError> {
            let path = self.path.join(".");
            let object = self
                .value
                .as_object()
                .ok_or_else(|| EvalError::WrongType(path.clone()))?;
            if let Some(message) = object.get("__error") {
                return Err(EvalError::Eval(
                    path,
                    message.as_str().unwrap_or("injected failure").to_string(),
                ));
            }
            Ok(object)
        }

        fn field_path(&self, field: &str) -> String {
            let mut path = self.path.join(".");
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(field);
            path
        }
    }

    impl AttrCursor for MemoryCursor {
        fn path(&self) -> AttrPath {
            self.path.clone()
        }

        fn list_attrs(&self) -> Result<Vec<String>, EvalError> {
            Ok(self.check()?.keys().cloned().collect())
        }

        fn maybe_child(&self, name: &str) -> Result<Option<Cursor>, EvalError> {
            let Some(child) = self.check()?.get(name) else {
                return Ok(None);
            };
            let mut path = self.path.clone();
            path.push(name.to_string());
            Ok(Some(Rc::new(MemoryCursor {
                value: Rc::new(child.clone()),
                path,
            })))
        }

        fn is_derivation(&self) -> Result<bool, EvalError> {
            Ok(self.check()?.get("type").and_then(Value::as_str) == Some("derivation"))
        }

        fn get_string(&self, field: &str) -> Result<String, EvalError> {
            match self.check()?.get(field) {
                None => Err(EvalError::NoSuchAttr(self.field_path(field))),
                Some(Value::String(value)) => Ok(value.clone()),
                Some(_) => Err(EvalError::WrongType(self.field_path(field))),
            }
        }

        fn get_bool(&self, field: &str) -> Result<bool, EvalError> {
            match self.check()?.get(field) {
                None => Err(EvalError::NoSuchAttr(self.field_path(field))),
                Some(Value::Bool(value)) => Ok(*value),
                Some(_) => Err(EvalError::WrongType(self.field_path(field))),
            }
        }

        fn get_list_of_strings(&self, field: &str) -> Result<Vec<String>, EvalError> {
            match self.check()?.get(field) {
                None => Err(EvalError::NoSuchAttr(self.field_path(field))),
                Some(Value::Array(values)) => values
                    .iter()
                    .map(|value| {
                        value
                            .as_str()
                            .map(str::to_string)
                            .ok_or_else(|| EvalError::WrongType(self.field_path(field)))
                    })
                    .collect(),
                Some(_) => Err(EvalError::WrongType(self.field_path(field))),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::memory::MemoryEvaluator;
    use super::*;
    use crate::flake::FlakeLocker;

    fn fixture() -> (MemoryEvaluator, LockedFlake) {
        let evaluator = MemoryEvaluator::new();
        let locked = evaluator.add_flake(
            &serde_json::json!("github:example/flake"),
            json!({
                "packages": {
                    "x86_64-linux": {
                        "hello": {
                            "type": "derivation",
                            "name": "hello-2.12.1",
                            "outputs": ["out"],
                        },
                        "poison": { "__error": "boom" },
                    },
                },
            }),
        );
        (evaluator, locked)
    }

    #[test]
    fn opens_cursors_by_prefix() {
        let (evaluator, locked) = fixture();
        let prefix = vec!["packages".to_string(), "x86_64-linux".to_string()];
        let cursor = open_cursor(&evaluator, &locked, &prefix).unwrap().unwrap();
        assert_eq!(cursor.path(), prefix);
        assert_eq!(cursor.list_attrs().unwrap(), vec!["hello", "poison"]);

        let missing = vec!["packages".to_string(), "mips-linux".to_string()];
        assert!(open_cursor(&evaluator, &locked, &missing).unwrap().is_none());
    }

    #[test]
    fn reads_fields_and_detects_derivations() {
        let (evaluator, locked) = fixture();
        let prefix = vec!["packages".to_string(), "x86_64-linux".to_string()];
        let cursor = open_cursor(&evaluator, &locked, &prefix).unwrap().unwrap();
        let hello = cursor.maybe_child("hello").unwrap().unwrap();
        assert!(hello.is_derivation().unwrap());
        assert_eq!(hello.get_string("name").unwrap(), "hello-2.12.1");
        assert_eq!(hello.get_list_of_strings("outputs").unwrap(), vec!["out"]);
        assert!(matches!(
            hello.get_string("missing"),
            Err(EvalError::NoSuchAttr(_))
        ));
    }

    #[test]
    fn injected_errors_are_catchable_per_cursor() {
        let (evaluator, locked) = fixture();
        let prefix = vec!["packages".to_string(), "x86_64-linux".to_string()];
        let cursor = open_cursor(&evaluator, &locked, &prefix).unwrap().unwrap();
        let poison = cursor.maybe_child("poison").unwrap().unwrap();
        assert!(matches!(poison.is_derivation(), Err(EvalError::Eval(..))));
        // Siblings are unaffected.
        assert!(cursor.maybe_child("hello").unwrap().is_some());
    }

    #[test]
    fn locks_are_deterministic() {
        let evaluator = MemoryEvaluator::new();
        let flake_ref = serde_json::json!({ "type": "github", "owner": "example", "repo": "flake" });
        let first = evaluator.lock_flake(&flake_ref).unwrap();
        let second = evaluator.lock_flake(&flake_ref).unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
    }
}
