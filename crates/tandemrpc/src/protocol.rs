//! # Protocol Descriptors
//!
//! A `ProcedureDescriptor` is the static shape of one callable: its name, the
//! ordered keys it requires, and the ordered keys it accepts optionally along
//! with the defaults the owning side applies when they are omitted.
//!
//! A `Protocol` is the full, ordered set of descriptors one side exposes. It is
//! exchanged wholesale at session start so the peer can build its proxy.
//!
//! ## Invariants
//!
//! - Procedure names are non-empty and unique within a protocol.
//! - Parameter keys are non-empty and unique within a procedure, across both
//!   the required and optional partitions.
//! - Required keys fix the positional order; optional keys are keyword-only.

use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Errors raised while assembling a protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("procedure name cannot be empty")]
    EmptyName,
    #[error("procedure '{0}' is declared more than once")]
    DuplicateProcedure(String),
    #[error("procedure '{procedure}' declares a parameter with an empty key")]
    EmptyKey { procedure: String },
    #[error("procedure '{procedure}' declares parameter '{key}' more than once")]
    DuplicateKey { procedure: String, key: String },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequiredParam {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionalParam {
    pub key: String,
    #[serde(default)]
    pub default: Value,
}

/// Static description of one callable's name and parameter shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureDescriptor {
    #[serde(rename = "procedure", alias = "name")]
    pub name: String,
    pub required: Vec<RequiredParam>,
    pub optional: Vec<OptionalParam>,
}

impl ProcedureDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: Vec::new(),
            optional: Vec::new(),
        }
    }

    pub fn with_required(mut self, key: impl Into<String>) -> Self {
        self.required.push(RequiredParam { key: key.into() });
        self
    }

    pub fn with_optional(mut self, key: impl Into<String>, default: Value) -> Self {
        self.optional.push(OptionalParam { key: key.into(), default });
        self
    }

    /// The smallest number of arguments a call may carry.
    pub fn min_args(&self) -> usize {
        self.required.len()
    }

    /// The largest number of arguments a call may carry.
    pub fn max_args(&self) -> usize {
        self.required.len() + self.optional.len()
    }

    pub fn is_required(&self, key: &str) -> bool {
        self.required.iter().any(|p| p.key == key)
    }

    pub fn optional_param(&self, key: &str) -> Option<&OptionalParam> {
        self.optional.iter().find(|p| p.key == key)
    }

    /// All parameter keys, required first, each partition in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(|p| p.key.as_str())
            .chain(self.optional.iter().map(|p| p.key.as_str()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ProtocolError::EmptyName);
        }

        let mut seen = HashSet::new();
        for key in self.keys() {
            if key.is_empty() {
                return Err(ProtocolError::EmptyKey { procedure: self.name.clone() });
            }
            if !seen.insert(key) {
                return Err(ProtocolError::DuplicateKey {
                    procedure: self.name.clone(),
                    key: key.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// The ordered set of procedures exposed by one side of a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<ProcedureDescriptor>", into = "Vec<ProcedureDescriptor>")]
pub struct Protocol {
    procedures: Vec<ProcedureDescriptor>,
}

impl Protocol {
    /// Validates every descriptor and rejects duplicate names.
    pub fn new(procedures: Vec<ProcedureDescriptor>) -> Result<Self> {
        let mut names = HashSet::new();
        for procedure in &procedures {
            procedure.validate()?;
            if !names.insert(procedure.name.as_str()) {
                return Err(ProtocolError::DuplicateProcedure(procedure.name.clone()));
            }
        }
        Ok(Self { procedures })
    }

    pub fn get(&self, name: &str) -> Option<&ProcedureDescriptor> {
        self.procedures.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProcedureDescriptor> {
        self.procedures.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.procedures.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl TryFrom<Vec<ProcedureDescriptor>> for Protocol {
    type Error = ProtocolError;

    fn try_from(procedures: Vec<ProcedureDescriptor>) -> Result<Self> {
        Self::new(procedures)
    }
}

impl From<Protocol> for Vec<ProcedureDescriptor> {
    fn from(protocol: Protocol) -> Self {
        protocol.procedures
    }
}

impl<'a> IntoIterator for &'a Protocol {
    type Item = &'a ProcedureDescriptor;
    type IntoIter = std::slice::Iter<'a, ProcedureDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn move_descriptor() -> ProcedureDescriptor {
        ProcedureDescriptor::new("move")
            .with_required("x")
            .with_required("y")
            .with_optional("z", json!(0))
    }

    #[test]
    fn test_descriptor_wire_form() {
        let value = serde_json::to_value(move_descriptor()).unwrap();
        assert_eq!(value, json!({
            "procedure": "move",
            "required": [{"key": "x"}, {"key": "y"}],
            "optional": [{"key": "z", "default": 0}],
        }));
    }

    #[test]
    fn test_descriptor_accepts_name_alias() {
        let desc: ProcedureDescriptor = serde_json::from_value(json!({
            "name": "move",
            "required": [{"key": "x"}, {"key": "y"}],
            "optional": [{"key": "z", "default": 0}],
        })).unwrap();
        assert_eq!(desc, move_descriptor());
    }

    #[test]
    fn test_descriptor_requires_both_partitions() {
        let missing_optional = serde_json::from_value::<ProcedureDescriptor>(json!({
            "procedure": "no_args",
            "required": [],
        }));
        assert!(missing_optional.is_err());

        let missing_required = serde_json::from_value::<ProcedureDescriptor>(json!({
            "procedure": "no_args",
            "optional": [],
        }));
        assert!(missing_required.is_err());
    }

    #[test]
    fn test_arity_bounds() {
        let desc = move_descriptor();
        assert_eq!(desc.min_args(), 2);
        assert_eq!(desc.max_args(), 3);
        assert!(desc.is_required("x"));
        assert!(!desc.is_required("z"));
        assert_eq!(desc.optional_param("z").map(|p| &p.default), Some(&json!(0)));
        assert_eq!(desc.keys().collect::<Vec<_>>(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_duplicate_key_across_partitions_is_rejected() {
        let desc = ProcedureDescriptor::new("f").with_required("a").with_optional("a", Value::Null);
        assert_eq!(desc.validate(), Err(ProtocolError::DuplicateKey {
            procedure: "f".into(),
            key: "a".into(),
        }));
    }

    #[test]
    fn test_protocol_rejects_duplicate_names() {
        let err = Protocol::new(vec![move_descriptor(), move_descriptor()]).unwrap_err();
        assert_eq!(err, ProtocolError::DuplicateProcedure("move".into()));
    }

    #[test]
    fn test_protocol_rejects_empty_name_on_deserialize() {
        let result = serde_json::from_value::<Protocol>(json!([
            {"procedure": "", "required": [], "optional": []}
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_protocol_preserves_order() {
        let protocol = Protocol::new(vec![
            ProcedureDescriptor::new("b"),
            ProcedureDescriptor::new("a"),
            move_descriptor(),
        ]).unwrap();
        assert_eq!(protocol.names().collect::<Vec<_>>(), vec!["b", "a", "move"]);

        let value = serde_json::to_value(&protocol).unwrap();
        let back: Protocol = serde_json::from_value(value).unwrap();
        assert_eq!(back, protocol);
    }
}
