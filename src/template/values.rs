//! Values documents as an explicit tree
//!
//! User values and template defaults are arbitrary structured documents.
//! [`ValueNode`] is a closed tagged union over the node kinds such documents
//! can contain, so merging and schema validation are total functions over it.
//! Mappings are ordered (`BTreeMap`), which keeps rendering deterministic.

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

#[derive(Clone, Debug, Default, PartialEq)]
pub enum ValueNode {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Sequence(Vec<ValueNode>),
    Mapping(BTreeMap<String, ValueNode>),
}

impl ValueNode {
    pub fn empty_mapping() -> Self {
        ValueNode::Mapping(BTreeMap::new())
    }

    /// Name of the node kind, matching JSON Schema type names
    pub fn kind_name(&self) -> &'static str {
        match self {
            ValueNode::Null => "null",
            ValueNode::Bool(_) => "boolean",
            ValueNode::Integer(_) => "integer",
            ValueNode::Float(_) => "number",
            ValueNode::String(_) => "string",
            ValueNode::Sequence(_) => "array",
            ValueNode::Mapping(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ValueNode::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ValueNode::Integer(i) => Some(*i as f64),
            ValueNode::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Look up a dotted path such as `service.port`
    pub fn get_path(&self, path: &str) -> Option<&ValueNode> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |node, segment| match node {
                ValueNode::Mapping(map) => map.get(segment),
                _ => None,
            })
    }

    /// Merge `overrides` over `self`, returning the combined document.
    ///
    /// Mappings merge recursively with `overrides` taking precedence.
    /// Sequences and scalars are replaced wholesale. An explicit `null` in
    /// `overrides` removes the key from the result.
    pub fn merged_with(&self, overrides: &ValueNode) -> ValueNode {
        match (self, overrides) {
            (ValueNode::Mapping(base), ValueNode::Mapping(over)) => {
                let mut out = base.clone();
                for (key, value) in over {
                    match (value, out.get(key)) {
                        (ValueNode::Null, _) => {
                            out.remove(key);
                        }
                        (ValueNode::Mapping(_), Some(existing @ ValueNode::Mapping(_))) => {
                            let merged = existing.merged_with(value);
                            out.insert(key.clone(), merged);
                        }
                        _ => {
                            out.insert(key.clone(), value.clone());
                        }
                    }
                }
                ValueNode::Mapping(out)
            }
            (base, ValueNode::Null) => base.clone(),
            (_, over) => over.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ValueNode::Null => serde_json::Value::Null,
            ValueNode::Bool(b) => serde_json::Value::Bool(*b),
            ValueNode::Integer(i) => serde_json::Value::from(*i),
            ValueNode::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueNode::String(s) => serde_json::Value::String(s.clone()),
            ValueNode::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(ValueNode::to_json).collect())
            }
            ValueNode::Mapping(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<&serde_json::Value> for ValueNode {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ValueNode::Null,
            serde_json::Value::Bool(b) => ValueNode::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ValueNode::Integer(i),
                None => ValueNode::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => ValueNode::String(s.clone()),
            serde_json::Value::Array(items) => {
                ValueNode::Sequence(items.iter().map(ValueNode::from).collect())
            }
            serde_json::Value::Object(map) => ValueNode::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), ValueNode::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for ValueNode {
    fn from(value: serde_json::Value) -> Self {
        ValueNode::from(&value)
    }
}

impl Serialize for ValueNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ValueNode::Null => serializer.serialize_unit(),
            ValueNode::Bool(b) => serializer.serialize_bool(*b),
            ValueNode::Integer(i) => serializer.serialize_i64(*i),
            ValueNode::Float(f) => serializer.serialize_f64(*f),
            ValueNode::String(s) => serializer.serialize_str(s),
            ValueNode::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            ValueNode::Mapping(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}
