//! Values schema validation
//!
//! Templates may ship a `values.schema.json` describing the values they
//! accept. Only the subset of JSON Schema used by chart authors in practice
//! is supported: `type`, `properties`, `required`, `items`, `enum`, numeric
//! and length bounds, and `additionalProperties`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::values::ValueNode;
use crate::error::SchemaValidationError;

/// Root path used when reporting offending fields
const ROOT_PATH: &str = "values";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<TypeSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<AdditionalProperties>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    One(String),
    Many(Vec<String>),
}

impl TypeSpec {
    fn allows(&self, node: &ValueNode) -> bool {
        match self {
            TypeSpec::One(t) => type_matches(t, node),
            TypeSpec::Many(ts) => ts.iter().any(|t| type_matches(t, node)),
        }
    }

    fn describe(&self) -> String {
        match self {
            TypeSpec::One(t) => t.clone(),
            TypeSpec::Many(ts) => ts.join(" or "),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdditionalProperties {
    Allowed(bool),
    Schema(Box<Schema>),
}

fn type_matches(type_name: &str, node: &ValueNode) -> bool {
    match (type_name, node) {
        ("null", ValueNode::Null)
        | ("boolean", ValueNode::Bool(_))
        | ("integer", ValueNode::Integer(_))
        | ("number", ValueNode::Integer(_) | ValueNode::Float(_))
        | ("string", ValueNode::String(_))
        | ("array", ValueNode::Sequence(_))
        | ("object", ValueNode::Mapping(_)) => true,
        ("integer", ValueNode::Float(f)) => f.fract() == 0.0,
        _ => false,
    }
}

impl Schema {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Validate `values` and return every violation found
    pub fn validate(&self, values: &ValueNode) -> Result<(), Vec<SchemaValidationError>> {
        let mut errors = Vec::new();
        self.check(values, ROOT_PATH, &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn check(&self, node: &ValueNode, path: &str, errors: &mut Vec<SchemaValidationError>) {
        if let Some(type_) = &self.type_ {
            if !type_.allows(node) {
                errors.push(SchemaValidationError::new(
                    path,
                    format!("expected {}, found {}", type_.describe(), node.kind_name()),
                ));
                return;
            }
        }

        if let Some(allowed) = &self.enum_ {
            let json = node.to_json();
            if !allowed.contains(&json) {
                errors.push(SchemaValidationError::new(
                    path,
                    format!("value {json} is not one of the allowed values"),
                ));
            }
        }

        match node {
            ValueNode::Integer(_) | ValueNode::Float(_) => self.check_bounds(node, path, errors),
            ValueNode::String(s) => self.check_length(s, path, errors),
            ValueNode::Sequence(items) => {
                if let Some(item_schema) = &self.items {
                    for (i, item) in items.iter().enumerate() {
                        item_schema.check(item, &format!("{path}[{i}]"), errors);
                    }
                }
            }
            ValueNode::Mapping(map) => self.check_mapping(map, path, errors),
            ValueNode::Null | ValueNode::Bool(_) => {}
        }
    }

    fn check_bounds(&self, node: &ValueNode, path: &str, errors: &mut Vec<SchemaValidationError>) {
        let Some(n) = node.as_f64() else { return };
        if let Some(min) = self.minimum {
            if n < min {
                errors.push(SchemaValidationError::new(
                    path,
                    format!("must be greater than or equal to {min}"),
                ));
            }
        }
        if let Some(max) = self.maximum {
            if n > max {
                errors.push(SchemaValidationError::new(
                    path,
                    format!("must be less than or equal to {max}"),
                ));
            }
        }
    }

    fn check_length(&self, s: &str, path: &str, errors: &mut Vec<SchemaValidationError>) {
        let len = s.chars().count();
        if let Some(min) = self.min_length {
            if len < min {
                errors.push(SchemaValidationError::new(
                    path,
                    format!("must be at least {min} characters long"),
                ));
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                errors.push(SchemaValidationError::new(
                    path,
                    format!("must be at most {max} characters long"),
                ));
            }
        }
    }

    fn check_mapping(
        &self,
        map: &BTreeMap<String, ValueNode>,
        path: &str,
        errors: &mut Vec<SchemaValidationError>,
    ) {
        for key in &self.required {
            if !map.contains_key(key) {
                errors.push(SchemaValidationError::new(
                    format!("{path}.{key}"),
                    "required field is missing",
                ));
            }
        }

        for (key, value) in map {
            let child_path = format!("{path}.{key}");
            if let Some(prop) = self.properties.get(key) {
                prop.check(value, &child_path, errors);
                continue;
            }
            match &self.additional_properties {
                Some(AdditionalProperties::Allowed(false)) => {
                    errors.push(SchemaValidationError::new(
                        child_path,
                        "additional property is not allowed",
                    ));
                }
                Some(AdditionalProperties::Schema(schema)) => {
                    schema.check(value, &child_path, errors);
                }
                Some(AdditionalProperties::Allowed(true)) | None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(value: serde_json::Value) -> Schema {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_valid_document_passes() {
        let s = schema(json!({
            "type": "object",
            "required": ["replicas"],
            "properties": {
                "replicas": {"type": "integer", "minimum": 1},
                "image": {"type": "string"}
            }
        }));

        assert!(s
            .validate(&ValueNode::from(json!({"replicas": 3, "image": "nginx"})))
            .is_ok());
    }

    #[test]
    fn test_type_mismatch_names_field_path() {
        let s = schema(json!({
            "type": "object",
            "properties": {"service": {"type": "object", "properties": {"port": {"type": "integer"}}}}
        }));

        let errors = s
            .validate(&ValueNode::from(json!({"service": {"port": "eighty"}})))
            .unwrap_err();

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "values.service.port");
        assert!(errors[0].message.contains("expected integer"));
    }

    #[test]
    fn test_collects_every_violation() {
        let s = schema(json!({
            "type": "object",
            "required": ["name"],
            "additionalProperties": false,
            "properties": {"replicas": {"type": "integer", "maximum": 5}}
        }));

        let errors = s
            .validate(&ValueNode::from(json!({"replicas": 9, "extra": true})))
            .unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();

        assert_eq!(fields, vec!["values.name", "values.extra", "values.replicas"]);
    }

    #[test]
    fn test_sequence_items_report_index() {
        let s = schema(json!({
            "type": "object",
            "properties": {
                "ports": {"type": "array", "items": {"type": "object", "required": ["name"]}}
            }
        }));

        let errors = s
            .validate(&ValueNode::from(json!({"ports": [{"name": "http"}, {"port": 80}]})))
            .unwrap_err();

        assert_eq!(errors[0].field, "values.ports[1].name");
    }

    #[test]
    fn test_enum_and_type_list() {
        let s = schema(json!({
            "type": "object",
            "properties": {
                "pullPolicy": {"type": "string", "enum": ["Always", "IfNotPresent"]},
                "tag": {"type": ["string", "null"]}
            }
        }));

        assert!(s
            .validate(&ValueNode::from(json!({"pullPolicy": "Always", "tag": null})))
            .is_ok());
        let errors = s
            .validate(&ValueNode::from(json!({"pullPolicy": "Sometimes"})))
            .unwrap_err();
        assert_eq!(errors[0].field, "values.pullPolicy");
    }

    #[test]
    fn test_integral_float_counts_as_integer() {
        let s = schema(json!({"type": "integer"}));
        assert!(s.validate(&ValueNode::Float(2.0)).is_ok());
        assert!(s.validate(&ValueNode::Float(2.5)).is_err());
    }
}
