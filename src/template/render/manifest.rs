//! Rendered manifest types and content hashing

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Identity of a cluster resource: one object per identity per manifest
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// One concrete resource produced by rendering
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub body: serde_json::Value,
    /// SHA-256 of the canonical body
    pub content_hash: String,
    /// Apply priority; lower values are applied first
    pub priority: u32,
}

impl ResourceDescriptor {
    pub fn id(&self) -> ResourceId {
        ResourceId {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// The same resource placed at cluster scope
    pub fn without_namespace(mut self) -> Self {
        if let Some(meta) = self.body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("namespace");
        }
        self.namespace = None;
        self.content_hash = content_hash(&self.body);
        self
    }

    /// `(group, version)` split of `apiVersion`; the core group is empty
    pub fn group_version(&self) -> (&str, &str) {
        split_api_version(&self.api_version)
    }
}

pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Ordered output of a render. Never mutated after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedManifest {
    pub resources: Vec<ResourceDescriptor>,
    pub content_hash: String,
}

impl RenderedManifest {
    /// Build a manifest from resources already in apply order
    pub fn new(resources: Vec<ResourceDescriptor>) -> Self {
        let mut hasher = Sha256::new();
        for resource in &resources {
            hasher.update(resource.content_hash.as_bytes());
            hasher.update(b"\n");
        }
        Self {
            resources,
            content_hash: hex::encode(hasher.finalize()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Multi-document YAML, as committed to GitOps repositories and kept in history
    pub fn to_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for resource in &self.resources {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(&resource.body)?);
        }
        Ok(out)
    }
}

/// JSON with object keys sorted at every level
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn content_hash(value: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let v = json!({"b": {"z": 1, "a": [{"y": true, "x": null}]}, "a": "s"});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":"s","b":{"a":[{"x":null,"y":true}],"z":1}}"#
        );
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"x": 1, "y": 3})));
    }

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("v1"), ("", "v1"));
    }

    #[test]
    fn test_resource_id_display() {
        let id = ResourceId {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: Some("web".into()),
            name: "api".into(),
        };
        assert_eq!(id.to_string(), "apps/v1/Deployment web/api");
    }
}
