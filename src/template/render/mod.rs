//! Rendering of templates into concrete resource manifests
//!
//! [`Renderer::render`] is a pure function of (Template, values, target):
//! merge user values over defaults, validate against the template schema,
//! execute every template file, split the output into resource documents,
//! stamp namespaces, normalize, order and hash. Identical inputs always yield
//! a byte-identical [`RenderedManifest`].

mod filters;
pub mod kinds;
mod manifest;

use std::collections::HashSet;

use minijinja::{context, Environment, UndefinedBehavior, Value};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::values::ValueNode;
use super::Template;
use crate::error::{Error, Result};

pub use kinds::{KindRegistry, ResourceKind, Scope, UNKNOWN_PRIORITY};
pub use manifest::{
    canonical_json, content_hash, split_api_version, RenderedManifest, ResourceDescriptor,
    ResourceId,
};

/// Where rendered resources go
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    /// Release name exposed to templates, normally the Module name
    pub module_name: String,
    /// Namespace stamped on every namespaced resource
    pub namespace: String,
}

#[derive(Clone, Debug)]
pub struct Renderer {
    kinds: KindRegistry,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(KindRegistry::builtin())
    }
}

impl Renderer {
    pub fn new(kinds: KindRegistry) -> Self {
        Self { kinds }
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    #[instrument(skip_all, fields(template = %template.reference, namespace = %target.namespace))]
    pub fn render(&self, template: &Template, values: &ValueNode, target: &RenderTarget) -> Result<RenderedManifest> {
        let merged = template.defaults.merged_with(values);
        if let Some(schema) = &template.schema {
            schema.validate(&merged).map_err(Error::SchemaValidationError)?;
        }

        let env = self.environment(template)?;
        let ctx = context! {
            Values => Value::from_serialize(&merged),
            Release => context! {
                Name => target.module_name.as_str(),
                Namespace => target.namespace.as_str(),
            },
            Template => context! {
                Name => template.name.as_str(),
                Version => template.version.as_str(),
            },
        };

        let mut resources = Vec::new();
        for (path, _) in template.renderable_files() {
            let rendered = env
                .get_template(path)
                .and_then(|t| t.render(&ctx))
                .map_err(|e| template_error(path, &e))?;
            for body in split_documents(path, &rendered)? {
                resources.push(self.describe(path, body, target)?);
            }
        }

        resources.sort_by(|a, b| {
            (a.priority, &a.kind, &a.namespace, &a.name).cmp(&(b.priority, &b.kind, &b.namespace, &b.name))
        });
        let mut seen = HashSet::new();
        for resource in &resources {
            if !seen.insert(resource.id()) {
                return Err(Error::render(
                    template.reference.to_string(),
                    format!("resource {} is rendered more than once", resource.id()),
                ));
            }
        }

        let manifest = RenderedManifest::new(resources);
        debug!(
            "Rendered {} resources, hash {}",
            manifest.resources.len(),
            manifest.content_hash
        );
        Ok(manifest)
    }

    /// Parse a manifest snapshot (as produced by [`RenderedManifest::to_yaml`])
    pub fn parse_manifest(&self, yaml: &str) -> Result<RenderedManifest> {
        let mut resources = Vec::new();
        for body in split_documents("manifest", yaml)? {
            let (api_version, kind, name) = identity("manifest", &body)?;
            let namespace = body
                .pointer("/metadata/namespace")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            resources.push(ResourceDescriptor {
                priority: self.kinds.priority(&kind),
                content_hash: self.kinds.fingerprint(&kind, &body),
                api_version,
                kind,
                namespace,
                name,
                body,
            });
        }
        Ok(RenderedManifest::new(resources))
    }

    fn environment<'a>(&self, template: &'a Template) -> Result<Environment<'a>> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_keep_trailing_newline(true);
        env.add_filter("toyaml", filters::toyaml);
        env.add_filter("nindent", filters::nindent);
        env.add_filter("b64enc", filters::b64enc);
        env.add_filter("b64dec", filters::b64dec);
        env.add_filter("quote", filters::quote);
        env.add_filter("required", filters::required);

        // Helpers must be registered too so templates can import them
        for (path, source) in &template.files {
            env.add_template(path, source)
                .map_err(|e| template_error(path, &e))?;
        }
        Ok(env)
    }

    fn describe(&self, path: &str, mut body: serde_json::Value, target: &RenderTarget) -> Result<ResourceDescriptor> {
        let (api_version, kind, name) = identity(path, &body)?;

        let namespace = match self.kinds.scope(&kind) {
            Scope::Cluster => {
                if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.remove("namespace");
                }
                None
            }
            Scope::Namespaced => {
                if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.insert(
                        "namespace".to_string(),
                        serde_json::Value::String(target.namespace.clone()),
                    );
                }
                Some(target.namespace.clone())
            }
        };

        self.kinds
            .normalize(&kind, &mut body)
            .map_err(|msg| Error::render(path, format!("{kind} {name}: {msg}")))?;

        Ok(ResourceDescriptor {
            priority: self.kinds.priority(&kind),
            content_hash: self.kinds.fingerprint(&kind, &body),
            api_version,
            kind,
            namespace,
            name,
            body,
        })
    }
}

fn template_error(path: &str, e: &minijinja::Error) -> Error {
    let file = e.name().unwrap_or(path);
    match e.line() {
        Some(line) => Error::render(file, format!("line {line}: {e}")),
        None => Error::render(file, e),
    }
}

/// Split rendered text into YAML documents, dropping empty ones
fn split_documents(path: &str, text: &str) -> Result<Vec<serde_json::Value>> {
    let mut docs = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_json::Value::deserialize(document)
            .map_err(|e| Error::render(path, format!("document {index}: {e}")))?;
        match value {
            serde_json::Value::Null => continue,
            serde_json::Value::Object(_) => docs.push(value),
            other => {
                return Err(Error::render(
                    path,
                    format!("document {index} is not a mapping: {other}"),
                ))
            }
        }
    }
    Ok(docs)
}

/// apiVersion, kind and metadata.name of a resource body
fn identity(path: &str, body: &serde_json::Value) -> Result<(String, String, String)> {
    let field = |pointer: &str| {
        body.pointer(pointer)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::render(path, format!("resource is missing {}", &pointer[1..].replace('/', "."))))
    };
    Ok((field("/apiVersion")?, field("/kind")?, field("/metadata/name")?))
}
