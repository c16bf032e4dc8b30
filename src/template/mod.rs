//! Template resolution, caching and rendering
//!
//! A [`Template`] is the canonical, source-independent representation of a
//! versioned parameterized resource set. Fetchers (git, Helm repository, OCI
//! registry) produce raw files which [`Template::from_source`] normalizes;
//! the [`TemplateRepository`] caches the result and the [`Renderer`] turns it
//! into a [`RenderedManifest`].

pub mod cache;
pub mod render;
pub mod repository;
pub mod schema;
pub mod source;
pub mod values;

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::crd::TemplateRef;
use crate::error::{Error, Result};

pub use cache::{CacheStats, TemplateCache};
pub use render::{RenderTarget, RenderedManifest, Renderer, ResourceDescriptor};
pub use repository::TemplateRepository;
pub use schema::Schema;
pub use source::{TemplateFetcher, TemplateSource};
pub use values::ValueNode;

const CHART_FILE: &str = "Chart.yaml";
const VALUES_FILE: &str = "values.yaml";
const SCHEMA_FILE: &str = "values.schema.json";
const TEMPLATES_DIR: &str = "templates/";
const NOTES_FILE: &str = "NOTES.txt";

/// Metadata read from `Chart.yaml`
#[derive(Debug, Default, Deserialize)]
struct ChartMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
}

/// Resolved content of a [`TemplateRef`]
///
/// Never mutated once built; a new version of a template is a new value.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    pub reference: TemplateRef,
    pub name: String,
    pub version: String,
    /// Source revision the content was read from (commit SHA or digest)
    pub revision: String,
    pub schema: Option<Schema>,
    pub defaults: ValueNode,
    /// Template files keyed by path relative to the template root
    pub files: BTreeMap<String, String>,
}

impl Template {
    /// Normalize raw fetched files into a Template
    pub fn from_source(reference: &TemplateRef, source: TemplateSource) -> Result<Self> {
        let label = reference.to_string();
        let mut files = source.files;

        let metadata = match files.remove(CHART_FILE) {
            Some(raw) => serde_yaml::from_slice::<ChartMetadata>(&raw)
                .map_err(|e| Error::invalid_template(&label, format!("{CHART_FILE}: {e}")))?,
            None => ChartMetadata::default(),
        };

        let defaults = match files.remove(VALUES_FILE) {
            Some(raw) if !raw.iter().all(u8::is_ascii_whitespace) => {
                let doc: serde_json::Value = serde_yaml::from_slice(&raw)
                    .map_err(|e| Error::invalid_template(&label, format!("{VALUES_FILE}: {e}")))?;
                match ValueNode::from(doc) {
                    ValueNode::Null => ValueNode::empty_mapping(),
                    node @ ValueNode::Mapping(_) => node,
                    other => {
                        return Err(Error::invalid_template(
                            &label,
                            format!("{VALUES_FILE} must be a mapping, found {}", other.kind_name()),
                        ))
                    }
                }
            }
            _ => ValueNode::empty_mapping(),
        };

        let schema = files
            .remove(SCHEMA_FILE)
            .map(|raw| Schema::from_json(&raw))
            .transpose()
            .map_err(|e| Error::invalid_template(&label, format!("{SCHEMA_FILE}: {e}")))?;

        let mut templates = BTreeMap::new();
        for (path, raw) in files {
            if !path.starts_with(TEMPLATES_DIR) {
                continue;
            }
            let text = String::from_utf8(raw)
                .map_err(|_| Error::invalid_template(&label, format!("{path} is not valid UTF-8")))?;
            templates.insert(path, text);
        }

        if !templates.keys().any(|p| is_renderable(p)) {
            return Err(Error::invalid_template(
                &label,
                format!("no renderable files under {TEMPLATES_DIR}"),
            ));
        }

        let name = if metadata.name.is_empty() {
            default_name(reference)
        } else {
            metadata.name
        };
        let version = if metadata.version.is_empty() {
            reference.version.clone()
        } else {
            metadata.version
        };

        Ok(Self {
            reference: reference.clone(),
            name,
            version,
            revision: source.revision,
            schema,
            defaults,
            files: templates,
        })
    }

    /// Files rendered into resources, in path order
    pub fn renderable_files(&self) -> impl Iterator<Item = (&String, &String)> {
        self.files.iter().filter(|(path, _)| is_renderable(path))
    }
}

/// Helpers (`_helpers.tpl`) and `NOTES.txt` are never rendered on their own
fn is_renderable(path: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    !file_name.starts_with('_') && file_name != NOTES_FILE
}

fn default_name(reference: &TemplateRef) -> String {
    let from_path = reference.path.trim_matches('/').rsplit('/').next().unwrap_or("");
    if !from_path.is_empty() {
        return from_path.to_string();
    }
    reference
        .source_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or("template")
        .to_string()
}
