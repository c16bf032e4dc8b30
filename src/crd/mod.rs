//! Custom Resource Definitions for moduleops
//!
//! This module defines the Kubernetes CRDs users author (Module, TemplateStore,
//! TemplateAuthRule) and the types shared between them.

mod module;
mod template_store;
pub mod types;

#[cfg(test)]
mod tests;

use schemars::gen::SchemaGenerator;
use schemars::schema::{Schema, SchemaObject};

pub use module::{Module, ModuleKey, ModuleSpec, ModuleStatus, ModuleTemplateRef};
pub use template_store::{
    TemplateAuthRule, TemplateAuthRuleSpec, TemplateStore, TemplateStoreSpec,
    ICON_URL_ANNOTATION,
};
pub use types::*;

/// Schema for free-form documents such as Module values
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        extensions: [(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    })
}
