//! Diff and apply of rendered manifests
//!
//! [`plan`] is pure: it compares the desired manifest with the live objects
//! and decides what to create, update and delete. [`execute`] carries a plan
//! out against a [`ClusterClient`], stamping ownership metadata on every
//! object it writes.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

use super::cluster::{
    owner_label_value, ClusterClient, KindRef, LiveObject, CONTENT_HASH_ANNOTATION, MODULE_LABEL,
    MODULE_NAMESPACE_LABEL, MODULE_NAME_ANNOTATION,
};
use crate::crd::ModuleKey;
use crate::error::{Error, Result};
use crate::template::render::{KindRegistry, RenderedManifest, ResourceDescriptor, ResourceId};

#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    Create(ResourceDescriptor),
    Update {
        desired: ResourceDescriptor,
        resource_version: Option<String>,
        /// The object existed without ownership labels and is taken over
        adopted: bool,
    },
    Delete(LiveObject),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyPlan {
    /// Creates and updates in manifest order, then deletes in reverse priority order
    pub steps: Vec<Step>,
    pub unchanged: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl PlanSummary {
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted, {} unchanged",
            self.created, self.updated, self.deleted, self.unchanged
        )
    }
}

impl ApplyPlan {
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            unchanged: self.unchanged,
            ..Default::default()
        };
        for step in &self.steps {
            match step {
                Step::Create(_) => summary.created += 1,
                Step::Update { .. } => summary.updated += 1,
                Step::Delete(_) => summary.deleted += 1,
            }
        }
        summary
    }
}

/// Kinds appearing in any of the given manifests, used to list owned objects
pub fn manifest_kinds<'a>(manifests: impl IntoIterator<Item = &'a RenderedManifest>) -> Vec<KindRef> {
    manifests
        .into_iter()
        .flat_map(|m| m.resources.iter())
        .map(|r| (r.api_version.clone(), r.kind.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Compare `desired` with `live` for `owner`.
///
/// `live` holds the objects owned by `owner` plus any object sharing an
/// identity with a desired resource. An object owned by a different Module
/// is never touched and fails the plan.
pub fn plan(
    desired: &RenderedManifest,
    live: &[LiveObject],
    owner: &ModuleKey,
    kinds: &KindRegistry,
) -> Result<ApplyPlan> {
    let live_by_id: HashMap<&ResourceId, &LiveObject> = live.iter().map(|o| (&o.id, o)).collect();
    let mut plan = ApplyPlan::default();
    let mut wanted = HashSet::new();

    for resource in &desired.resources {
        let id = resource.id();
        match live_by_id.get(&id) {
            None => plan.steps.push(Step::Create(resource.clone())),
            Some(obj) => {
                if let Some(other) = obj.owner.as_ref().filter(|o| *o != owner) {
                    return Err(Error::ValidationError(format!(
                        "{id} is already managed by Module {other}"
                    )));
                }
                if obj.owner.is_some() && obj.content_hash.as_deref() == Some(resource.content_hash.as_str()) {
                    plan.unchanged += 1;
                } else {
                    plan.steps.push(Step::Update {
                        desired: resource.clone(),
                        resource_version: obj.resource_version.clone(),
                        adopted: obj.owner.is_none(),
                    });
                }
            }
        }
        wanted.insert(id);
    }

    let mut stale: Vec<&LiveObject> = live
        .iter()
        .filter(|o| o.is_owned_by(owner) && !wanted.contains(&o.id))
        .collect();
    stale.sort_by(|a, b| {
        (kinds.priority(&b.id.kind), &b.id).cmp(&(kinds.priority(&a.id.kind), &a.id))
    });
    plan.steps
        .extend(stale.into_iter().map(|o| Step::Delete(o.clone())));

    Ok(plan)
}

/// Plan that removes everything `owner` still owns
pub fn cleanup_plan(live: &[LiveObject], owner: &ModuleKey, kinds: &KindRegistry) -> ApplyPlan {
    let empty = RenderedManifest::new(Vec::new());
    // An empty manifest cannot conflict with anything
    plan(&empty, live, owner, kinds).unwrap_or_default()
}

/// Copy of `body` carrying ownership labels, the content hash annotation and,
/// for updates, the observed resourceVersion
pub fn stamp_ownership(
    body: &Value,
    owner: &ModuleKey,
    content_hash: &str,
    resource_version: Option<&str>,
) -> Value {
    let mut body = body.clone();
    if !body.get("metadata").map(Value::is_object).unwrap_or(false) {
        body["metadata"] = Value::Object(Default::default());
    }
    let metadata = &mut body["metadata"];
    let label = owner_label_value(&owner.name);
    for (field, key, value) in [
        ("labels", MODULE_LABEL, label.as_str()),
        ("labels", MODULE_NAMESPACE_LABEL, owner.namespace.as_str()),
        ("annotations", MODULE_NAME_ANNOTATION, owner.name.as_str()),
        ("annotations", CONTENT_HASH_ANNOTATION, content_hash),
    ] {
        if !metadata.get(field).map(Value::is_object).unwrap_or(false) {
            metadata[field] = Value::Object(Default::default());
        }
        metadata[field][key] = Value::String(value.to_string());
    }
    if let Some(rv) = resource_version {
        metadata["resourceVersion"] = Value::String(rv.to_string());
    }
    body
}

#[instrument(skip(cluster, plan), fields(module = %owner))]
pub async fn execute(cluster: &dyn ClusterClient, plan: &ApplyPlan, owner: &ModuleKey) -> Result<PlanSummary> {
    for step in &plan.steps {
        match step {
            Step::Create(desired) => {
                let body = stamp_ownership(&desired.body, owner, &desired.content_hash, None);
                cluster.create(&desired.id(), &body).await?;
            }
            Step::Update {
                desired,
                resource_version,
                adopted,
            } => {
                if *adopted {
                    info!("Adopting existing {}", desired.id());
                }
                let body = stamp_ownership(
                    &desired.body,
                    owner,
                    &desired.content_hash,
                    resource_version.as_deref(),
                );
                cluster.update(&desired.id(), &body).await?;
            }
            Step::Delete(obj) => cluster.delete(&obj.id).await?,
        }
    }
    let summary = plan.summary();
    info!("Applied plan: {}", summary);
    Ok(summary)
}
