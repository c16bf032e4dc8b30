//! Cluster resource access for rendered manifests
//!
//! [`ClusterClient`] is the seam between the reconciler and the cluster API.
//! Ownership of applied objects is recorded on the objects themselves via the
//! [`MODULE_LABEL`]/[`MODULE_NAMESPACE_LABEL`] labels plus the
//! [`MODULE_NAME_ANNOTATION`] and [`CONTENT_HASH_ANNOTATION`] annotations.
//! Label values are capped at 63 characters, so the full Module name lives
//! in the annotation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    core::GroupVersionKind,
    discovery::{pinned_kind, ApiCapabilities, ApiResource, Scope},
    Client,
};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::crd::ModuleKey;
use crate::error::{Error, Result};
use crate::template::render::{split_api_version, ResourceId};

pub const MODULE_LABEL: &str = "moduleops.io/module";
pub const MODULE_NAMESPACE_LABEL: &str = "moduleops.io/module-namespace";
pub const MODULE_NAME_ANNOTATION: &str = "moduleops.io/module-name";
pub const CONTENT_HASH_ANNOTATION: &str = "moduleops.io/content-hash";

const MAX_LABEL_VALUE_LEN: usize = 63;
const LABEL_HASH_LEN: usize = 10;

const FIELD_MANAGER: &str = "moduleops";

/// `(apiVersion, kind)` pair
pub type KindRef = (String, String);

/// An object as it currently exists in the cluster
#[derive(Clone, Debug, PartialEq)]
pub struct LiveObject {
    pub id: ResourceId,
    pub resource_version: Option<String>,
    /// Value of [`CONTENT_HASH_ANNOTATION`] at the last apply
    pub content_hash: Option<String>,
    /// Module named by the ownership labels, if any
    pub owner: Option<ModuleKey>,
    pub body: serde_json::Value,
}

impl LiveObject {
    /// Build from a raw object body; `id` is taken from the body
    pub fn from_body(body: serde_json::Value) -> Option<Self> {
        let api_version = body.get("apiVersion")?.as_str()?.to_string();
        let kind = body.get("kind")?.as_str()?.to_string();
        let name = body.pointer("/metadata/name")?.as_str()?.to_string();
        let namespace = body
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Some(Self::with_id(
            ResourceId {
                api_version,
                kind,
                namespace,
                name,
            },
            body,
        ))
    }

    fn with_id(id: ResourceId, body: serde_json::Value) -> Self {
        let metadata = body.get("metadata");
        let field = |section: &str, key: &str| {
            metadata
                .and_then(|m| m.get(section))
                .and_then(|l| l.get(key))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let owner = match (field("labels", MODULE_NAMESPACE_LABEL), field("labels", MODULE_LABEL)) {
            (Some(namespace), Some(label)) => {
                let name = field("annotations", MODULE_NAME_ANNOTATION).unwrap_or(label);
                Some(ModuleKey::new(namespace, name))
            }
            _ => None,
        };
        let content_hash = field("annotations", CONTENT_HASH_ANNOTATION);
        let resource_version = metadata
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Self {
            id,
            resource_version,
            content_hash,
            owner,
            body,
        }
    }

    pub fn is_owned_by(&self, owner: &ModuleKey) -> bool {
        self.owner.as_ref() == Some(owner)
    }
}

/// Value of [`MODULE_LABEL`] for a Module name. Names too long for a label
/// are truncated and suffixed with a hash of the full name.
pub fn owner_label_value(name: &str) -> String {
    if name.len() <= MAX_LABEL_VALUE_LEN {
        return name.to_string();
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let keep = MAX_LABEL_VALUE_LEN - LABEL_HASH_LEN - 1;
    // Module names are DNS subdomains, so every byte is ASCII
    let prefix = name[..keep].trim_end_matches(['-', '.']);
    format!("{}-{}", prefix, &digest[..LABEL_HASH_LEN])
}

/// Label selector matching everything a Module owns
pub fn owner_selector(owner: &ModuleKey) -> String {
    format!(
        "{}={},{}={}",
        MODULE_LABEL,
        owner_label_value(&owner.name),
        MODULE_NAMESPACE_LABEL,
        owner.namespace
    )
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, id: &ResourceId) -> Result<Option<LiveObject>>;

    /// Whether the cluster serves `kind` per namespace; `None` if it is not served
    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<Option<bool>>;

    /// Objects of the given kinds carrying `owner`'s labels, in any namespace
    async fn list_owned(&self, kinds: &[KindRef], owner: &ModuleKey) -> Result<Vec<LiveObject>>;

    /// Fails with [`Error::ApplyConflict`] if the object already exists
    async fn create(&self, id: &ResourceId, body: &serde_json::Value) -> Result<()>;

    /// Replace the object; `body.metadata.resourceVersion` guards against
    /// concurrent writers and a mismatch is an [`Error::ApplyConflict`]
    async fn update(&self, id: &ResourceId, body: &serde_json::Value) -> Result<()>;

    /// Deleting an object that no longer exists is not an error
    async fn delete(&self, id: &ResourceId) -> Result<()>;
}

/// [`ClusterClient`] over the Kubernetes API using dynamic objects
pub struct KubeClusterClient {
    client: Client,
    discovery: Mutex<HashMap<KindRef, (ApiResource, ApiCapabilities)>>,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a kind through discovery. Only successful lookups are cached,
    /// so a CRD installed later is picked up on the next attempt.
    async fn resolve_kind(&self, api_version: &str, kind: &str) -> kube::Result<(ApiResource, ApiCapabilities)> {
        let key = (api_version.to_string(), kind.to_string());
        if let Some(found) = self.cached(&key) {
            return Ok(found);
        }
        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let resolved = pinned_kind(&self.client, &gvk).await?;
        debug!("Discovered {}/{} as {}", api_version, kind, resolved.0.plural);
        self.discovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, resolved.clone());
        Ok(resolved)
    }

    fn cached(&self, key: &KindRef) -> Option<(ApiResource, ApiCapabilities)> {
        self.discovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Api for `id` together with `id` normalized to the kind's discovered scope
    async fn api_for(&self, id: &ResourceId) -> Result<(Api<DynamicObject>, ResourceId)> {
        let (resource, caps) = self.resolve_kind(&id.api_version, &id.kind).await?;
        let id = scoped_id(id.clone(), &caps.scope);
        let api = match &id.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        Ok((api, id))
    }
}

/// Cluster-scoped objects have no namespace, whatever the manifest said
fn scoped_id(mut id: ResourceId, scope: &Scope) -> ResourceId {
    if matches!(scope, Scope::Cluster) {
        id.namespace = None;
    }
    id
}

fn to_dynamic(id: &ResourceId, body: &serde_json::Value) -> Result<DynamicObject> {
    let mut obj: DynamicObject = serde_json::from_value(body.clone())?;
    obj.metadata.namespace = id.namespace.clone();
    Ok(obj)
}

fn conflict(id: &ResourceId, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 409 => Error::ApplyConflict {
            resource: id.to_string(),
            message: resp.message,
        },
        other => Error::KubeError(other),
    }
}

fn is_unserved(err: &kube::Error) -> bool {
    match err {
        kube::Error::Discovery(_) => true,
        kube::Error::Api(resp) => resp.code == 404,
        _ => false,
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, id: &ResourceId) -> Result<Option<LiveObject>> {
        let (api, id) = match self.api_for(id).await {
            Ok(found) => found,
            Err(Error::KubeError(e)) if is_unserved(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let found = api.get_opt(&id.name).await?;
        match found {
            Some(obj) => Ok(Some(LiveObject::with_id(id, serde_json::to_value(&obj)?))),
            None => Ok(None),
        }
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<Option<bool>> {
        match self.resolve_kind(api_version, kind).await {
            Ok((_, caps)) => Ok(Some(matches!(caps.scope, Scope::Namespaced))),
            Err(e) if is_unserved(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, kinds), fields(module = %owner))]
    async fn list_owned(&self, kinds: &[KindRef], owner: &ModuleKey) -> Result<Vec<LiveObject>> {
        let params = ListParams::default().labels(&owner_selector(owner));
        let mut owned = Vec::new();
        for (api_version, kind) in kinds {
            let (resource, caps) = match self.resolve_kind(api_version, kind).await {
                Ok(found) => found,
                Err(e) if is_unserved(&e) => {
                    debug!("Kind {}/{} is not served, skipping", api_version, kind);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
            for obj in api.list(&params).await?.items {
                let id = scoped_id(
                    ResourceId {
                        api_version: api_version.clone(),
                        kind: kind.clone(),
                        namespace: obj.metadata.namespace.clone(),
                        name: obj.metadata.name.clone().unwrap_or_default(),
                    },
                    &caps.scope,
                );
                owned.push(LiveObject::with_id(id, serde_json::to_value(&obj)?));
            }
        }
        Ok(owned)
    }

    async fn create(&self, id: &ResourceId, body: &serde_json::Value) -> Result<()> {
        let (api, id) = self.api_for(id).await?;
        api.create(&PostParams::default(), &to_dynamic(&id, body)?)
            .await
            .map_err(|e| conflict(&id, e))?;
        debug!("Created {}", id);
        Ok(())
    }

    async fn update(&self, id: &ResourceId, body: &serde_json::Value) -> Result<()> {
        let (api, id) = self.api_for(id).await?;
        api.patch(
            &id.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(to_dynamic(&id, body)?),
        )
        .await
        .map_err(|e| conflict(&id, e))?;
        debug!("Updated {}", id);
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let (api, id) = self.api_for(id).await?;
        match api.delete(&id.name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!("Deleted {}", id);
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
