//! Access to Module and TemplateStore objects
//!
//! [`ModuleStore`] covers everything the reconciler reads or writes on the
//! Module side: the Module itself, referenced TemplateStores, status,
//! finalizers and Events.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    Client, Resource, ResourceExt,
};
use tracing::debug;

use super::finalizers;
use crate::crd::{Module, ModuleKey, ModuleStatus, ModuleTemplateRef, TemplateStore, TemplateStoreSpec};
use crate::error::{Error, Result};

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

#[async_trait]
pub trait ModuleStore: Send + Sync {
    async fn get_module(&self, key: &ModuleKey) -> Result<Option<Module>>;

    async fn get_template_store(&self, namespace: &str, name: &str) -> Result<Option<TemplateStoreSpec>>;

    async fn update_status(&self, key: &ModuleKey, status: &ModuleStatus) -> Result<()>;

    async fn add_finalizer(&self, module: &Module) -> Result<()>;

    async fn remove_finalizer(&self, module: &Module) -> Result<()>;

    async fn emit_event(&self, module: &Module, event_type: &str, reason: &str, message: &str) -> Result<()>;

    /// Replace the template reference and values of a Module's spec
    async fn patch_spec(
        &self,
        key: &ModuleKey,
        template: &ModuleTemplateRef,
        values: &serde_json::Value,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeModuleStore {
    client: Client,
}

impl KubeModuleStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn modules(&self, namespace: &str) -> Api<Module> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ModuleStore for KubeModuleStore {
    async fn get_module(&self, key: &ModuleKey) -> Result<Option<Module>> {
        Ok(self.modules(&key.namespace).get_opt(&key.name).await?)
    }

    async fn get_template_store(&self, namespace: &str, name: &str) -> Result<Option<TemplateStoreSpec>> {
        let api: Api<TemplateStore> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|s| s.spec))
    }

    async fn update_status(&self, key: &ModuleKey, status: &ModuleStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.modules(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::apply("moduleops"),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(Error::KubeError)?;
        debug!("Updated status of {} to {}", key, status.phase);
        Ok(())
    }

    async fn add_finalizer(&self, module: &Module) -> Result<()> {
        finalizers::add_finalizer(&self.client, module).await
    }

    async fn remove_finalizer(&self, module: &Module) -> Result<()> {
        finalizers::remove_finalizer(&self.client, module).await
    }

    async fn emit_event(&self, module: &Module, event_type: &str, reason: &str, message: &str) -> Result<()> {
        let namespace = module.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-event-", module.name_any())),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: module.object_ref(&()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        events
            .create(&PostParams::default(), &event)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn patch_spec(
        &self,
        key: &ModuleKey,
        template: &ModuleTemplateRef,
        values: &serde_json::Value,
    ) -> Result<()> {
        // Replace rather than merge-patch so keys dropped from values disappear
        let api = self.modules(&key.namespace);
        let mut module = api.get(&key.name).await?;
        module.spec.template = template.clone();
        module.spec.values = values.clone();
        api.replace(&key.name, &PostParams::default(), &module)
            .await
            .map_err(|e| match e {
                kube::Error::Api(resp) if resp.code == 409 => Error::ApplyConflict {
                    resource: format!("Module {key}"),
                    message: resp.message,
                },
                other => Error::KubeError(other),
            })?;
        Ok(())
    }
}
