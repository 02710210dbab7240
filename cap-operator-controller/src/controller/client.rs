// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::collections::BTreeMap;
use std::fmt::Debug;
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::{api::core::v1::{Namespace, ObjectReference}, NamespaceResourceScope};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::ApiResource,
    runtime::watcher,
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;

use crate::controller::utils::FIELD_MANAGER;
use crate::crd::ProvisioningStatus;
use crate::error::{ControllerError, Result};

/// Typed, namespaced Kubernetes object the client can manage
pub trait NamespacedObject:
    Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Send
        + Sync
        + 'static
{}

impl<T> NamespacedObject for T
where
    T: Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Send
        + Sync
        + 'static
{}

/// Successive states of a watched object, `None` while it does not exist
pub type ObjectStream<K> = BoxStream<'static, Result<Option<K>>>;

/// Status of an owning resource together with the version it was read at
#[derive(Debug, Clone, Default)]
pub struct VersionedStatus {
    pub status: Option<ProvisioningStatus>,
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
}

/// The operations the provisioning core needs from the cluster.
#[async_trait]
pub trait ResourceClient: Send + Sync + 'static {
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects carrying all of `labels`, across every namespace when `namespace` is None
    async fn list<K: NamespacedObject>(&self, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Vec<K>>;

    /// Create an object, failing with `AlreadyExists` when the name is taken
    async fn create<K: NamespacedObject>(&self, object: &K) -> Result<K>;

    /// Create or replace an object through server-side apply
    async fn apply<K: NamespacedObject>(&self, object: &K) -> Result<K>;

    /// Delete an object, absent objects are not an error
    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<()>;

    async fn watch<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<ObjectStream<K>>;

    /// Read the provisioning status of any owning resource, `None` when the resource is gone
    async fn get_status(&self, target: &ObjectReference) -> Result<Option<VersionedStatus>>;

    /// Write the provisioning status of an owning resource. When `resource_version` is given the
    /// write fails with `Conflict` if the resource changed since it was read.
    async fn patch_status(&self, target: &ObjectReference, status: &ProvisioningStatus, resource_version: Option<&str>) -> Result<()>;

    async fn list_namespaces(&self) -> Result<Vec<String>>;
}

/// Format a label map as a Kubernetes label selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Resolve the dynamic API resource of an object reference
pub fn api_resource(target: &ObjectReference) -> Result<ApiResource> {
    let api_version = target.api_version.as_deref()
        .ok_or(ControllerError::MissingObjectKeyError("Expected the owning resource to have an apiVersion"))?;
    let kind = target.kind.as_deref()
        .ok_or(ControllerError::MissingObjectKeyError("Expected the owning resource to have a kind"))?;
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };

    Ok(ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind)))
}

fn namespace_of<K: NamespacedObject>(object: &K) -> Result<String> {
    object.namespace().ok_or(ControllerError::MissingObjectKeyError("Expected object to be namespaced via metadata.namespace"))
}

fn target_key(target: &ObjectReference) -> Result<(&str, &str)> {
    let namespace = target.namespace.as_deref()
        .ok_or(ControllerError::MissingObjectKeyError("Expected the owning resource to be namespaced"))?;
    let name = target.name.as_deref()
        .ok_or(ControllerError::MissingObjectKeyError("Expected the owning resource to have a name"))?;
    Ok((namespace, name))
}

/// ResourceClient backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, target: &ObjectReference) -> Result<(Api<DynamicObject>, String)> {
        let resource = api_resource(target)?;
        let (namespace, name) = target_key(target)?;
        Ok((Api::namespaced_with(self.client.clone(), namespace, &resource), name.to_string()))
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Api::<K>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(ControllerError::from_kube)
    }

    async fn list<K: NamespacedObject>(&self, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let api = match namespace {
            Some(namespace) => Api::<K>::namespaced(self.client.clone(), namespace),
            None => Api::<K>::all(self.client.clone()),
        };

        api.list(&ListParams::default().labels(&label_selector(labels)))
            .await
            .map(|list| list.items)
            .map_err(ControllerError::from_kube)
    }

    async fn create<K: NamespacedObject>(&self, object: &K) -> Result<K> {
        Api::<K>::namespaced(self.client.clone(), &namespace_of(object)?)
            .create(&PostParams::default(), object)
            .await
            .map_err(ControllerError::from_kube)
    }

    async fn apply<K: NamespacedObject>(&self, object: &K) -> Result<K> {
        Api::<K>::namespaced(self.client.clone(), &namespace_of(object)?)
            .patch(&object.name_any(), &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(object))
            .await
            .map_err(ControllerError::from_kube)
    }

    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<()> {
        match Api::<K>::namespaced(self.client.clone(), namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(ControllerError::from_kube(e)),
        }
    }

    async fn watch<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<ObjectStream<K>> {
        let api = Api::<K>::namespaced(self.client.clone(), namespace);

        Ok(watcher::watch_object(api, name)
            .map(|event| event.map_err(|e| ControllerError::WatchError(e.to_string())))
            .boxed())
    }

    async fn get_status(&self, target: &ObjectReference) -> Result<Option<VersionedStatus>> {
        let (api, name) = self.dynamic_api(target)?;

        let Some(object) = api.get_opt(&name).await.map_err(ControllerError::from_kube)? else {
            return Ok(None);
        };
        let status = match object.data.get("status") {
            Some(value) if !value.is_null() => Some(serde_json::from_value(value.clone())?),
            _ => None,
        };

        Ok(Some(VersionedStatus {
            status,
            resource_version: object.metadata.resource_version,
            generation: object.metadata.generation,
        }))
    }

    async fn patch_status(&self, target: &ObjectReference, status: &ProvisioningStatus, resource_version: Option<&str>) -> Result<()> {
        let (api, name) = self.dynamic_api(target)?;
        // A resourceVersion in a merge patch turns it into a compare-and-swap
        let patch = match resource_version {
            Some(version) => json!({ "metadata": { "resourceVersion": version }, "status": status }),
            None => json!({ "status": status }),
        };

        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(ControllerError::from_kube)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map(|list| list.items.iter().map(|namespace| namespace.name_any()).collect())
            .map_err(ControllerError::from_kube)
    }
}
