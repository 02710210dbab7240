// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

//! In-memory ResourceClient used by the unit tests. Objects are stored as JSON,
//! every write bumps a global resource version and is fanned out to watchers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, PodCondition, PodStatus, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::controller::client::{NamespacedObject, ObjectStream, ResourceClient, VersionedStatus};
use crate::crd::{Phase, ProvidedCapability, ProvisioningStatus, ServerStatus, DEFAULT_QUALIFIER};
use crate::error::{ControllerError, Result};

type Key = (String, String, String);
type Change = (Key, Option<Value>);

fn key_of<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

struct Store {
    objects: BTreeMap<Key, Value>,
    next_version: u64,
    namespaces: BTreeSet<String>,
    forbidden_namespaces: BTreeSet<String>,
    failures: BTreeMap<String, String>,
    status_conflicts: u32,
    calls: Vec<String>,
    auto_ready_pods: bool,
    preparation_pod_phase: String,
}

pub struct InMemoryClient {
    store: Mutex<Store>,
    changes: Mutex<Option<broadcast::Sender<Change>>>,
}

impl InMemoryClient {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            store: Mutex::new(Store {
                objects: BTreeMap::new(),
                next_version: 1,
                namespaces: BTreeSet::new(),
                forbidden_namespaces: BTreeSet::new(),
                failures: BTreeMap::new(),
                status_conflicts: 0,
                calls: vec![],
                auto_ready_pods: true,
                preparation_pod_phase: "Succeeded".to_string(),
            }),
            changes: Mutex::new(Some(sender)),
        }
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.store.lock().unwrap().namespaces.insert(namespace.to_string());
    }

    pub fn forbid_namespace(&self, namespace: &str) {
        let mut store = self.store.lock().unwrap();
        store.namespaces.insert(namespace.to_string());
        store.forbidden_namespaces.insert(namespace.to_string());
    }

    /// Make every create or apply of `K` fail
    pub fn fail_on<K: Resource<DynamicType = ()>>(&self, message: &str) {
        self.store.lock().unwrap().failures.insert(K::kind(&()).to_string(), message.to_string());
    }

    /// Reject the next `count` status writes as if another writer got there first
    pub fn conflict_next_status_writes(&self, count: u32) {
        self.store.lock().unwrap().status_conflicts = count;
    }

    pub fn set_auto_ready_pods(&self, enabled: bool) {
        self.store.lock().unwrap().auto_ready_pods = enabled;
    }

    pub fn set_preparation_pod_phase(&self, phase: &str) {
        self.store.lock().unwrap().preparation_pod_phase = phase.to_string();
    }

    /// End every open watch
    pub fn close_watches(&self) {
        self.changes.lock().unwrap().take();
    }

    /// Mutating calls in the order they were made, e.g. `apply Service ns/name`
    pub fn calls(&self) -> Vec<String> {
        self.store.lock().unwrap().calls.clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|call| call.starts_with(prefix))
    }

    /// Store an object directly, bypassing call recording and failure injection
    pub fn insert<K: NamespacedObject>(&self, object: K) -> K {
        let namespace = object.namespace().unwrap_or_default();
        let key = key_of::<K>(&namespace, &object.name_any());
        let value = serde_json::to_value(&object).expect("test object serializes");
        let stored = self.store_value(key, value);
        serde_json::from_value(stored).expect("test object deserializes")
    }

    /// Store an arbitrary owning resource with an optional provisioning status
    pub fn insert_owner(&self, target: &ObjectReference, status: Option<ProvisioningStatus>) {
        let key = (
            target.kind.clone().unwrap_or_default(),
            target.namespace.clone().unwrap_or_default(),
            target.name.clone().unwrap_or_default(),
        );
        let value = json!({
            "apiVersion": target.api_version,
            "kind": target.kind,
            "metadata": { "name": target.name, "namespace": target.namespace },
            "status": status,
        });
        self.store_value(key, value);
    }

    pub fn object<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Option<K> {
        self.store.lock().unwrap()
            .objects
            .get(&key_of::<K>(namespace, name))
            .map(|value| serde_json::from_value(value.clone()).expect("stored object deserializes"))
    }

    pub fn objects<K: NamespacedObject>(&self) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        self.store.lock().unwrap()
            .objects
            .iter()
            .filter(|(key, _)| key.0 == kind)
            .map(|(_, value)| serde_json::from_value(value.clone()).expect("stored object deserializes"))
            .collect()
    }

    pub fn status_of(&self, target: &ObjectReference) -> Option<ProvisioningStatus> {
        let key = (
            target.kind.clone().unwrap_or_default(),
            target.namespace.clone().unwrap_or_default(),
            target.name.clone().unwrap_or_default(),
        );
        self.store.lock().unwrap()
            .objects
            .get(&key)
            .and_then(|value| value.get("status").cloned())
            .filter(|status| !status.is_null())
            .map(|status| serde_json::from_value(status).expect("stored status deserializes"))
    }

    /// Act as the external controller of a capability: publish a Service and move it to `phase`
    pub fn complete_capability(&self, namespace: &str, name: &str, phase: Phase) {
        let service_name = format!("{}-service", name);
        self.insert(Service {
            metadata: ObjectMeta {
                name: Some(service_name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let status = ProvisioningStatus {
            phase,
            server_statuses: BTreeMap::from([(
                DEFAULT_QUALIFIER.to_string(),
                ServerStatus {
                    service_name: Some(service_name),
                    admin_secret_name: Some(format!("{}-admin-secret", name)),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };

        let key = key_of::<ProvidedCapability>(namespace, name);
        let mut value = self.store.lock().unwrap().objects.get(&key).cloned().expect("capability exists");
        value["status"] = serde_json::to_value(status).expect("status serializes");
        self.store_value(key, value);
    }

    fn store_value(&self, key: Key, mut value: Value) -> Value {
        {
            let mut store = self.store.lock().unwrap();
            let version = store.next_version;
            store.next_version += 1;
            value["metadata"]["resourceVersion"] = json!(version.to_string());
            if value["metadata"]["uid"].is_null() {
                value["metadata"]["uid"] = json!(format!("uid-{}", version));
            }
            store.namespaces.insert(key.1.clone());
            store.objects.insert(key.clone(), value.clone());
        }
        self.notify(key, Some(value.clone()));
        value
    }

    fn notify(&self, key: Key, value: Option<Value>) {
        if let Some(sender) = self.changes.lock().unwrap().as_ref() {
            let _ = sender.send((key, value));
        }
    }

    fn record(&self, verb: &str, key: &Key) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        store.calls.push(format!("{} {} {}/{}", verb, key.0, key.1, key.2));
        match store.failures.get(&key.0) {
            Some(message) if verb != "delete" => Err(ControllerError::UnknownError(message.clone())),
            _ => Ok(()),
        }
    }

    fn ready_pod_for(deployment: &Deployment) -> Option<Pod> {
        let labels = deployment.spec.as_ref()?.template.metadata.as_ref()?.labels.clone();
        Some(Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-0", deployment.name_any())),
                namespace: deployment.namespace(),
                labels,
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn to_value<T: Serialize>(object: &T) -> Result<Value> {
        Ok(serde_json::to_value(object)?)
    }
}

#[async_trait]
impl ResourceClient for InMemoryClient {
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let value = self.store.lock().unwrap().objects.get(&key_of::<K>(namespace, name)).cloned();
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    async fn list<K: NamespacedObject>(&self, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let store = self.store.lock().unwrap();
        if let Some(namespace) = namespace {
            if store.forbidden_namespaces.contains(namespace) {
                return Err(ControllerError::Forbidden(format!("cannot list {} in {}", K::kind(&()), namespace)));
            }
        }

        let kind = K::kind(&()).to_string();
        store.objects
            .iter()
            .filter(|(key, _)| key.0 == kind && namespace.is_none_or(|namespace| key.1 == namespace))
            .filter(|(_, value)| labels.iter().all(|(label, expected)| {
                value["metadata"]["labels"][label].as_str() == Some(expected.as_str())
            }))
            .map(|(_, value)| Ok(serde_json::from_value(value.clone())?))
            .collect()
    }

    async fn create<K: NamespacedObject>(&self, object: &K) -> Result<K> {
        let key = key_of::<K>(&object.namespace().unwrap_or_default(), &object.name_any());
        self.record("create", &key)?;
        if self.store.lock().unwrap().objects.contains_key(&key) {
            return Err(ControllerError::AlreadyExists(format!("{} {}/{}", key.0, key.1, key.2)));
        }

        let mut value = Self::to_value(object)?;
        if key.0 == "Pod" {
            let phase = self.store.lock().unwrap().preparation_pod_phase.clone();
            value["status"] = json!({ "phase": phase });
        }
        Ok(serde_json::from_value(self.store_value(key, value))?)
    }

    async fn apply<K: NamespacedObject>(&self, object: &K) -> Result<K> {
        let key = key_of::<K>(&object.namespace().unwrap_or_default(), &object.name_any());
        self.record("apply", &key)?;

        let mut value = Self::to_value(object)?;
        let existing = self.store.lock().unwrap().objects.get(&key).cloned();
        if let Some(existing) = existing {
            if value.get("status").is_none_or(Value::is_null) {
                value["status"] = existing["status"].clone();
            }
            value["metadata"]["uid"] = existing["metadata"]["uid"].clone();
        }
        let stored = self.store_value(key.clone(), value);

        if key.0 == "Deployment" && self.store.lock().unwrap().auto_ready_pods {
            let deployment: Deployment = serde_json::from_value(stored.clone())?;
            if let Some(pod) = Self::ready_pod_for(&deployment) {
                self.insert(pod);
            }
        }
        Ok(serde_json::from_value(stored)?)
    }

    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = key_of::<K>(namespace, name);
        self.record("delete", &key)?;
        let removed = self.store.lock().unwrap().objects.remove(&key);
        if removed.is_some() {
            self.notify(key, None);
        }
        Ok(())
    }

    async fn watch<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<ObjectStream<K>> {
        let key = key_of::<K>(namespace, name);
        let Some(receiver) = self.changes.lock().unwrap().as_ref().map(|sender| sender.subscribe()) else {
            return Ok(futures::stream::empty().boxed());
        };
        let current: Option<K> = self.get(namespace, name).await?;

        let updates = futures::stream::unfold(receiver, move |mut receiver| {
            let key = key.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((changed, value)) if changed == key => return Some((value, receiver)),
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .map(|value| value.map(serde_json::from_value::<K>).transpose().map_err(ControllerError::from));

        Ok(futures::stream::once(async move { Ok(current) }).chain(updates).boxed())
    }

    async fn get_status(&self, target: &ObjectReference) -> Result<Option<VersionedStatus>> {
        let key = (
            target.kind.clone().unwrap_or_default(),
            target.namespace.clone().unwrap_or_default(),
            target.name.clone().unwrap_or_default(),
        );
        let Some(value) = self.store.lock().unwrap().objects.get(&key).cloned() else {
            return Ok(None);
        };
        let status = match value.get("status") {
            Some(status) if !status.is_null() => Some(serde_json::from_value(status.clone())?),
            _ => None,
        };

        Ok(Some(VersionedStatus {
            status,
            resource_version: value["metadata"]["resourceVersion"].as_str().map(str::to_string),
            generation: value["metadata"]["generation"].as_i64(),
        }))
    }

    async fn patch_status(&self, target: &ObjectReference, status: &ProvisioningStatus, resource_version: Option<&str>) -> Result<()> {
        let key = (
            target.kind.clone().unwrap_or_default(),
            target.namespace.clone().unwrap_or_default(),
            target.name.clone().unwrap_or_default(),
        );
        self.record("status", &key)?;

        let mut value = {
            let mut store = self.store.lock().unwrap();
            let Some(value) = store.objects.get(&key).cloned() else {
                return Err(ControllerError::ContractViolation(format!("{} {}/{} does not exist", key.0, key.1, key.2)));
            };
            if store.status_conflicts > 0 {
                store.status_conflicts -= 1;
                store.next_version += 1;
                return Err(ControllerError::Conflict("the object has been modified".to_string()));
            }
            if resource_version.is_some_and(|version| value["metadata"]["resourceVersion"].as_str() != Some(version)) {
                return Err(ControllerError::Conflict("the object has been modified".to_string()));
            }
            value
        };

        value["status"] = Self::to_value(status)?;
        self.store_value(key, value);
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        Ok(self.store.lock().unwrap().namespaces.iter().cloned().collect())
    }
}

/// Complete every capability as soon as it is created, acting as its external controller
pub async fn complete_capabilities(client: Arc<InMemoryClient>, phase: Phase) {
    loop {
        for capability in client.objects::<ProvidedCapability>() {
            if !capability.phase().is_terminal() {
                client.complete_capability(&capability.namespace().unwrap_or_default(), &capability.name_any(), phase);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
