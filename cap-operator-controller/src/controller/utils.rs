// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use kube::{
    api::{Api, Patch, PatchParams},
    runtime::controller::Action,
    Client, Resource, ResourceExt,
};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::sync::Arc;
use std::fmt::Debug;
use tokio::time::Duration;
use serde::Serialize;
use serde::de::DeserializeOwned;

use cap_operator_common::telemetry::error;

use crate::controller::context::Context;
use crate::error::{ControllerError, Result};

pub static FIELD_MANAGER: &str = "operator.capability.dev";

/// Create a new kube client by inferring the kubeconfig from the environment
/// or the default service account
///
/// # Returns
/// A Result containing the kube Client or an error
pub async fn create_k8s_client() -> Result<Client> {
    Client::try_default().await.map_err(ControllerError::from)
}

/// Error policy to log the error and requeue the object after 30 seconds
///
/// # Arguments
/// * `_object`: The object that caused the error
/// * `_error`: The error that occurred
/// * `_ctx`: The context of the controller
///
/// # Returns
/// An Action to requeue the object after 30 seconds
pub fn error_policy<T>(_object: Arc<T>, _error: &ControllerError, _ctx: Arc<Context>) -> Action {
    error!(
        event = "Error",
        error = %_error,
    );
    Action::requeue(Duration::from_secs(30))
}

/// Merge-patch a Resource
///
/// # Arguments
/// * `api`: The API client for the resource type
/// * `name`: The name of the object to patch
/// * `patch`: The merge patch to apply
///
/// # Returns
/// A Result containing the patched object or an error
pub async fn patch<T>(api: &Api<T>, name: &str, patch: &serde_json::Value) -> Result<T>
where
    T: Clone + Debug + Serialize + DeserializeOwned + Resource<DynamicType = ()>,
{
    api.patch(name, &PatchParams::default(), &Patch::Merge(patch)).await.map_err(ControllerError::from_kube)
}

/// Build a reference to a namespaced resource, used to address its status and events
pub fn object_reference<T>(object: &T) -> ObjectReference
where
    T: Resource<DynamicType = ()>,
{
    ObjectReference {
        api_version: Some(T::api_version(&()).to_string()),
        kind: Some(T::kind(&()).to_string()),
        namespace: object.namespace(),
        name: Some(object.name_any()),
        uid: object.uid(),
        resource_version: object.resource_version(),
        ..Default::default()
    }
}

/// Human-readable `kind namespace/name` of a reference
pub fn describe(target: &ObjectReference) -> String {
    format!(
        "{} {}/{}",
        target.kind.as_deref().unwrap_or("object"),
        target.namespace.as_deref().unwrap_or_default(),
        target.name.as_deref().unwrap_or_default(),
    )
}

/// Owner reference pointing at `target`, `None` while its uid is unknown
pub fn owner_reference(target: &ObjectReference, controller: bool) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: target.api_version.clone()?,
        kind: target.kind.clone()?,
        name: target.name.clone()?,
        uid: target.uid.clone()?,
        block_owner_deletion: Some(true),
        controller: Some(controller),
    })
}
