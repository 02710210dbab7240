// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::sync::Arc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use tokio::time::Duration;

use cap_operator_common::telemetry::{debug, info};

use crate::controller::client::ResourceClient;
use crate::controller::scope::{CapabilityIdentity, CapabilityKey};
use crate::crd::{CapabilityRequirement, ProvidedCapability};
use crate::error::{ControllerError, Result};

/// Lookup, creation and terminal-phase wait for ProvidedCapabilities
pub struct CapabilityRegistry<C> {
    client: Arc<C>,
    observed_namespaces: Vec<String>,
}

impl<C> Clone for CapabilityRegistry<C> {
    fn clone(&self) -> Self {
        Self { client: self.client.clone(), observed_namespaces: self.observed_namespaces.clone() }
    }
}

impl<C: ResourceClient> CapabilityRegistry<C> {
    /// # Arguments
    /// * `client` - The resource client
    /// * `observed_namespaces` - Namespaces searched by cluster-wide lookups, every listable
    ///   namespace when empty
    pub fn new(client: Arc<C>, observed_namespaces: Vec<String>) -> Self {
        Self { client, observed_namespaces }
    }

    /// Find an existing capability
    ///
    /// # Arguments
    /// * `key` - How to locate the capability
    ///
    /// # Returns
    /// The first capability matching the key, if any
    pub async fn find(&self, key: &CapabilityKey) -> Result<Option<ProvidedCapability>> {
        match key {
            CapabilityKey::ByName { namespace, name } => self.client.get(namespace, name).await,
            CapabilityKey::ByLabels { namespace, labels } => Ok(
                self.client.list::<ProvidedCapability>(Some(namespace), labels).await?.into_iter().next()
            ),
            CapabilityKey::ClusterWide { labels } => {
                for namespace in self.searched_namespaces().await? {
                    match self.client.list::<ProvidedCapability>(Some(&namespace), labels).await {
                        Ok(found) => if let Some(capability) = found.into_iter().next() {
                            return Ok(Some(capability));
                        },
                        Err(ControllerError::Forbidden(reason)) => {
                            debug!(event = "SkippingNamespace", namespace = namespace.as_str(), reason = reason.as_str());
                        },
                        Err(e) => return Err(e),
                    }
                }
                Ok(None)
            },
        }
    }

    /// Create a capability for `identity`. Losing a creation race to another requester
    /// returns the capability that won.
    pub async fn create(
        &self,
        identity: &CapabilityIdentity,
        requirement: &CapabilityRequirement,
        owner_ref: Option<OwnerReference>,
    ) -> Result<ProvidedCapability> {
        let capability = ProvidedCapability {
            metadata: ObjectMeta {
                name: Some(identity.name.clone()),
                namespace: Some(identity.namespace.clone()),
                labels: Some(identity.labels.clone()),
                owner_references: owner_ref.map(|owner_ref| vec![owner_ref]),
                ..Default::default()
            },
            spec: requirement.clone(),
            status: None,
        };

        info!(
            event = "CreatingCapability",
            capability = identity.name.as_str(),
            namespace = identity.namespace.as_str(),
            scope = identity.scope.as_str(),
        );
        match self.client.create(&capability).await {
            Err(ControllerError::AlreadyExists(_)) => self.client
                .get(&identity.namespace, &identity.name)
                .await?
                .ok_or_else(|| ControllerError::ContractViolation(format!(
                    "capability {}/{} was reported to exist but could not be read",
                    identity.namespace, identity.name
                ))),
            other => other,
        }
    }

    /// Block until a capability reaches a terminal phase
    ///
    /// # Arguments
    /// * `namespace` - The namespace of the capability
    /// * `name` - The name of the capability
    /// * `timeout` - The longest time to wait
    /// * `controller` - The controller expected to complete the capability, reported on timeout
    ///
    /// # Returns
    /// The capability in its terminal phase, a `Timeout` error when the deadline elapses first,
    /// or a `WatchError` when the watch ends early. The watch is released on every path.
    pub async fn wait_for_terminal(&self, namespace: &str, name: &str, timeout: Duration, controller: &str) -> Result<ProvidedCapability> {
        let mut stream = self.client.watch::<ProvidedCapability>(namespace, name).await?;

        let terminal = async {
            while let Some(event) = stream.next().await {
                match event? {
                    Some(capability) if capability.phase().is_terminal() => return Ok(capability),
                    Some(capability) => debug!(
                        event = "WaitingForCapability",
                        capability = capability.name_any().as_str(),
                        phase = capability.phase().to_string(),
                    ),
                    None => debug!(event = "WaitingForCapability", capability = name, phase = "absent"),
                }
            }
            Err::<ProvidedCapability, ControllerError>(ControllerError::WatchError(
                format!("watch on capability {}/{} ended", namespace, name)
            ))
        };

        tokio::time::timeout(timeout, terminal)
            .await
            .map_err(|_| ControllerError::Timeout {
                resource: format!("ProvidedCapability {}/{}", namespace, name),
                controller: controller.to_string(),
            })?
    }

    async fn searched_namespaces(&self) -> Result<Vec<String>> {
        match self.observed_namespaces.is_empty() {
            true => self.client.list_namespaces().await,
            false => Ok(self.observed_namespaces.clone()),
        }
    }
}
