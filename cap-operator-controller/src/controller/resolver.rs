// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::collections::BTreeMap;
use std::sync::Arc;
use k8s_openapi::api::core::v1::{ObjectReference, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use cap_operator_common::config::ControllerConfig;
use cap_operator_common::telemetry::{info, warn};

use crate::controller::client::ResourceClient;
use crate::controller::registry::CapabilityRegistry;
use crate::controller::scope::{provisioned_implementation, provisioned_scope, ScopeNamer};
use crate::controller::status::{failure_of, StatusPhaseTracker};
use crate::controller::utils::{describe, object_reference, owner_reference};
use crate::crd::{CapabilityRequirement, CapabilityScope, Phase, ProvidedCapability};
use crate::error::{ControllerError, Result};

/// The resources through which a resolved capability is consumed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningResult {
    pub capability: ObjectReference,
    pub service: Service,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Ingress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_secret: Option<Secret>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub derived_parameters: BTreeMap<String, String>,
}

/// Resolves capability requirements to existing capabilities, creating and awaiting new ones
pub struct CapabilityResolver<C> {
    client: Arc<C>,
    namer: ScopeNamer,
    registry: CapabilityRegistry<C>,
    tracker: StatusPhaseTracker<C>,
}

impl<C> Clone for CapabilityResolver<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            namer: self.namer.clone(),
            registry: self.registry.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

impl<C: ResourceClient> CapabilityResolver<C> {
    pub fn new(client: Arc<C>, tracker: StatusPhaseTracker<C>, config: Arc<ControllerConfig>) -> Self {
        Self {
            namer: ScopeNamer::new(&config.operator_namespace),
            registry: CapabilityRegistry::new(client.clone(), config.observed_namespaces.clone()),
            tracker,
            client,
        }
    }

    /// Resolve a capability requirement
    ///
    /// The scopes of the requirement are searched in order of preference and the first match
    /// wins. A match provisioned for another scope or implementation is an error, never a
    /// reason to keep searching. Without a match the capability is created for the first
    /// preferred scope and awaited until its controller completes it. Any error is recorded on
    /// the status of the requester, under the capability kind, before it is returned.
    ///
    /// # Arguments
    /// * `requester` - The resource requiring the capability
    /// * `requirement` - The capability requirement
    /// * `timeout` - The longest time to wait for the capability to be provisioned
    ///
    /// # Returns
    /// The service, ingress and admin secret of the capability
    pub async fn resolve(&self, requester: &ObjectReference, requirement: &CapabilityRequirement, timeout: Duration) -> Result<ProvisioningResult> {
        let error = match self.provide(requester, requirement, timeout).await {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        warn!(
            event = "CapabilityResolutionFailed",
            requester = describe(requester),
            capability = requirement.capability.as_str(),
            error = %error,
        );
        let failure = failure_of(requester, error.to_string());
        if let Err(e) = self.tracker.mark_failed(requester, requirement.capability.as_str(), failure).await {
            warn!(event = "RecordingResolutionFailureFailed", requester = describe(requester), error = %e);
        }
        Err(error)
    }

    async fn provide(&self, requester: &ObjectReference, requirement: &CapabilityRequirement, timeout: Duration) -> Result<ProvisioningResult> {
        let scopes = requirement.scopes();
        let controller = requirement.expected_controller();

        if let Some(found) = self.lookup(requester, requirement, &scopes).await? {
            validate(&found, requirement, &scopes)?;
            info!(
                event = "CapabilityFound",
                capability = found.name_any().as_str(),
                namespace = found.namespace().unwrap_or_default(),
                phase = found.phase().to_string(),
            );

            let resolved = match found.phase().is_terminal() {
                true => found,
                false => self.registry.wait_for_terminal(
                    &found.namespace().unwrap_or_default(),
                    &found.name_any(),
                    timeout,
                    &controller,
                ).await?,
            };
            ensure_successful(&resolved)?;
            return self.provisioning_result(&resolved).await;
        }

        let scope = scopes[0];
        let identity = self.namer.identity(requester, requirement, scope)?;
        let owner_ref = match scope {
            CapabilityScope::Dedicated => owner_reference(requester, false),
            _ => None,
        };
        self.registry.create(&identity, requirement, owner_ref).await?;

        let terminal = self.registry.wait_for_terminal(&identity.namespace, &identity.name, timeout, &controller).await?;
        ensure_successful(&terminal)?;

        // The watch only tells us the phase, read the capability again now that it is complete
        let resolved = self.lookup(requester, requirement, &[scope]).await?.ok_or_else(|| {
            ControllerError::ContractViolation(format!(
                "capability {}/{} completed but can no longer be found",
                identity.namespace, identity.name
            ))
        })?;
        self.provisioning_result(&resolved).await
    }

    async fn lookup(&self, requester: &ObjectReference, requirement: &CapabilityRequirement, scopes: &[CapabilityScope]) -> Result<Option<ProvidedCapability>> {
        for scope in scopes {
            let key = self.namer.lookup_key(requester, requirement, *scope)?;
            if let Some(found) = self.registry.find(&key).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    async fn provisioning_result(&self, capability: &ProvidedCapability) -> Result<ProvisioningResult> {
        let namespace = capability.namespace()
            .ok_or(ControllerError::MissingObjectKeyError("Expected capability to be namespaced via metadata.namespace"))?;
        let server = capability.status
            .as_ref()
            .and_then(|status| status.server_status(None))
            .ok_or_else(|| contract_violation(capability, "has no server status"))?;

        let service_name = server.service_name
            .as_deref()
            .ok_or_else(|| contract_violation(capability, "does not name a service"))?;
        let service = self.client
            .get::<Service>(&namespace, service_name)
            .await?
            .ok_or_else(|| contract_violation(capability, &format!("names service {} which does not exist", service_name)))?;

        let ingress = match &server.ingress_name {
            Some(name) => self.client.get::<Ingress>(&namespace, name).await?,
            None => None,
        };
        let admin_secret = match &server.admin_secret_name {
            Some(name) => {
                let secret = self.client.get::<Secret>(&namespace, name).await?;
                if secret.is_none() {
                    warn!(event = "AdminSecretMissing", capability = capability.name_any().as_str(), secret = name.as_str());
                }
                secret
            },
            None => None,
        };

        Ok(ProvisioningResult {
            capability: object_reference(capability),
            service,
            ingress,
            admin_secret,
            derived_parameters: server.derived_parameters.clone(),
        })
    }
}

fn validate(found: &ProvidedCapability, requirement: &CapabilityRequirement, scopes: &[CapabilityScope]) -> Result<()> {
    let found_scope = provisioned_scope(found).unwrap_or("none");
    if !scopes.iter().any(|scope| scope.as_str() == found_scope) {
        return Err(ControllerError::ScopeMismatch {
            capability: found.name_any(),
            found: found_scope.to_string(),
            requested: scopes.iter().map(|scope| scope.as_str()).collect::<Vec<_>>().join(", "),
        });
    }

    if let Some(implementation) = requirement.implementation {
        let found_implementation = provisioned_implementation(found);
        if found_implementation != Some(implementation.as_str()) {
            return Err(ControllerError::ImplementationMismatch {
                capability: found.name_any(),
                found: found_implementation.unwrap_or("none").to_string(),
                requested: implementation.to_string(),
            });
        }
    }
    Ok(())
}

fn ensure_successful(capability: &ProvidedCapability) -> Result<()> {
    match capability.phase() {
        Phase::Successful => Ok(()),
        phase => Err(ControllerError::ProvisioningFailed {
            resource: format!("ProvidedCapability {}/{}", capability.namespace().unwrap_or_default(), capability.name_any()),
            reason: capability.status
                .as_ref()
                .and_then(|status| status.first_failure())
                .map(|failure| failure.message.clone())
                .unwrap_or_else(|| format!("capability ended in phase {}", phase)),
        }),
    }
}

fn contract_violation(capability: &ProvidedCapability, problem: &str) -> ControllerError {
    ControllerError::ContractViolation(format!(
        "capability {}/{} {}",
        capability.namespace().unwrap_or_default(),
        capability.name_any(),
        problem
    ))
}
