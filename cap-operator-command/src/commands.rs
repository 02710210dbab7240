// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use cap_operator_common::config::ControllerConfig;
use cap_operator_controller::controller::client::ResourceClient;
use cap_operator_controller::controller::{CapabilityResolver, DeploymentOrchestrator, DeploymentResult, ProvisioningResult};
use cap_operator_controller::crd::{CapabilityRequirement, Deployable};
use cap_operator_controller::error::Result;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvideCapabilityRequest {
    pub requester: ObjectReference,
    pub requirement: CapabilityRequirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDeploymentRequest {
    pub owner: ObjectReference,
    pub deployable: Deployable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// The operations offered to other components of the operator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CapabilityCommands: Send + Sync {
    async fn provide(&self, request: ProvideCapabilityRequest) -> Result<ProvisioningResult>;
    async fn run(&self, request: RunDeploymentRequest) -> Result<DeploymentResult>;
}

/// Commands backed by the resolver and the orchestrator, falling back to the configured
/// timeouts when a request does not carry one
pub struct CommandService<C> {
    resolver: CapabilityResolver<C>,
    orchestrator: DeploymentOrchestrator<C>,
    capability_timeout: Duration,
    deployment_timeout: Duration,
}

impl<C: ResourceClient> CommandService<C> {
    pub fn new(resolver: CapabilityResolver<C>, orchestrator: DeploymentOrchestrator<C>, config: &ControllerConfig) -> Self {
        Self {
            resolver,
            orchestrator,
            capability_timeout: Duration::from_secs(config.capability_timeout_seconds),
            deployment_timeout: Duration::from_secs(config.deployment_timeout_seconds),
        }
    }
}

#[async_trait]
impl<C: ResourceClient> CapabilityCommands for CommandService<C> {
    async fn provide(&self, request: ProvideCapabilityRequest) -> Result<ProvisioningResult> {
        let timeout = request.timeout_seconds.map(Duration::from_secs).unwrap_or(self.capability_timeout);
        self.resolver.resolve(&request.requester, &request.requirement, timeout).await
    }

    async fn run(&self, request: RunDeploymentRequest) -> Result<DeploymentResult> {
        let timeout = request.timeout_seconds.map(Duration::from_secs).unwrap_or(self.deployment_timeout);
        self.orchestrator.run(&request.owner, &request.deployable, timeout).await
    }
}
