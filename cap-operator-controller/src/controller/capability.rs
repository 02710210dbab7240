// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use kube::{
    api::{Api, ResourceExt},
    runtime::{controller::{Action, Controller}, watcher},
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Duration;

use cap_operator_common::telemetry::{debug, info};

use crate::controller::{context::Context, utils::{object_reference, patch}};
use crate::crd::{Phase, ProvidedCapability};
use crate::error::{ControllerError, Result};

pub static PROCESSING_INSTRUCTION_ANNOTATION: &str = "capability.dev/processing-instruction";
pub static FORCE_INSTRUCTION: &str = "force";

/// What a reconcile does with a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the embedded deployable
    Deploy,
    /// Drop the force instruction, then run the embedded deployable again
    ForceRedeploy,
    /// Nothing to do, the capability is terminal or handled elsewhere
    Skip,
}

/// Decide how to handle a capability
///
/// Capabilities without an embedded deployable belong to implementation-specific
/// controllers. A terminal capability is only touched again when it failed and carries
/// the force instruction.
pub fn decide(capability: &ProvidedCapability) -> Decision {
    if capability.spec.deployable.is_none() {
        return Decision::Skip;
    }

    let forced = capability
        .annotations()
        .get(PROCESSING_INSTRUCTION_ANNOTATION)
        .is_some_and(|instruction| instruction == FORCE_INSTRUCTION);

    match capability.phase() {
        Phase::Failed if forced => Decision::ForceRedeploy,
        phase if phase.is_terminal() => Decision::Skip,
        _ => Decision::Deploy,
    }
}

pub struct CapabilityController;

impl CapabilityController {
    /// Create a new controller for the ProvidedCapability resource
    ///
    /// # Arguments
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// The controller for the ProvidedCapability resource
    pub async fn create_controller(ctx: Arc<Context>) -> Controller<ProvidedCapability> {
        let client = ctx.client.clone();
        let capability = Api::<ProvidedCapability>::all(client.clone());

        let deployment = Api::<Deployment>::all(client.clone());
        let service = Api::<Service>::all(client.clone());

        Controller::new(capability, watcher::Config::default())
            .owns(deployment, watcher::Config::default())
            .owns(service, watcher::Config::default())
    }

    /// Reconcile a ProvidedCapability
    ///
    /// Runs the embedded deployable with the capability as owner, so that the outcome of the
    /// deployment becomes the terminal phase of the capability.
    ///
    /// # Arguments
    /// * `capability` - The capability to reconcile
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// An action to take after reconciling the capability
    pub async fn reconcile(capability: Arc<ProvidedCapability>, ctx: Arc<Context>) -> Result<Action> {
        let namespace = capability.namespace().ok_or(ControllerError::MissingObjectKeyError(
            "Expected ProvidedCapability to be namespaced via metadata.namespace"
        ))?;
        let name = capability.name_any();

        let decision = decide(&capability);
        debug!(event = "ReconcilingCapability", capability = name.as_str(), namespace = namespace.as_str(), decision = ?decision);

        if decision == Decision::Skip {
            return Ok(Action::await_change());
        }
        // Checked by `decide`
        let Some(deployable) = capability.spec.deployable.as_ref() else {
            return Ok(Action::await_change());
        };

        if decision == Decision::ForceRedeploy {
            info!(event = "ForcingRedeploy", capability = name.as_str(), namespace = namespace.as_str());
            let api = Api::<ProvidedCapability>::namespaced(ctx.client.clone(), &namespace);
            patch(&api, &name, &json!({
                "metadata": { "annotations": { PROCESSING_INSTRUCTION_ANNOTATION: null } }
            })).await?;
        }

        let owner = object_reference(&*capability);
        let timeout = Duration::from_secs(ctx.config.controller.deployment_timeout_seconds);
        let result = ctx.orchestrator.run(&owner, deployable, timeout).await?;

        info!(
            event = "CapabilityDeployed",
            capability = name.as_str(),
            namespace = namespace.as_str(),
            phase = %result.status.map(|status| status.phase).unwrap_or_default(),
        );
        Ok(Action::await_change())
    }
}
