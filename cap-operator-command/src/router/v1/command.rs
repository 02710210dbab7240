// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use axum::{
    extract::Extension,
    routing::post,
    Json,
    Router,
};
use kube::ResourceExt;
use std::sync::Arc;

use cap_operator_common::telemetry::{info, warn};
use cap_operator_controller::controller::{DeploymentResult, ProvisioningResult};

use crate::commands::{CapabilityCommands, ProvideCapabilityRequest, RunDeploymentRequest};
use crate::error::APIResult;

pub fn router() -> Router {
    Router::new()
        .route("/capabilities/provide", post(provide_capability_endpoint))
        .route("/deployments/run", post(run_deployment_endpoint))
}

async fn provide_capability_endpoint(
    Extension(commands): Extension<Arc<dyn CapabilityCommands>>,
    Json(request): Json<ProvideCapabilityRequest>,
) -> APIResult<Json<ProvisioningResult>> {
    let requester = request.requester.name.clone().unwrap_or_default();
    let capability = request.requirement.capability.as_str();
    info!(event = "ProvideCapability", requester = requester.as_str(), capability = capability);

    match commands.provide(request).await {
        Ok(result) => {
            info!(event = "CapabilityProvided", requester = requester.as_str(), service = result.service.name_any().as_str());
            Ok(Json(result))
        },
        Err(e) => {
            warn!(event = "ProvideCapabilityFailed", requester = requester.as_str(), error = %e);
            Err(e.into())
        },
    }
}

async fn run_deployment_endpoint(
    Extension(commands): Extension<Arc<dyn CapabilityCommands>>,
    Json(request): Json<RunDeploymentRequest>,
) -> APIResult<Json<DeploymentResult>> {
    let owner = request.owner.name.clone().unwrap_or_default();
    info!(event = "RunDeployment", owner = owner.as_str(), qualifier = request.deployable.qualifier());

    commands.run(request).await.map(Json).map_err(|e| {
        warn!(event = "RunDeploymentFailed", owner = owner.as_str(), error = %e);
        e.into()
    })
}
