// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use kube::Client;
use std::sync::Arc;

use cap_operator_common::config::AppConfig;
use cap_operator_common::constant::APP_NAME;

use crate::controller::{
    client::KubeResourceClient,
    deployment::DeploymentOrchestrator,
    events::KubeEventPublisher,
    identity::KeycloakIdentityProvider,
    resolver::CapabilityResolver,
    status::StatusPhaseTracker,
};

// Context struct to hold the kube client, the configuration and the provisioning services
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<AppConfig>,
    pub resolver: CapabilityResolver<KubeResourceClient>,
    pub orchestrator: DeploymentOrchestrator<KubeResourceClient>,
}

impl Context {
    pub fn new(client: Client, config: Arc<AppConfig>) -> Self {
        let resources = Arc::new(KubeResourceClient::new(client.clone()));
        let events = Arc::new(KubeEventPublisher::new(client.clone(), APP_NAME));
        let tracker = StatusPhaseTracker::new(resources.clone(), events);
        let controller_config = Arc::new(config.controller.clone());

        Self {
            client,
            resolver: CapabilityResolver::new(resources.clone(), tracker.clone(), controller_config.clone()),
            orchestrator: DeploymentOrchestrator::new(
                resources,
                tracker,
                Arc::new(KeycloakIdentityProvider::new()),
                controller_config,
            ),
            config,
        }
    }
}
