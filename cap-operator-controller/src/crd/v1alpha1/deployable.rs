// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::collections::BTreeMap;
use k8s_openapi::api::core::v1::ResourceRequirements;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::v1alpha1::common::DEFAULT_QUALIFIER;

/// A unit of work to be turned into running Kubernetes resources
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Deployable {
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Distinguishes multiple deployables of the same owning resource
    pub qualifier: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    /// Containers of the workload, in declaration order
    pub containers: Vec<DeployableContainer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Service account the workload runs as, `<base name>-sa` when omitted
    pub service_account_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    /// Secrets created before the workload
    pub secrets: Vec<SecretTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Ingress exposing the service of the deployable
    pub ingress: Option<IngressRequirement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Service outside the cluster this deployable points at instead of running containers
    pub external_service: Option<ExternalService>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Identity provider shared by every container of the deployable
    pub sso: Option<SsoConnection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Public (secretless) client registered for a publicly exposed deployable
    pub public_client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Admin secret handed back to capability consumers
    pub admin_secret_name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    /// Parameters copied onto the server status on success, e.g. the database vendor
    pub derived_parameters: BTreeMap<String, String>,
}

impl Deployable {
    pub fn qualifier(&self) -> &str {
        self.qualifier.as_deref().unwrap_or(DEFAULT_QUALIFIER)
    }

    /// Base name of every sub-resource created for this deployable
    pub fn base_name(&self, owner_name: &str) -> String {
        match &self.qualifier {
            Some(qualifier) => format!("{}-{}", owner_name, qualifier),
            None => owner_name.to_string(),
        }
    }

    pub fn points_externally(&self) -> bool {
        self.containers.is_empty() && self.external_service.is_some()
    }

    pub fn requires_preparation(&self) -> bool {
        self.containers.iter().any(|c| c.database.is_some())
    }

    pub fn requires_service(&self) -> bool {
        self.containers.iter().any(|c| c.service_backing)
    }

    pub fn requires_sso(&self) -> bool {
        self.public_client_id.is_some() || self.containers.iter().any(|c| c.sso_client.is_some())
    }

    /// First service-backing container with a primary port, targeted by the ingress
    pub fn primary_container(&self) -> Option<&DeployableContainer> {
        self.containers.iter().find(|c| c.service_backing && c.primary_port.is_some())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployableContainer {
    pub name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_port: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_ports: Vec<NamedPort>,
    /// Whether the deployable's Service exposes this container's ports
    pub service_backing: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Longest time the container may take to start, 120 seconds when omitted
    pub maximum_startup_time_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<PersistentVolumeSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    /// Kubernetes API permissions granted through a Role in lenient security mode
    pub kubernetes_permissions: Vec<KubernetesPermission>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Data store whose schema is prepared before the workload starts
    pub database: Option<DatabaseDependency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Confidential client registered with the identity provider
    pub sso_client: Option<SsoClientRequirement>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamedPort {
    pub name: String,
    pub port: i32,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_path: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeSpec {
    pub name: String,
    pub mount_path: String,
    #[serde(default = "default_volume_size")]
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default = "default_access_mode")]
    pub access_mode: String,
}

fn default_volume_size() -> String {
    "1Gi".to_string()
}

fn default_access_mode() -> String {
    "ReadWriteOnce".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesPermission {
    #[serde(default)]
    pub api_group: String,
    pub resource: String,
    pub verbs: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDependency {
    pub vendor: String,
    pub host: String,
    pub port: i32,
    pub database_name: String,
    pub schema: String,
    /// Secret holding `username` and `password` of the database administrator
    pub admin_secret_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preparation_command: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SsoClientRequirement {
    pub client_id: String,
    #[serde(default = "default_web_context")]
    pub web_context: String,
}

fn default_web_context() -> String {
    "/".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SsoConnection {
    pub base_url: String,
    pub realm: String,
    /// Secret holding `username` and `password` of the identity provider administrator
    pub admin_secret_name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplate {
    pub name: String,
    #[serde(default)]
    pub string_data: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressRequirement {
    pub host_name: String,
    #[serde(default = "default_web_context")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalService {
    pub host: String,
    pub port: i32,
}
