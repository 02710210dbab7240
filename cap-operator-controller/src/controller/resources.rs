// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::collections::{BTreeMap, BTreeSet};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectReference, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec,
    Secret, SecretKeySelector, Service, ServiceAccount, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use cap_operator_common::constant::APP_NAME;
use cap_operator_common::utils::SPEC_HASH_ANNOTATION;

use crate::controller::probe::ProbeTimingPolicy;
use crate::controller::utils::owner_reference;
use crate::crd::v1alpha1::deployable::{Deployable, DeployableContainer, SecretTemplate};
use crate::error::{ControllerError, Result};

pub static DEPLOYMENT_LABEL: &str = "capability.dev/deployment";

/// Where the sub-resources of a deployable live and how they are named and labeled
pub struct DeployableTarget<'a> {
    pub deployable: &'a Deployable,
    pub namespace: String,
    pub base_name: String,
    owner_ref: Option<OwnerReference>,
}

impl<'a> DeployableTarget<'a> {
    pub fn new(owner: &ObjectReference, deployable: &'a Deployable) -> Result<Self> {
        let namespace = owner.namespace.clone()
            .ok_or(ControllerError::MissingObjectKeyError("Expected the owning resource to be namespaced"))?;
        let owner_name = owner.name.as_deref()
            .ok_or(ControllerError::MissingObjectKeyError("Expected the owning resource to have a name"))?;

        Ok(Self {
            deployable,
            namespace,
            base_name: deployable.base_name(owner_name),
            owner_ref: owner_reference(owner, true),
        })
    }

    /// Labels selecting the pods of the workload
    pub fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(DEPLOYMENT_LABEL.to_string(), self.base_name.clone())])
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector();
        labels.insert("app.kubernetes.io/name".to_string(), self.base_name.clone());
        labels.insert("app.kubernetes.io/managed-by".to_string(), APP_NAME.to_string());
        labels
    }

    pub fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            owner_references: self.owner_ref.clone().map(|owner_ref| vec![owner_ref]),
            ..Default::default()
        }
    }

    pub fn preparation_pod_name(&self) -> String {
        format!("{}-db-preparation", self.base_name)
    }

    pub fn claim_name(&self, container: &str, volume: &str) -> String {
        format!("{}-{}-{}", self.base_name, container, volume)
    }

    pub fn service_account_name(&self) -> String {
        self.deployable.service_account_name.clone().unwrap_or_else(|| format!("{}-sa", self.base_name))
    }

    pub fn role_name(&self) -> String {
        format!("{}-role", self.base_name)
    }

    pub fn service_name(&self) -> String {
        format!("{}-service", self.base_name)
    }

    pub fn ingress_name(&self) -> String {
        format!("{}-ingress", self.base_name)
    }

    pub fn sso_secret_name(&self, container: &str) -> String {
        format!("{}-{}-sso-secret", self.base_name, container)
    }

    pub fn deployment_name(&self) -> String {
        format!("{}-deployment", self.base_name)
    }
}

/// Record the spec hash a sub-resource is submitted with
pub fn annotate_hash(metadata: &mut ObjectMeta, hash: &str) {
    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash.to_string());
}

/// One-shot pod preparing the schema of every data store the containers depend on
pub fn preparation_pod(target: &DeployableTarget, image: &str) -> Pod {
    let containers = target.deployable.containers
        .iter()
        .filter_map(|container| container.database.as_ref().map(|database| (container, database)))
        .map(|(container, database)| Container {
            name: format!("{}-db-preparation", container.name),
            image: Some(image.to_string()),
            command: database.preparation_command.clone(),
            env: Some(vec![
                env_var("DATABASE_VENDOR", &database.vendor),
                env_var("DATABASE_HOST", &database.host),
                env_var("DATABASE_PORT", &database.port.to_string()),
                env_var("DATABASE_NAME", &database.database_name),
                env_var("DATABASE_SCHEMA", &database.schema),
                secret_env_var("DATABASE_ADMIN_USERNAME", &database.admin_secret_name, "username"),
                secret_env_var("DATABASE_ADMIN_PASSWORD", &database.admin_secret_name, "password"),
            ]),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: target.metadata(&target.preparation_pod_name()),
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Claims of every volume declared by the containers
pub fn persistent_volume_claims(target: &DeployableTarget) -> Vec<PersistentVolumeClaim> {
    target.deployable.containers
        .iter()
        .flat_map(|container| container.volumes.iter().map(move |volume| (container, volume)))
        .map(|(container, volume)| PersistentVolumeClaim {
            metadata: target.metadata(&target.claim_name(&container.name, &volume.name)),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec![volume.access_mode.clone()]),
                storage_class_name: volume.storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), Quantity(volume.size.clone()))])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

pub fn secret(target: &DeployableTarget, template: &SecretTemplate) -> Secret {
    Secret {
        metadata: target.metadata(&template.name),
        string_data: Some(template.string_data.clone()),
        ..Default::default()
    }
}

pub fn service_account(target: &DeployableTarget) -> ServiceAccount {
    ServiceAccount {
        metadata: target.metadata(&target.service_account_name()),
        ..Default::default()
    }
}

/// Role granting the union of the Kubernetes permissions the containers declare
pub fn role(target: &DeployableTarget) -> Role {
    let mut verbs: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
    for permission in target.deployable.containers.iter().flat_map(|container| &container.kubernetes_permissions) {
        verbs
            .entry((permission.api_group.clone(), permission.resource.clone()))
            .or_default()
            .extend(permission.verbs.iter().cloned());
    }

    Role {
        metadata: target.metadata(&target.role_name()),
        rules: Some(verbs
            .into_iter()
            .map(|((api_group, resource), verbs)| PolicyRule {
                api_groups: Some(vec![api_group]),
                resources: Some(vec![resource]),
                verbs: verbs.into_iter().collect(),
                ..Default::default()
            })
            .collect()),
    }
}

/// Bind the service account of the deployable to a Role or ClusterRole
pub fn role_binding(target: &DeployableTarget, role_kind: &str, role_name: &str) -> RoleBinding {
    RoleBinding {
        metadata: target.metadata(&format!("{}-{}-binding", target.service_account_name(), role_name)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: role_kind.to_string(),
            name: role_name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: target.service_account_name(),
            namespace: Some(target.namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// Service exposing the primary and additional ports of every service-backing container
pub fn service(target: &DeployableTarget) -> Service {
    let ports = target.deployable.containers
        .iter()
        .filter(|container| container.service_backing)
        .flat_map(|container| {
            let primary = container.primary_port.map(|port| (format!("{}-port", container.name), port));
            primary.into_iter().chain(container.additional_ports.iter().map(|port| (port.name.clone(), port.port)))
        })
        .map(|(name, port)| ServicePort {
            name: Some(name),
            port,
            target_port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    Service {
        metadata: target.metadata(&target.service_name()),
        spec: Some(ServiceSpec {
            selector: Some(target.selector()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress routing the declared host and path to the primary port of the service
pub fn ingress(target: &DeployableTarget) -> Result<Option<Ingress>> {
    let Some(requirement) = &target.deployable.ingress else {
        return Ok(None);
    };
    let port = target.deployable
        .primary_container()
        .and_then(|container| container.primary_port)
        .ok_or_else(|| ControllerError::ConfigurationError(
            format!("ingress {} needs a service-backing container with a primary port", requirement.host_name)
        ))?;

    Ok(Some(Ingress {
        metadata: target.metadata(&target.ingress_name()),
        spec: Some(IngressSpec {
            ingress_class_name: requirement.ingress_class.clone(),
            rules: Some(vec![IngressRule {
                host: Some(requirement.host_name.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(requirement.path.clone()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: target.service_name(),
                                port: Some(ServiceBackendPort { number: Some(port), ..Default::default() }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls: requirement.tls_secret_name.as_ref().map(|secret_name| vec![IngressTLS {
                hosts: Some(vec![requirement.host_name.clone()]),
                secret_name: Some(secret_name.clone()),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

/// Secret holding the credentials issued to a confidential identity-provider client
pub fn sso_secret(target: &DeployableTarget, container: &str, client_id: &str, client_secret: &str) -> Secret {
    Secret {
        metadata: target.metadata(&target.sso_secret_name(container)),
        string_data: Some(BTreeMap::from([
            ("clientId".to_string(), client_id.to_string()),
            ("clientSecret".to_string(), client_secret.to_string()),
        ])),
        ..Default::default()
    }
}

/// Single-replica workload running every container of the deployable
pub fn deployment(target: &DeployableTarget, policy: &ProbeTimingPolicy) -> Deployment {
    let containers = target.deployable.containers
        .iter()
        .map(|container| workload_container(target, container, policy))
        .collect();
    let volumes: Vec<Volume> = target.deployable.containers
        .iter()
        .flat_map(|container| container.volumes.iter().map(move |volume| Volume {
            name: format!("{}-{}", container.name, volume.name),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: target.claim_name(&container.name, &volume.name),
                ..Default::default()
            }),
            ..Default::default()
        }))
        .collect();

    Deployment {
        metadata: target.metadata(&target.deployment_name()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(target.selector()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(target.labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(target.service_account_name()),
                    containers,
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn workload_container(target: &DeployableTarget, container: &DeployableContainer, policy: &ProbeTimingPolicy) -> Container {
    let probes = policy.probes(container);

    let ports: Vec<ContainerPort> = container.primary_port
        .map(|port| (format!("{}-port", container.name), port))
        .into_iter()
        .chain(container.additional_ports.iter().map(|port| (port.name.clone(), port.port)))
        .map(|(name, port)| ContainerPort {
            name: Some(name),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let mut env: Vec<EnvVar> = container.env.iter().map(|(name, value)| env_var(name, value)).collect();
    if let (Some(_), Some(connection)) = (&container.sso_client, &target.deployable.sso) {
        let secret_name = target.sso_secret_name(&container.name);
        env.push(env_var("SSO_URL", &connection.base_url));
        env.push(env_var("SSO_REALM", &connection.realm));
        env.push(secret_env_var("SSO_CLIENT_ID", &secret_name, "clientId"));
        env.push(secret_env_var("SSO_CLIENT_SECRET", &secret_name, "clientSecret"));
    }

    let volume_mounts: Vec<VolumeMount> = container.volumes
        .iter()
        .map(|volume| VolumeMount {
            name: format!("{}-{}", container.name, volume.name),
            mount_path: volume.mount_path.clone(),
            ..Default::default()
        })
        .collect();

    Container {
        name: container.name.clone(),
        image: Some(container.image.clone()),
        command: container.command.clone(),
        ports: (!ports.is_empty()).then_some(ports),
        env: (!env.is_empty()).then_some(env),
        resources: container.resources.clone(),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        startup_probe: probes.startup,
        readiness_probe: probes.readiness,
        liveness_probe: probes.liveness,
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn secret_env_var(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
