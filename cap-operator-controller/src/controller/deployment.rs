// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use cap_operator_common::config::{ControllerConfig, DeploymentMode, SecurityMode};
use cap_operator_common::constant::APP_NAME;
use cap_operator_common::telemetry::{error, info, warn};
use cap_operator_common::utils::{compute_object_hash, has_spec_hash};

use crate::controller::client::{NamespacedObject, ResourceClient};
use crate::controller::external::ExternalServiceBinder;
use crate::controller::identity::{AdminCredentials, IdentityProvider, OidcClient};
use crate::controller::probe::ProbeTimingPolicy;
use crate::controller::resources::{self, annotate_hash, DeployableTarget};
use crate::controller::status::{failure_of, StatusPhaseTracker};
use crate::controller::utils::describe;
use crate::crd::{Deployable, Phase, ProvisioningStatus, ServerStatus};
use crate::error::{ControllerError, Result};

/// The sub-resources created for a deployable. After a handled failure only the resources
/// created before the failing step are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Deployment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Ingress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<Pod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProvisioningStatus>,
}

/// A step of the pipeline that failed, and why
#[derive(Debug)]
struct StepFailure {
    step: &'static str,
    error: ControllerError,
}

async fn step<T>(name: &'static str, future: impl Future<Output = Result<T>>) -> std::result::Result<T, StepFailure> {
    future.await.map_err(|error| StepFailure { step: name, error })
}

/// Turns a deployable into running Kubernetes resources, recording progress and failures on
/// the status of the owning resource
pub struct DeploymentOrchestrator<C> {
    client: Arc<C>,
    tracker: StatusPhaseTracker<C>,
    identity: Arc<dyn IdentityProvider>,
    config: Arc<ControllerConfig>,
    probes: ProbeTimingPolicy,
}

impl<C> Clone for DeploymentOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            tracker: self.tracker.clone(),
            identity: self.identity.clone(),
            config: self.config.clone(),
            probes: self.probes,
        }
    }
}

impl<C: ResourceClient> DeploymentOrchestrator<C> {
    pub fn new(
        client: Arc<C>,
        tracker: StatusPhaseTracker<C>,
        identity: Arc<dyn IdentityProvider>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            probes: ProbeTimingPolicy::from_config(&config),
            client,
            tracker,
            identity,
            config,
        }
    }

    /// Deploy a deployable on behalf of `owner`
    ///
    /// The pipeline runs on its own task. When `timeout` elapses first the task is cancelled
    /// at its next suspension point, the owner is marked failed and a `Timeout` is returned.
    /// Failures of individual steps do not surface as errors: they are recorded on the
    /// owner's status and the partial result is returned.
    ///
    /// # Arguments
    /// * `owner` - The resource owning the deployable, its status records the progress
    /// * `deployable` - The deployable to run
    /// * `timeout` - The overall deadline
    ///
    /// # Returns
    /// The created sub-resources and the final status of the owner
    pub async fn run(&self, owner: &ObjectReference, deployable: &Deployable, timeout: Duration) -> Result<DeploymentResult> {
        let cancel = CancellationToken::new();
        let worker = self.clone();
        let (task_owner, task_deployable, token) = (owner.clone(), deployable.clone(), cancel.clone());
        let mut handle = tokio::spawn(async move { worker.execute(&task_owner, &task_deployable, &token).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined.map_err(|e| ControllerError::UnknownError(format!("deployment task failed: {}", e)))?,
            Err(_) => {
                cancel.cancel();
                let error = ControllerError::Timeout {
                    resource: format!("{} ({})", describe(owner), deployable.qualifier()),
                    controller: "deployment controller".to_string(),
                };
                warn!(event = "DeploymentTimedOut", resource = describe(owner), qualifier = deployable.qualifier());
                if let Err(e) = self.tracker.mark_failed(owner, deployable.qualifier(), failure_of(owner, error.to_string())).await {
                    warn!(event = "RecordingTimeoutFailed", resource = describe(owner), error = %e);
                }
                Err(error)
            },
        }
    }

    async fn execute(&self, owner: &ObjectReference, deployable: &Deployable, token: &CancellationToken) -> Result<DeploymentResult> {
        let target = DeployableTarget::new(owner, deployable)?;
        let qualifier = deployable.qualifier();
        let mut result = DeploymentResult::default();

        info!(event = "StartingDeployment", resource = describe(owner), deployable = target.base_name.as_str());
        self.tracker.update_phase(owner, Phase::Started).await?;

        let outcome = match &deployable.external_service {
            Some(external) if deployable.points_externally() => self.bind_external(owner, &target, external, &mut result).await,
            _ => self.pipeline(owner, &target, &mut result, token).await,
        };

        match outcome {
            Ok(()) => {
                self.record(owner, qualifier, |server| {
                    server.admin_secret_name = deployable.admin_secret_name.clone();
                    server.derived_parameters.extend(deployable.derived_parameters.clone());
                }).await?;
                result.status = Some(self.tracker.update_phase(owner, Phase::Successful).await?);
                info!(event = "DeploymentSucceeded", resource = describe(owner), deployable = target.base_name.as_str());
                Ok(result)
            },
            Err(failure) if failure.error.is_infrastructure() => Err(failure.error),
            Err(failure) => {
                error!(
                    event = "DeploymentFailed",
                    resource = describe(owner),
                    deployable = target.base_name.as_str(),
                    step = failure.step,
                    error = %failure.error,
                );
                let mut record = failure_of(owner, format!("{} failed: {}", failure.step, failure.error));
                record.detail = Some(format!("{:?}", failure.error));
                result.status = Some(self.tracker.mark_failed(owner, qualifier, record).await?);
                Ok(result)
            },
        }
    }

    async fn bind_external(
        &self,
        owner: &ObjectReference,
        target: &DeployableTarget<'_>,
        external: &crate::crd::v1alpha1::deployable::ExternalService,
        result: &mut DeploymentResult,
    ) -> std::result::Result<(), StepFailure> {
        let binder = ExternalServiceBinder::new(self.client.clone());
        let service = step("external-service", binder.bind(target, external)).await?;
        let service_name = service.name_any();
        result.service = Some(service);

        step("external-service", self.record(owner, target.deployable.qualifier(), |server| {
            server.service_name = Some(service_name.clone());
        })).await
    }

    async fn pipeline(
        &self,
        owner: &ObjectReference,
        target: &DeployableTarget<'_>,
        result: &mut DeploymentResult,
        token: &CancellationToken,
    ) -> std::result::Result<(), StepFailure> {
        let deployable = target.deployable;
        let qualifier = deployable.qualifier();

        if deployable.requires_preparation() {
            step("preparation", self.prepare(owner, target, token)).await?;
        }

        step("persistent-volume-claims", self.checkpoint(token)).await?;
        for claim in resources::persistent_volume_claims(target) {
            let claim = step("persistent-volume-claims", self.submit(claim)).await?;
            let phase = claim.status.as_ref().and_then(|status| status.phase.clone()).unwrap_or_else(|| "Pending".to_string());
            step("persistent-volume-claims", self.record(owner, qualifier, |server| {
                server.pvc_phases.insert(claim.name_any(), phase.clone());
            })).await?;
        }

        step("secrets", self.checkpoint(token)).await?;
        for template in &deployable.secrets {
            let secret = step("secrets", self.submit(resources::secret(target, template))).await?;
            let name = secret.name_any();
            step("secrets", self.record(owner, qualifier, |server| {
                if !server.secret_names.contains(&name) {
                    server.secret_names.push(name.clone());
                }
            })).await?;
        }

        step("service-account", self.checkpoint(token)).await?;
        step("service-account", self.ensure_service_account(target)).await?;
        step("service-account", self.record(owner, qualifier, |server| {
            server.service_account_name = Some(target.service_account_name());
        })).await?;

        if deployable.requires_service() {
            step("service", self.checkpoint(token)).await?;
            let service = step("service", self.submit(resources::service(target))).await?;
            result.service = Some(service);
            step("service", self.record(owner, qualifier, |server| server.service_name = Some(target.service_name()))).await?;
        }

        if let Some(ingress) = step("ingress", async { resources::ingress(target) }).await? {
            step("ingress", self.checkpoint(token)).await?;
            result.ingress = Some(step("ingress", self.submit(ingress)).await?);
            step("ingress", self.record(owner, qualifier, |server| server.ingress_name = Some(target.ingress_name()))).await?;
        }

        if deployable.requires_sso() {
            step("sso-clients", self.checkpoint(token)).await?;
            let client_ids = step("sso-clients", self.register_sso_clients(target, result.ingress.as_ref())).await?;
            step("sso-clients", self.record(owner, qualifier, |server| server.sso_client_ids.extend(client_ids.clone()))).await?;
        }

        step("deployment", self.checkpoint(token)).await?;
        let deployment = step("deployment", self.submit(resources::deployment(target, &self.probes))).await?;
        result.deployment = Some(deployment);
        step("deployment", self.record(owner, qualifier, |server| server.deployment_name = Some(target.deployment_name()))).await?;

        let pod = step("pod-readiness", self.await_ready_pod(target, token)).await?;
        let pod_phase = pod.status.as_ref().and_then(|status| status.phase.clone());
        result.pod = Some(pod);
        step("pod-readiness", self.record(owner, qualifier, |server| server.pod_phase = pod_phase.clone())).await
    }

    /// Run the data store preparation pod to completion
    async fn prepare(&self, owner: &ObjectReference, target: &DeployableTarget<'_>, token: &CancellationToken) -> Result<()> {
        let name = target.preparation_pod_name();
        let pod = resources::preparation_pod(target, &self.config.preparation_image);

        info!(event = "PreparingDataStores", deployable = target.base_name.as_str(), pod = name.as_str());
        self.client.delete::<Pod>(&target.namespace, &name).await?;
        // A pod from an earlier run may still be terminating
        loop {
            match self.client.create(&pod).await {
                Ok(_) => break,
                Err(ControllerError::AlreadyExists(_)) => self.pause(token).await?,
                Err(e) => return Err(e),
            }
        }

        let phase = loop {
            self.checkpoint(token).await?;
            let phase = self.client
                .get::<Pod>(&target.namespace, &name)
                .await?
                .and_then(|pod| pod.status)
                .and_then(|status| status.phase);
            match phase.as_deref() {
                Some("Succeeded") | Some("Failed") => break phase.unwrap_or_default(),
                _ => self.pause(token).await?,
            }
        };

        self.record(owner, target.deployable.qualifier(), |server| server.preparation_pod_phase = Some(phase.clone())).await?;
        if phase == "Failed" {
            return Err(ControllerError::ProvisioningFailed {
                resource: format!("Pod {}/{}", target.namespace, name),
                reason: "the data store preparation pod failed".to_string(),
            });
        }

        if self.config.delete_preparation_pods {
            self.client.delete::<Pod>(&target.namespace, &name).await?;
        }
        Ok(())
    }

    async fn ensure_service_account(&self, target: &DeployableTarget<'_>) -> Result<()> {
        let name = target.service_account_name();
        if self.client.get::<ServiceAccount>(&target.namespace, &name).await?.is_none() {
            info!(event = "CreatingServiceAccount", deployable = target.base_name.as_str(), service_account = name.as_str());
            match self.client.create(&resources::service_account(target)).await {
                Ok(_) | Err(ControllerError::AlreadyExists(_)) => {},
                Err(e) => return Err(e),
            }
        }

        let has_permissions = target.deployable.containers.iter().any(|container| !container.kubernetes_permissions.is_empty());
        if self.config.security_mode == SecurityMode::Lenient && has_permissions {
            self.submit(resources::role(target)).await?;
            self.submit(resources::role_binding(target, "Role", &target.role_name())).await?;
        }

        if self.config.deployment_mode == DeploymentMode::Cluster {
            for cluster_role in &self.config.cluster_roles {
                self.submit(resources::role_binding(target, "ClusterRole", cluster_role)).await?;
            }
        }
        Ok(())
    }

    /// Register the identity-provider clients of the deployable and store the issued
    /// credentials, returning the client id per container
    async fn register_sso_clients(&self, target: &DeployableTarget<'_>, ingress: Option<&Ingress>) -> Result<BTreeMap<String, String>> {
        let deployable = target.deployable;
        let connection = deployable.sso.as_ref().ok_or_else(|| ControllerError::ConfigurationError(
            format!("deployable {} requires identity-provider clients but declares no identity provider", target.base_name)
        ))?;
        let credentials = self.admin_credentials(&target.namespace, &connection.admin_secret_name).await?;
        let session = self.identity.login(connection, &credentials).await?;
        let mut client_ids = BTreeMap::new();

        if let Some(client_id) = &deployable.public_client_id {
            let host = deployable.ingress.as_ref().map(|ingress| ingress.host_name.as_str()).ok_or_else(|| {
                ControllerError::ConfigurationError(format!("public client {} requires an ingress", client_id))
            })?;
            let client = OidcClient {
                client_id: client_id.clone(),
                public_client: true,
                root_url: Some(format!("https://{}", host)),
                redirect_uris: vec![format!("https://{}/*", host)],
                web_origins: vec![format!("https://{}", host)],
            };
            session.ensure_client(&connection.realm, &client).await?;
            client_ids.insert("public".to_string(), client_id.clone());
        }

        for container in &deployable.containers {
            let Some(requirement) = &container.sso_client else {
                continue;
            };
            let client = confidential_client(&requirement.client_id, &requirement.web_context, deployable, ingress);
            let secret = session.ensure_client(&connection.realm, &client).await?.ok_or_else(|| {
                ControllerError::IdentityProviderError(format!("no secret was issued for client {}", requirement.client_id))
            })?;

            self.submit(resources::sso_secret(target, &container.name, &requirement.client_id, &secret)).await?;
            client_ids.insert(container.name.clone(), requirement.client_id.clone());
        }
        Ok(client_ids)
    }

    async fn admin_credentials(&self, namespace: &str, secret_name: &str) -> Result<AdminCredentials> {
        let secret = self.client.get::<Secret>(namespace, secret_name).await?.ok_or_else(|| {
            ControllerError::ConfigurationError(format!("identity provider admin secret {}/{} does not exist", namespace, secret_name))
        })?;

        let value = |key: &str| -> Result<String> {
            secret.data
                .as_ref()
                .and_then(|data| data.get(key))
                .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
                .or_else(|| secret.string_data.as_ref().and_then(|data| data.get(key).cloned()))
                .ok_or_else(|| ControllerError::ConfigurationError(format!("secret {} has no `{}` key", secret_name, key)))
        };
        Ok(AdminCredentials { username: value("username")?, password: value("password")? })
    }

    /// Poll until exactly one pod of the workload is ready
    async fn await_ready_pod(&self, target: &DeployableTarget<'_>, token: &CancellationToken) -> Result<Pod> {
        loop {
            self.checkpoint(token).await?;
            let mut ready: Vec<Pod> = self.client
                .list::<Pod>(Some(&target.namespace), &target.selector())
                .await?
                .into_iter()
                .filter(is_ready)
                .collect();
            if ready.len() == 1 {
                return Ok(ready.remove(0));
            }
            self.pause(token).await?;
        }
    }

    /// Apply a sub-resource unless the live object was submitted with the same content
    async fn submit<K: NamespacedObject>(&self, mut object: K) -> Result<K> {
        let hash = compute_object_hash(&object)?;
        let namespace = object.namespace().unwrap_or_default();

        if let Some(live) = self.client.get::<K>(&namespace, &object.name_any()).await? {
            if has_spec_hash(live.meta().annotations.as_ref(), &hash) {
                return Ok(live);
            }
        }

        info!(event = "ApplyingResource", kind = %K::kind(&()), name = object.name_any().as_str(), namespace = namespace.as_str());
        annotate_hash(object.meta_mut(), &hash);
        self.client.apply(&object).await
    }

    async fn record<F>(&self, owner: &ObjectReference, qualifier: &str, update: F) -> Result<()>
    where
        F: Fn(&mut ServerStatus) + Send + Sync,
    {
        self.tracker.update_server_status(owner, qualifier, update).await.map(|_| ())
    }

    async fn checkpoint(&self, token: &CancellationToken) -> Result<()> {
        match token.is_cancelled() {
            true => Err(ControllerError::Cancelled(format!("{} deployment", APP_NAME))),
            false => Ok(()),
        }
    }

    async fn pause(&self, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = token.cancelled() => Err(ControllerError::Cancelled(format!("{} deployment", APP_NAME))),
            _ = tokio::time::sleep(Duration::from_millis(self.config.pod_poll_interval_millis)) => Ok(()),
        }
    }
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| conditions.iter().any(|condition| condition.type_ == "Ready" && condition.status == "True"))
}

/// Confidential client of a container. Redirects go to the ingress host over https, with an
/// http fallback when the ingress has exactly one TLS entry.
fn confidential_client(client_id: &str, web_context: &str, deployable: &Deployable, ingress: Option<&Ingress>) -> OidcClient {
    let Some(host) = deployable.ingress.as_ref().map(|requirement| requirement.host_name.clone()) else {
        return OidcClient {
            client_id: client_id.to_string(),
            public_client: false,
            root_url: None,
            redirect_uris: vec![],
            web_origins: vec![],
        };
    };
    let context = web_context.trim_end_matches('/');
    let single_tls = ingress
        .and_then(|ingress| ingress.spec.as_ref())
        .and_then(|spec| spec.tls.as_ref())
        .is_some_and(|tls| tls.len() == 1);

    let mut redirect_uris = vec![format!("https://{}{}/*", host, context)];
    let mut web_origins = vec![format!("https://{}", host)];
    if single_tls {
        redirect_uris.push(format!("http://{}{}/*", host, context));
        web_origins.push(format!("http://{}", host));
    }

    OidcClient {
        client_id: client_id.to_string(),
        public_client: false,
        root_url: Some(format!("https://{}{}", host, context)),
        redirect_uris,
        web_origins,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Endpoints, PersistentVolumeClaim};
    use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use crate::controller::events::NoopEventPublisher;
    use crate::controller::identity::{IdentitySession, MockIdentityProvider, MockIdentitySession};
    use crate::crd::v1alpha1::deployable::{
        DatabaseDependency, DeployableContainer, ExternalService, IngressRequirement, PersistentVolumeSpec,
        SecretTemplate, SsoClientRequirement, SsoConnection,
    };
    use crate::crd::{FailureRecord, DEFAULT_QUALIFIER};
    use crate::testing::InMemoryClient;

    fn owner() -> ObjectReference {
        ObjectReference {
            api_version: Some("apps.example.com/v1".to_string()),
            kind: Some("WebShop".to_string()),
            namespace: Some("apps".to_string()),
            name: Some("shop".to_string()),
            uid: Some("shop-uid".to_string()),
            ..Default::default()
        }
    }

    fn config() -> ControllerConfig {
        ControllerConfig { pod_poll_interval_millis: 10, ..Default::default() }
    }

    fn orchestrator(client: &Arc<InMemoryClient>, identity: MockIdentityProvider, config: ControllerConfig) -> DeploymentOrchestrator<InMemoryClient> {
        client.insert_owner(&owner(), None);
        let tracker = StatusPhaseTracker::new(client.clone(), Arc::new(NoopEventPublisher));
        DeploymentOrchestrator::new(client.clone(), tracker, Arc::new(identity), Arc::new(config))
    }

    fn web() -> DeployableContainer {
        DeployableContainer {
            name: "web".to_string(),
            image: "registry.example.com/shop:1.0".to_string(),
            primary_port: Some(8080),
            service_backing: true,
            volumes: vec![PersistentVolumeSpec {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
                size: "1Gi".to_string(),
                storage_class: None,
                access_mode: "ReadWriteOnce".to_string(),
            }],
            database: Some(DatabaseDependency {
                vendor: "postgresql".to_string(),
                host: "db.apps.svc".to_string(),
                port: 5432,
                database_name: "shop".to_string(),
                schema: "shop".to_string(),
                admin_secret_name: "db-admin".to_string(),
                preparation_command: None,
            }),
            ..Default::default()
        }
    }

    fn deployable() -> Deployable {
        Deployable {
            containers: vec![web()],
            secrets: vec![SecretTemplate {
                name: "shop-config".to_string(),
                string_data: BTreeMap::from([("mode".to_string(), "production".to_string())]),
            }],
            ..Default::default()
        }
    }

    fn sso_deployable() -> Deployable {
        let mut deployable = deployable();
        deployable.containers[0].sso_client = Some(SsoClientRequirement { client_id: "shop-web".to_string(), web_context: "/shop".to_string() });
        deployable.ingress = Some(IngressRequirement {
            host_name: "shop.example.com".to_string(),
            path: "/".to_string(),
            tls_secret_name: Some("shop-tls".to_string()),
            ingress_class: None,
        });
        deployable.sso = Some(SsoConnection {
            base_url: "https://sso.example.com".to_string(),
            realm: "shop".to_string(),
            admin_secret_name: "sso-admin".to_string(),
        });
        deployable.public_client_id = Some("shop-public".to_string());
        deployable
    }

    fn insert_admin_secret(client: &InMemoryClient) {
        client.insert(Secret {
            metadata: ObjectMeta { name: Some("sso-admin".to_string()), namespace: Some("apps".to_string()), ..Default::default() },
            string_data: Some(BTreeMap::from([
                ("username".to_string(), "admin".to_string()),
                ("password".to_string(), "hunter2".to_string()),
            ])),
            ..Default::default()
        });
    }

    fn position(calls: &[String], prefix: &str) -> usize {
        calls.iter().position(|call| call.starts_with(prefix)).unwrap_or_else(|| panic!("no call {}", prefix))
    }

    #[tokio::test]
    async fn external_literal_gets_cluster_ip_service_and_endpoints() {
        let client = Arc::new(InMemoryClient::new());
        let orchestrator = orchestrator(&client, MockIdentityProvider::new(), config());
        let external = Deployable {
            external_service: Some(ExternalService { host: "192.168.1.5".to_string(), port: 5432 }),
            ..Default::default()
        };

        let result = orchestrator.run(&owner(), &external, Duration::from_secs(5)).await.unwrap();

        let spec = result.service.unwrap().spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let endpoints = client.object::<Endpoints>("apps", "shop-service").unwrap();
        assert_eq!(endpoints.subsets.unwrap()[0].addresses.clone().unwrap()[0].ip, "192.168.1.5");
        let status = result.status.unwrap();
        assert_eq!(status.phase, Phase::Successful);
        assert_eq!(status.server_status(None).unwrap().service_name.as_deref(), Some("shop-service"));
        assert!(result.deployment.is_none());
    }

    #[tokio::test]
    async fn external_dns_name_gets_external_name_service_only() {
        let client = Arc::new(InMemoryClient::new());
        let orchestrator = orchestrator(&client, MockIdentityProvider::new(), config());
        let external = Deployable {
            external_service: Some(ExternalService { host: "myhost.example.com".to_string(), port: 5432 }),
            ..Default::default()
        };

        let result = orchestrator.run(&owner(), &external, Duration::from_secs(5)).await.unwrap();

        let spec = result.service.unwrap().spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ExternalName"));
        assert_eq!(spec.external_name.as_deref(), Some("myhost.example.com"));
        assert!(client.objects::<Endpoints>().is_empty());
    }

    #[tokio::test]
    async fn switching_to_a_dns_name_removes_the_endpoints() {
        let client = Arc::new(InMemoryClient::new());
        let orchestrator = orchestrator(&client, MockIdentityProvider::new(), config());
        let literal = Deployable {
            external_service: Some(ExternalService { host: "192.168.1.5".to_string(), port: 5432 }),
            ..Default::default()
        };
        let named = Deployable {
            external_service: Some(ExternalService { host: "myhost.example.com".to_string(), port: 5432 }),
            ..Default::default()
        };

        orchestrator.run(&owner(), &literal, Duration::from_secs(5)).await.unwrap();
        assert!(client.object::<Endpoints>("apps", "shop-service").is_some());
        let result = orchestrator.run(&owner(), &named, Duration::from_secs(5)).await.unwrap();

        assert_eq!(result.service.unwrap().spec.unwrap().type_.as_deref(), Some("ExternalName"));
        assert!(client.objects::<Endpoints>().is_empty());
        assert!(client.called("delete Endpoints apps/shop-service"));
    }

    #[tokio::test]
    async fn pipeline_runs_every_step_in_order() {
        let client = Arc::new(InMemoryClient::new());
        insert_admin_secret(&client);
        let mut identity = MockIdentityProvider::new();
        identity.expect_login()
            .withf(|connection, credentials| connection.realm == "shop" && credentials.username == "admin")
            .times(1)
            .return_once(|_, _| {
                let mut session = MockIdentitySession::new();
                session.expect_ensure_client()
                    .returning(|_, client| Ok((!client.public_client).then(|| "s3cr3t".to_string())));
                Ok(Box::new(session) as Box<dyn IdentitySession>)
            });
        let orchestrator = orchestrator(&client, identity, config());

        let result = orchestrator.run(&owner(), &sso_deployable(), Duration::from_secs(5)).await.unwrap();

        let calls = client.calls();
        let order = [
            "create Pod apps/shop-db-preparation",
            "apply PersistentVolumeClaim apps/shop-web-data",
            "apply Secret apps/shop-config",
            "create ServiceAccount apps/shop-sa",
            "apply Service apps/shop-service",
            "apply Ingress apps/shop-ingress",
            "apply Secret apps/shop-web-sso-secret",
            "apply Deployment apps/shop-deployment",
        ];
        let positions: Vec<usize> = order.iter().map(|call| position(&calls, call)).collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", calls);

        assert!(result.deployment.is_some() && result.service.is_some() && result.ingress.is_some());
        assert!(result.pod.is_some());
        assert!(client.object::<Pod>("apps", "shop-db-preparation").is_none());

        let sso_secret = client.object::<Secret>("apps", "shop-web-sso-secret").unwrap();
        assert_eq!(sso_secret.string_data.unwrap()["clientSecret"], "s3cr3t");

        let status = client.status_of(&owner()).unwrap();
        assert_eq!(status.phase, Phase::Successful);
        let server = status.server_status(Some(DEFAULT_QUALIFIER)).unwrap();
        assert_eq!(server.preparation_pod_phase.as_deref(), Some("Succeeded"));
        assert_eq!(server.pod_phase.as_deref(), Some("Running"));
        assert_eq!(server.sso_client_ids["web"], "shop-web");
        assert_eq!(server.sso_client_ids["public"], "shop-public");
        assert!(server.pvc_phases.contains_key("shop-web-data"));
        assert_eq!(server.secret_names, vec!["shop-config".to_string()]);
    }

    #[tokio::test]
    async fn service_account_failure_stops_the_pipeline() {
        let client = Arc::new(InMemoryClient::new());
        client.fail_on::<ServiceAccount>("service accounts are forbidden here");
        let orchestrator = orchestrator(&client, MockIdentityProvider::new(), config());

        let result = orchestrator.run(&owner(), &deployable(), Duration::from_secs(5)).await.unwrap();

        assert!(client.object::<PersistentVolumeClaim>("apps", "shop-web-data").is_some());
        assert!(client.object::<Secret>("apps", "shop-config").is_some());
        assert!(!client.called("apply Service"));
        assert!(!client.called("apply Deployment"));
        assert!(result.deployment.is_none() && result.service.is_none() && result.pod.is_none());

        let status = result.status.unwrap();
        assert_eq!(status.phase, Phase::Failed);
        let failure = status.first_failure().unwrap();
        assert!(failure.message.starts_with("service-account failed"), "{}", failure.message);
        assert_eq!(failure.failed_object_name, "shop");
    }

    #[tokio::test]
    async fn failed_preparation_aborts_before_volumes() {
        let client = Arc::new(InMemoryClient::new());
        client.set_preparation_pod_phase("Failed");
        let orchestrator = orchestrator(&client, MockIdentityProvider::new(), config());

        let result = orchestrator.run(&owner(), &deployable(), Duration::from_secs(5)).await.unwrap();

        let status = result.status.unwrap();
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.server_status(None).unwrap().preparation_pod_phase.as_deref(), Some("Failed"));
        assert!(!client.called("apply PersistentVolumeClaim"));
    }

    #[tokio::test]
    async fn times_out_waiting_for_a_ready_pod() {
        let client = Arc::new(InMemoryClient::new());
        client.set_auto_ready_pods(false);
        let orchestrator = orchestrator(&client, MockIdentityProvider::new(), config());

        let error = orchestrator.run(&owner(), &deployable(), Duration::from_millis(300)).await.unwrap_err();

        assert!(matches!(error, ControllerError::Timeout { .. }));
        let status = client.status_of(&owner()).unwrap();
        assert_eq!(status.phase, Phase::Failed);
        assert!(status.first_failure().unwrap().message.contains("timed out"));
    }

    #[tokio::test]
    async fn unchanged_resources_are_not_resubmitted() {
        let client = Arc::new(InMemoryClient::new());
        let orchestrator = orchestrator(&client, MockIdentityProvider::new(), config());

        orchestrator.run(&owner(), &deployable(), Duration::from_secs(5)).await.unwrap();
        orchestrator.run(&owner(), &deployable(), Duration::from_secs(5)).await.unwrap();

        let applies = client.calls().iter().filter(|call| call.starts_with("apply Deployment")).count();
        assert_eq!(applies, 1);
    }

    #[tokio::test]
    async fn lenient_cluster_mode_grants_roles() {
        let client = Arc::new(InMemoryClient::new());
        let config = ControllerConfig {
            security_mode: SecurityMode::Lenient,
            deployment_mode: DeploymentMode::Cluster,
            ..config()
        };
        let orchestrator = orchestrator(&client, MockIdentityProvider::new(), config);
        let mut deployable = deployable();
        deployable.containers[0].kubernetes_permissions = vec![crate::crd::v1alpha1::deployable::KubernetesPermission {
            api_group: "".to_string(),
            resource: "configmaps".to_string(),
            verbs: vec!["get".to_string()],
        }];

        orchestrator.run(&owner(), &deployable, Duration::from_secs(5)).await.unwrap();

        assert!(client.object::<Role>("apps", "shop-role").is_some());
        let bindings = client.objects::<RoleBinding>();
        let kinds: Vec<&str> = bindings.iter().map(|binding| binding.role_ref.kind.as_str()).collect();
        assert_eq!(bindings.len(), 2);
        assert!(kinds.contains(&"Role") && kinds.contains(&"ClusterRole"));
    }

    #[tokio::test]
    async fn redeploy_of_a_failed_owner_clears_the_failure() {
        let client = Arc::new(InMemoryClient::new());
        let orchestrator = orchestrator(&client, MockIdentityProvider::new(), config());
        client.insert_owner(&owner(), Some(ProvisioningStatus {
            phase: Phase::Failed,
            server_statuses: BTreeMap::from([(DEFAULT_QUALIFIER.to_string(), ServerStatus {
                failure: Some(FailureRecord {
                    failed_object_kind: "WebShop".to_string(),
                    failed_object_namespace: Some("apps".to_string()),
                    failed_object_name: "shop".to_string(),
                    message: "earlier failure".to_string(),
                    detail: None,
                }),
                ..Default::default()
            })]),
            ..Default::default()
        }));

        let result = orchestrator.run(&owner(), &deployable(), Duration::from_secs(5)).await.unwrap();

        let status = result.status.unwrap();
        assert_eq!(status.phase, Phase::Successful);
        assert!(status.first_failure().is_none());
    }

    #[test]
    fn confidential_client_redirects() {
        let deployable = sso_deployable();
        let ingress = Ingress {
            spec: Some(k8s_openapi::api::networking::v1::IngressSpec {
                tls: Some(vec![Default::default()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let with_fallback = confidential_client("shop-web", "/shop/", &deployable, Some(&ingress));
        assert_eq!(with_fallback.redirect_uris, vec![
            "https://shop.example.com/shop/*".to_string(),
            "http://shop.example.com/shop/*".to_string(),
        ]);

        let https_only = confidential_client("shop-web", "/", &deployable, None);
        assert_eq!(https_only.redirect_uris, vec!["https://shop.example.com/*".to_string()]);
        assert_eq!(https_only.web_origins, vec!["https://shop.example.com".to_string()]);
    }
}
