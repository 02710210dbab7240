// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::sync::Arc;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use cap_operator_common::telemetry::info;

use crate::controller::client::ResourceClient;
use crate::controller::resources::DeployableTarget;
use crate::crd::v1alpha1::deployable::ExternalService;
use crate::error::Result;

const EXTERNAL_PORT_NAME: &str = "external-port";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Ipv4,
    Ipv6,
    Dns,
}

impl HostKind {
    pub fn is_literal(&self) -> bool {
        !matches!(self, HostKind::Dns)
    }
}

/// Classify a host as an IPv4 literal (four dot-separated integers 0-255), an IPv6 literal
/// (eight colon-separated groups of hex digits) or a DNS name
pub fn classify_host(host: &str) -> HostKind {
    let octets: Vec<&str> = host.split('.').collect();
    if octets.len() == 4 && octets.iter().all(|octet| {
        !octet.is_empty() && octet.chars().all(|c| c.is_ascii_digit()) && octet.parse::<u8>().is_ok()
    }) {
        return HostKind::Ipv4;
    }

    let groups: Vec<&str> = host.split(':').collect();
    if groups.len() == 8 && groups.iter().all(|group| (1..=4).contains(&group.len()) && group.chars().all(|c| c.is_ascii_hexdigit())) {
        return HostKind::Ipv6;
    }

    HostKind::Dns
}

/// Makes a service outside the cluster reachable through an in-cluster Service
pub struct ExternalServiceBinder<C> {
    client: Arc<C>,
}

impl<C: ResourceClient> ExternalServiceBinder<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Create or replace the Service pointing at `external`. A literal address gets a
    /// ClusterIP Service backed by a matching Endpoints object, a DNS name an ExternalName
    /// Service and no Endpoints object.
    ///
    /// # Arguments
    /// * `target` - The deployable the service is created for
    /// * `external` - The host and port outside the cluster
    ///
    /// # Returns
    /// The service as applied
    pub async fn bind(&self, target: &DeployableTarget<'_>, external: &ExternalService) -> Result<Service> {
        let kind = classify_host(&external.host);
        info!(
            event = "BindingExternalService",
            service = target.service_name(),
            host = external.host.as_str(),
            literal = kind.is_literal(),
        );

        let port = ServicePort {
            name: Some(EXTERNAL_PORT_NAME.to_string()),
            port: external.port,
            target_port: Some(IntOrString::Int(external.port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        };

        if !kind.is_literal() {
            let service = Service {
                metadata: target.metadata(&target.service_name()),
                spec: Some(ServiceSpec {
                    type_: Some("ExternalName".to_string()),
                    external_name: Some(external.host.clone()),
                    ports: Some(vec![port]),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let service = self.client.apply(&service).await?;
            // Left over when the host was a literal address before
            self.client.delete::<Endpoints>(&target.namespace, &target.service_name()).await?;
            return Ok(service);
        }

        // Without a selector the Service routes to the Endpoints object of the same name
        let service = Service {
            metadata: target.metadata(&target.service_name()),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ports: Some(vec![port]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let endpoints = Endpoints {
            metadata: target.metadata(&target.service_name()),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress { ip: external.host.clone(), ..Default::default() }]),
                ports: Some(vec![EndpointPort {
                    name: Some(EXTERNAL_PORT_NAME.to_string()),
                    port: external.port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        };

        let service = self.client.apply(&service).await?;
        self.client.apply(&endpoints).await?;
        Ok(service)
    }
}
