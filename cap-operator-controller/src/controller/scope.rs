// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::collections::BTreeMap;
use k8s_openapi::api::core::v1::ObjectReference;
use rand::Rng;

use crate::crd::{CapabilityRequirement, CapabilityScope, ProvidedCapability};
use crate::error::{ControllerError, Result};

pub static CAPABILITY_LABEL: &str = "capability.dev/capability";
pub static IMPLEMENTATION_LABEL: &str = "capability.dev/implementation";
pub static SCOPE_LABEL: &str = "capability.dev/provision-scope";

/// How an existing capability is located for a scope
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityKey {
    /// Exact name in one namespace
    ByName { namespace: String, name: String },
    /// Label match restricted to one namespace
    ByLabels { namespace: String, labels: BTreeMap<String, String> },
    /// Label match in every namespace the operator can read, first match wins
    ClusterWide { labels: BTreeMap<String, String> },
}

/// Where and under which labels a new capability is created for a scope
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityIdentity {
    pub scope: CapabilityScope,
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Maps a capability requirement onto canonical names and labels per scope
#[derive(Debug, Clone)]
pub struct ScopeNamer {
    operator_namespace: String,
}

impl ScopeNamer {
    pub fn new(operator_namespace: &str) -> Self {
        Self { operator_namespace: operator_namespace.to_string() }
    }

    /// Compute the identity of the capability to create for `scope`
    ///
    /// # Arguments
    /// * `requester` - The resource requesting the capability
    /// * `requirement` - The capability requirement
    /// * `scope` - The scope the capability is created for
    ///
    /// # Returns
    /// The namespace, name and labels of the new capability, or a configuration error when the
    /// requirement lacks what the scope needs
    pub fn identity(&self, requester: &ObjectReference, requirement: &CapabilityRequirement, scope: CapabilityScope) -> Result<CapabilityIdentity> {
        let requester_namespace = requester_namespace(requester)?;
        let capability = requirement.capability.as_str();
        let implementation = requirement.implementation.map(|implementation| implementation.as_str());

        let mut labels = capability_labels(requirement);
        if let Some(implementation) = implementation {
            labels.insert(IMPLEMENTATION_LABEL.to_string(), implementation.to_string());
        }
        labels.insert(SCOPE_LABEL.to_string(), scope.as_str().to_string());

        let (namespace, name) = match scope {
            CapabilityScope::Dedicated => {
                let requester_name = requester.name.as_deref()
                    .ok_or(ControllerError::MissingObjectKeyError("Expected the requester to have a name"))?;
                (requester_namespace, format!("{}-{}", requester_name, requirement.capability.suffix()))
            },
            CapabilityScope::Specified => {
                let reference = specified_reference(requirement)?;
                (reference.namespace.clone().unwrap_or(requester_namespace), reference.name.clone())
            },
            CapabilityScope::Labeled => {
                labels.extend(required_selector(requirement)?.clone());
                let suffix = rand::thread_rng().gen_range(0..10_000);
                let name = match implementation {
                    Some(implementation) => format!("{}-{}-{:04}", implementation, capability, suffix),
                    None => format!("{}-{:04}", capability, suffix),
                };
                (requester_namespace, name)
            },
            CapabilityScope::Namespace => (requester_namespace, default_name(implementation, capability, "namespace")),
            CapabilityScope::Cluster => (self.operator_namespace.clone(), default_name(implementation, capability, "cluster")),
        };

        Ok(CapabilityIdentity { scope, namespace, name, labels })
    }

    /// Compute how to look up an existing capability for `scope`
    ///
    /// NAMESPACE and CLUSTER lookups match the capability kind and the provisioned scope, so a
    /// dedicated or namespaced capability never shadows a wider scope. LABELED lookups match
    /// the kind and the selector only, a capability found that way with another scope is
    /// reported as a mismatch. The implementation is never part of the key, a found capability
    /// is validated against it instead.
    pub fn lookup_key(&self, requester: &ObjectReference, requirement: &CapabilityRequirement, scope: CapabilityScope) -> Result<CapabilityKey> {
        let requester_namespace = requester_namespace(requester)?;
        let labels = capability_labels(requirement);
        let scoped = || {
            let mut labels = capability_labels(requirement);
            labels.insert(SCOPE_LABEL.to_string(), scope.as_str().to_string());
            labels
        };

        Ok(match scope {
            CapabilityScope::Dedicated | CapabilityScope::Specified => {
                let identity = self.identity(requester, requirement, scope)?;
                CapabilityKey::ByName { namespace: identity.namespace, name: identity.name }
            },
            CapabilityScope::Labeled => {
                let mut labels = labels;
                labels.extend(required_selector(requirement)?.clone());
                CapabilityKey::ClusterWide { labels }
            },
            CapabilityScope::Namespace => CapabilityKey::ByLabels { namespace: requester_namespace, labels: scoped() },
            CapabilityScope::Cluster => CapabilityKey::ClusterWide { labels: scoped() },
        })
    }
}

/// The scope a capability was provisioned for, read from its labels
pub fn provisioned_scope(capability: &ProvidedCapability) -> Option<&str> {
    capability.metadata.labels.as_ref()?.get(SCOPE_LABEL).map(String::as_str)
}

/// The implementation a capability was provisioned with, read from its labels
pub fn provisioned_implementation(capability: &ProvidedCapability) -> Option<&str> {
    capability.metadata.labels.as_ref()?.get(IMPLEMENTATION_LABEL).map(String::as_str)
}

fn capability_labels(requirement: &CapabilityRequirement) -> BTreeMap<String, String> {
    BTreeMap::from([(CAPABILITY_LABEL.to_string(), requirement.capability.as_str().to_string())])
}

fn default_name(implementation: Option<&str>, capability: &str, boundary: &str) -> String {
    match implementation {
        Some(implementation) => format!("default-{}-{}-in-{}", implementation, capability, boundary),
        None => format!("default-{}-in-{}", capability, boundary),
    }
}

fn requester_namespace(requester: &ObjectReference) -> Result<String> {
    requester.namespace.clone()
        .ok_or(ControllerError::MissingObjectKeyError("Expected the requester to be namespaced"))
}

fn specified_reference(requirement: &CapabilityRequirement) -> Result<&crate::crd::ResourceReference> {
    requirement.specified_capability
        .as_ref()
        .filter(|reference| !reference.name.is_empty())
        .ok_or_else(|| ControllerError::ConfigurationError(
            "a SPECIFIED capability requirement needs a specifiedCapability reference".to_string()
        ))
}

fn required_selector(requirement: &CapabilityRequirement) -> Result<&BTreeMap<String, String>> {
    match requirement.selector.is_empty() {
        true => Err(ControllerError::ConfigurationError(
            "a LABELED capability requirement needs a non-empty selector".to_string()
        )),
        false => Ok(&requirement.selector),
    }
}
