// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::collections::BTreeMap;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::v1alpha1::common::{
    CapabilityScope, Phase, ProvisioningStatus, ResourceReference,
    StandardCapability, StandardCapabilityImplementation,
};
use crate::crd::v1alpha1::deployable::Deployable;

/// Requests a shared infrastructure capability. Persisted as the spec of a
/// ProvidedCapability once no existing capability satisfies it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "ProvidedCapability",
    group = "capability.dev",
    version = "v1alpha1",
    status = "ProvisioningStatus",
    doc = "ProvidedCapability records a shared capability instance and its provisioning status.",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase", "type":"string", "description":"Current phase of the capability", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Capability", "type":"string", "description":"Capability provided", "jsonPath":".spec.capability"}"#,
    printcolumn = r#"{"name":"Implementation", "type":"string", "description":"Implementation of the capability", "jsonPath":".spec.implementation"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRequirement {
    /// The kind of capability required
    pub capability: StandardCapability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// The implementation required, any implementation when omitted
    pub implementation: Option<StandardCapabilityImplementation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// Acceptable resolution scopes in order of preference, `[NAMESPACE]` when empty
    pub resolution_scope_preference: Vec<CapabilityScope>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    /// Labels selecting the capability, required for the LABELED scope
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Explicit capability reference, required for the SPECIFIED scope
    pub specified_capability: Option<ResourceReference>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    /// Free-form parameters passed on to the provisioning controller
    pub capability_parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// How to fulfil the capability when it has to be created
    pub deployable: Option<Deployable>,
}

impl CapabilityRequirement {
    pub fn new(capability: StandardCapability) -> Self {
        CapabilityRequirement {
            capability,
            implementation: None,
            resolution_scope_preference: vec![],
            selector: BTreeMap::new(),
            specified_capability: None,
            capability_parameters: BTreeMap::new(),
            deployable: None,
        }
    }

    pub fn with_implementation(mut self, implementation: StandardCapabilityImplementation) -> Self {
        self.implementation = Some(implementation);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<CapabilityScope>) -> Self {
        self.resolution_scope_preference = scopes;
        self
    }

    pub fn with_selector(mut self, selector: BTreeMap<String, String>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_specified_capability(mut self, reference: ResourceReference) -> Self {
        self.specified_capability = Some(reference);
        self
    }

    pub fn with_deployable(mut self, deployable: Deployable) -> Self {
        self.deployable = Some(deployable);
        self
    }

    pub fn scopes(&self) -> Vec<CapabilityScope> {
        match self.resolution_scope_preference.is_empty() {
            true => vec![CapabilityScope::Namespace],
            false => self.resolution_scope_preference.clone(),
        }
    }

    /// Name of the controller expected to bring a newly created capability to a terminal phase
    pub fn expected_controller(&self) -> String {
        match (&self.deployable, &self.implementation) {
            (Some(_), _) => format!("{} controller", cap_operator_common::constant::APP_NAME),
            (None, Some(implementation)) => format!("{} controller", implementation),
            (None, None) => format!("{} capability controller", self.capability),
        }
    }
}

impl ProvidedCapability {
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|status| status.phase).unwrap_or_default()
    }
}
