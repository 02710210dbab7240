// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::{collections::BTreeMap, fmt::{Display, Formatter, Result as FmtResult}, str::FromStr};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Qualifier of the server status used when a deployable does not name one
pub const DEFAULT_QUALIFIER: &str = "server";

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StandardCapability {
    Dbms,
    Sso,
}

impl StandardCapability {
    /// Lower-case form used in resource names and label values
    pub fn as_str(&self) -> &'static str {
        match self {
            StandardCapability::Dbms => "dbms",
            StandardCapability::Sso => "sso",
        }
    }

    /// Suffix appended to the requester's name for dedicated capabilities
    pub fn suffix(&self) -> &'static str {
        match self {
            StandardCapability::Dbms => "db",
            StandardCapability::Sso => "sso",
        }
    }
}

impl Display for StandardCapability {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StandardCapabilityImplementation {
    Mysql,
    Postgresql,
    Oracle,
    Keycloak,
    RedhatSso,
}

impl StandardCapabilityImplementation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StandardCapabilityImplementation::Mysql => "mysql",
            StandardCapabilityImplementation::Postgresql => "postgresql",
            StandardCapabilityImplementation::Oracle => "oracle",
            StandardCapabilityImplementation::Keycloak => "keycloak",
            StandardCapabilityImplementation::RedhatSso => "redhat-sso",
        }
    }
}

impl Display for StandardCapabilityImplementation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StandardCapabilityImplementation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mysql" => Ok(StandardCapabilityImplementation::Mysql),
            "postgresql" => Ok(StandardCapabilityImplementation::Postgresql),
            "oracle" => Ok(StandardCapabilityImplementation::Oracle),
            "keycloak" => Ok(StandardCapabilityImplementation::Keycloak),
            "redhat-sso" => Ok(StandardCapabilityImplementation::RedhatSso),
            other => Err(format!("unknown capability implementation `{}`", other)),
        }
    }
}

/// Sharing boundary of a capability
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityScope {
    Dedicated,
    Specified,
    Labeled,
    Namespace,
    Cluster,
}

impl CapabilityScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityScope::Dedicated => "dedicated",
            CapabilityScope::Specified => "specified",
            CapabilityScope::Labeled => "labeled",
            CapabilityScope::Namespace => "namespace",
            CapabilityScope::Cluster => "cluster",
        }
    }
}

impl Display for CapabilityScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CapabilityScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "dedicated" => Ok(CapabilityScope::Dedicated),
            "specified" => Ok(CapabilityScope::Specified),
            "labeled" => Ok(CapabilityScope::Labeled),
            "namespace" => Ok(CapabilityScope::Namespace),
            "cluster" => Ok(CapabilityScope::Cluster),
            other => Err(format!("unknown capability scope `{}`", other)),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
pub struct ResourceReference {
    /// Namespace of the referenced resource, the requester's namespace when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// Lifecycle of a provisioning or deployment operation
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Requested,
    Started,
    Successful,
    Failed,
    Ignored,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Successful | Phase::Failed | Phase::Ignored)
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Phase::Requested => write!(f, "requested"),
            Phase::Started => write!(f, "started"),
            Phase::Successful => write!(f, "successful"),
            Phase::Failed => write!(f, "failed"),
            Phase::Ignored => write!(f, "ignored"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub failed_object_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_object_namespace: Option<String>,
    pub failed_object_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_secret_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secret_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preparation_pod_phase: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pvc_phases: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub sso_client_ids: BTreeMap<String, String>,
    /// Values derived while provisioning, such as the resolved database name or vendor
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub derived_parameters: BTreeMap<String, String>,
    // Serialized as null when cleared so that merge patches remove it
    pub failure: Option<FailureRecord>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisioningStatus {
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    pub server_statuses: BTreeMap<String, ServerStatus>,
}

impl ProvisioningStatus {
    pub fn has_failed(&self) -> bool {
        self.phase == Phase::Failed
    }

    /// The server status for `qualifier`, falling back to the default qualifier and then
    /// to the first recorded server
    pub fn server_status(&self, qualifier: Option<&str>) -> Option<&ServerStatus> {
        match qualifier {
            Some(qualifier) => self.server_statuses.get(qualifier),
            None => self.server_statuses
                .get(DEFAULT_QUALIFIER)
                .or_else(|| self.server_statuses.values().next()),
        }
    }

    pub fn first_failure(&self) -> Option<&FailureRecord> {
        self.server_statuses.values().find_map(|server| server.failure.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases() {
        assert!(!Phase::Requested.is_terminal());
        assert!(!Phase::Started.is_terminal());
        assert!(Phase::Successful.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::Ignored.is_terminal());
    }

    #[test]
    fn scope_label_values_parse_back() {
        for scope in [
            CapabilityScope::Dedicated,
            CapabilityScope::Specified,
            CapabilityScope::Labeled,
            CapabilityScope::Namespace,
            CapabilityScope::Cluster,
        ] {
            assert_eq!(scope.as_str().parse::<CapabilityScope>(), Ok(scope));
        }
        assert!("global".parse::<CapabilityScope>().is_err());
    }

    #[test]
    fn cleared_failure_serializes_as_null() {
        let value = serde_json::to_value(ServerStatus::default()).unwrap();

        assert_eq!(value, serde_json::json!({ "failure": null }));
    }

    #[test]
    fn server_status_falls_back_to_default_qualifier() {
        let status = ProvisioningStatus {
            server_statuses: BTreeMap::from([
                ("db".to_string(), ServerStatus { service_name: Some("db".to_string()), ..Default::default() }),
                (DEFAULT_QUALIFIER.to_string(), ServerStatus { service_name: Some("main".to_string()), ..Default::default() }),
            ]),
            ..Default::default()
        };

        assert_eq!(status.server_status(None).and_then(|s| s.service_name.as_deref()), Some("main"));
        assert_eq!(status.server_status(Some("db")).and_then(|s| s.service_name.as_deref()), Some("db"));
        assert!(status.server_status(Some("missing")).is_none());
    }
}
