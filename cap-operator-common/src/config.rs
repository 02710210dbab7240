// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::path::Path;
use serde::{Serialize, Deserialize};
use figment::{Figment, Error, providers::{Format, Json, Toml, Yaml, Env, Serialized}};

use crate::constant::ENV_PREFIX;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub command: CommandConfig,
}

/// Controls whether deployables get a namespaced Role derived from their containers'
/// declared Kubernetes permissions.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    #[default]
    Strict,
    Lenient,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Namespaced,
    Cluster,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ControllerConfig {
    /// Namespace the operator runs in, home of cluster-scoped capabilities
    pub operator_namespace: String,
    /// Namespaces searched for cluster-scoped capabilities, all readable namespaces when empty
    pub observed_namespaces: Vec<String>,
    pub security_mode: SecurityMode,
    pub deployment_mode: DeploymentMode,
    /// Cluster roles bound to service accounts when running in cluster mode
    pub cluster_roles: Vec<String>,
    /// Scales every container startup budget, for slow clusters
    pub timeout_adjustment_ratio: f64,
    pub startup_probes_supported: bool,
    pub allowed_probe_failures: u32,
    pub capability_timeout_seconds: u64,
    pub deployment_timeout_seconds: u64,
    pub pod_poll_interval_millis: u64,
    pub delete_preparation_pods: bool,
    pub preparation_image: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            operator_namespace: "default".to_string(),
            observed_namespaces: vec![],
            security_mode: SecurityMode::Strict,
            deployment_mode: DeploymentMode::Namespaced,
            cluster_roles: vec!["view".to_string()],
            timeout_adjustment_ratio: 1.0,
            startup_probes_supported: true,
            allowed_probe_failures: 6,
            capability_timeout_seconds: 600,
            deployment_timeout_seconds: 1200,
            pod_poll_interval_millis: 1000,
            delete_preparation_pods: true,
            preparation_image: "docker.io/library/postgres:16-alpine".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommandConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls: TLSConfig,
}

impl Default for CommandConfig {
    fn default() -> Self {
        CommandConfig {
            host: "0.0.0.0".to_string(),
            port: 8443,
            tls: TLSConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TLSConfig {
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

impl Default for TLSConfig {
    fn default() -> Self {
        TLSConfig {
            cert_file: "/etc/ssl/certs/tls.crt".to_string(),
            key_file: "/etc/ssl/certs/tls.key".to_string(),
        }
    }
}

pub struct AppConfigBuilder {
    figment: Figment,
}

impl AppConfigBuilder {
    pub fn with_file(&mut self, path: &str) -> &mut Self {
        let extension = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();

        self.figment = match extension {
            "json" => self.figment.clone().merge(Json::file(path)),
            "yaml" | "yml" => self.figment.clone().merge(Yaml::file(path)),
            "toml" => self.figment.clone().merge(Toml::file(path)),
            _ => self.figment.clone(),
        };
        self
    }

    pub fn with_env(&mut self) -> &mut Self {
        self.figment = self.figment.clone().merge(
            Env::prefixed(&format!("{}__", ENV_PREFIX)).split("__")
        );
        self
    }

    pub fn with_override_option(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.figment = self.figment.clone().merge(Serialized::default(key, value));
        }
        self
    }

    pub fn build(&self) -> Result<AppConfig, Error> {
        self.figment.extract()
    }
}

impl Default for AppConfigBuilder {
    fn default() -> Self {
        AppConfigBuilder {
            figment: Figment::from(Serialized::defaults(AppConfig::default()))
        }
    }
}
