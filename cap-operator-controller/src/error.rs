// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::result;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("kubernetes api error: {0}")]
    KubeError(#[from] kube::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("missing object key: {0}")]
    MissingObjectKeyError(&'static str),
    #[error("invalid capability requirement: {0}")]
    ConfigurationError(String),
    #[error("capability {capability} was provisioned for scope {found}, but the requirement accepts {requested}")]
    ScopeMismatch { capability: String, found: String, requested: String },
    #[error("capability {capability} is implemented by {found}, but {requested} was requested")]
    ImplementationMismatch { capability: String, found: String, requested: String },
    #[error("provisioning of {resource} failed: {reason}")]
    ProvisioningFailed { resource: String, reason: String },
    #[error("timed out waiting for {resource}, check that the {controller} is running")]
    Timeout { resource: String, controller: String },
    #[error("operation on {0} was cancelled")]
    Cancelled(String),
    #[error("gave up updating the status of {resource} after {attempts} conflicting writes")]
    StatusConflict { resource: String, attempts: u32 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("contract violation: {0}")]
    ContractViolation(String),
    #[error("identity provider error: {0}")]
    IdentityProviderError(String),
    #[error("watch error: {0}")]
    WatchError(String),
    #[error("unknown error: {0}")]
    UnknownError(String),
}

impl ControllerError {
    /// Classify a Kubernetes API error by its status code. Not-found is never mapped
    /// here since lookups report absence as `None`.
    pub fn from_kube(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) if response.code == 403 => ControllerError::Forbidden(response.message.clone()),
            kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
                ControllerError::AlreadyExists(response.message.clone())
            },
            kube::Error::Api(response) if response.code == 409 => ControllerError::Conflict(response.message.clone()),
            other => ControllerError::KubeError(other),
        }
    }

    /// Timeouts and cancellations abort a deployment instead of being recorded as a step failure
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ControllerError::Timeout { .. } | ControllerError::Cancelled(_))
    }
}

impl From<reqwest::Error> for ControllerError {
    fn from(error: reqwest::Error) -> Self {
        ControllerError::IdentityProviderError(error.to_string())
    }
}

pub type Result<T> = result::Result<T, ControllerError>;
