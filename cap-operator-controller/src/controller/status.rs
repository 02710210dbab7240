// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::sync::Arc;
use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;

use cap_operator_common::telemetry::{debug, info, warn};

use crate::controller::client::ResourceClient;
use crate::controller::events::{reasons, EventPublisher};
use crate::controller::utils::describe;
use crate::crd::{FailureRecord, Phase, ProvisioningStatus, ServerStatus};
use crate::error::{ControllerError, Result};

const MAX_ATTEMPTS: u32 = 4;

/// Applies phase transitions and failures to the status of an owning resource. Every write is a
/// read-modify-write guarded by the resource version and retried on conflict, since several
/// deployables of one owner may report at the same time.
pub struct StatusPhaseTracker<C> {
    client: Arc<C>,
    events: Arc<dyn EventPublisher>,
    max_attempts: u32,
}

impl<C> Clone for StatusPhaseTracker<C> {
    fn clone(&self) -> Self {
        Self { client: self.client.clone(), events: self.events.clone(), max_attempts: self.max_attempts }
    }
}

impl<C: ResourceClient> StatusPhaseTracker<C> {
    pub fn new(client: Arc<C>, events: Arc<dyn EventPublisher>) -> Self {
        Self { client, events, max_attempts: MAX_ATTEMPTS }
    }

    /// Move the owner to `phase`. Entering STARTED clears every recorded failure so that a
    /// forced redeploy of a failed resource starts clean, while SUCCESSFUL never hides a
    /// failure another deployable of the same owner recorded.
    pub async fn update_phase(&self, target: &ObjectReference, phase: Phase) -> Result<ProvisioningStatus> {
        let status = self.mutate(target, |status| {
            match phase {
                Phase::Started => status.server_statuses.values_mut().for_each(|server| server.failure = None),
                Phase::Successful if status.first_failure().is_some() => {
                    status.phase = Phase::Failed;
                    return;
                },
                _ => {},
            }
            status.phase = phase;
        }).await?;

        self.events.publish(
            target,
            EventType::Normal,
            reasons::PHASE_CHANGED,
            Some(format!("{} moved to phase {}", describe(target), status.phase)),
        ).await;
        Ok(status)
    }

    /// Apply `update` to the server status of `qualifier`, creating it when absent
    ///
    /// # Arguments
    /// * `target` - The owning resource
    /// * `qualifier` - The server the update concerns
    /// * `update` - The mutation, re-applied on every retry
    ///
    /// # Returns
    /// The status as written
    pub async fn update_server_status<F>(&self, target: &ObjectReference, qualifier: &str, update: F) -> Result<ProvisioningStatus>
    where
        F: Fn(&mut ServerStatus) + Send + Sync,
    {
        let status = self.mutate(target, |status| {
            update(status.server_statuses.entry(qualifier.to_string()).or_default());
        }).await?;

        self.events.publish(
            target,
            EventType::Normal,
            reasons::STATUS_UPDATED,
            Some(format!("updated server {} of {}", qualifier, describe(target))),
        ).await;
        Ok(status)
    }

    /// Record a failure for `qualifier` and force the owner into FAILED. An existing failure
    /// of the same server is kept, the first failure being the cause.
    pub async fn mark_failed(&self, target: &ObjectReference, qualifier: &str, failure: FailureRecord) -> Result<ProvisioningStatus> {
        let message = failure.message.clone();
        let status = self.mutate(target, |status| {
            let server = status.server_statuses.entry(qualifier.to_string()).or_default();
            if server.failure.is_none() {
                server.failure = Some(failure.clone());
            }
            status.phase = Phase::Failed;
        }).await?;

        self.events.publish(target, EventType::Warning, reasons::PROVISIONING_FAILED, Some(message)).await;
        Ok(status)
    }

    async fn mutate<F>(&self, target: &ObjectReference, mutation: F) -> Result<ProvisioningStatus>
    where
        F: Fn(&mut ProvisioningStatus) + Send + Sync,
    {
        for attempt in 1..=self.max_attempts {
            let current = self.client.get_status(target).await?.ok_or_else(|| {
                ControllerError::ContractViolation(format!("{} no longer exists", describe(target)))
            })?;

            let mut status = current.status.unwrap_or_default();
            mutation(&mut status);
            status.last_updated = Some(Utc::now());
            if current.generation.is_some() {
                status.observed_generation = current.generation;
            }

            match self.client.patch_status(target, &status, current.resource_version.as_deref()).await {
                Ok(()) => {
                    debug!(event = "StatusUpdated", resource = describe(target), phase = status.phase.to_string());
                    return Ok(status);
                },
                Err(ControllerError::Conflict(_)) if attempt < self.max_attempts => {
                    info!(event = "RetryingStatusUpdate", resource = describe(target), attempt = attempt);
                },
                Err(ControllerError::Conflict(_)) => break,
                Err(e) => return Err(e),
            }
        }

        warn!(event = "StatusUpdateAbandoned", resource = describe(target), attempts = self.max_attempts);
        Err(ControllerError::StatusConflict { resource: describe(target), attempts: self.max_attempts })
    }
}

/// Failure record identifying the owning resource
pub fn failure_of(target: &ObjectReference, message: String) -> FailureRecord {
    FailureRecord {
        failed_object_kind: target.kind.clone().unwrap_or_default(),
        failed_object_namespace: target.namespace.clone(),
        failed_object_name: target.name.clone().unwrap_or_default(),
        message,
        detail: None,
    }
}
