// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;

use cap_operator_common::telemetry::warn;

/// Publishes Kubernetes Events about an owning resource. Publishing is
/// fire-and-forget: a failed event never fails the operation that raised it.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, target: &ObjectReference, type_: EventType, reason: &str, note: Option<String>);
}

pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self { recorder: Recorder::new(client, reporter) }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, target: &ObjectReference, type_: EventType, reason: &str, note: Option<String>) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: "Provision".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, target).await {
            warn!(event = "EventPublishFailed", reason = reason, error = %e);
        }
    }
}

pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _target: &ObjectReference, _type_: EventType, _reason: &str, _note: Option<String>) {}
}

pub mod reasons {
    pub const PHASE_CHANGED: &str = "PhaseChanged";
    pub const STATUS_UPDATED: &str = "StatusUpdated";
    pub const PROVISIONING_FAILED: &str = "ProvisioningFailed";
}
