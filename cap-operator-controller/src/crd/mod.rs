// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

pub mod utils;
pub mod v1alpha1;

pub use v1alpha1::capability::{CapabilityRequirement, ProvidedCapability};
pub use v1alpha1::common::{
    CapabilityScope, FailureRecord, Phase, ProvisioningStatus, ResourceReference, ServerStatus,
    StandardCapability, StandardCapabilityImplementation, DEFAULT_QUALIFIER,
};
pub use v1alpha1::deployable::Deployable;
