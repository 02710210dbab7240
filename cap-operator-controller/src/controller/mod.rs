// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

pub mod capability;
pub mod client;
pub mod context;
pub mod deployment;
pub mod events;
pub mod external;
pub mod identity;
pub mod probe;
pub mod registry;
pub mod resolver;
pub mod resources;
pub mod scope;
pub mod status;
pub mod utils;

pub use capability::CapabilityController;
pub use deployment::{DeploymentOrchestrator, DeploymentResult};
pub use resolver::{CapabilityResolver, ProvisioningResult};
pub use status::StatusPhaseTracker;
