// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use kube::CustomResourceExt;
use kube::core::crd::merge_crds;

use crate::crd::ProvidedCapability;
use crate::error::{ControllerError, Result};

/// Render the CRDs of the operator as a multi-document YAML stream
pub fn generate_crds() -> Result<String> {
    let crds = vec![
        merge_crds(vec![ProvidedCapability::crd()], "v1alpha1")
            .map_err(|e| ControllerError::UnknownError(e.to_string()))?,
    ];

    let mut rendered = String::new();
    for crd in crds {
        rendered.push_str("---\n");
        rendered.push_str(&serde_norway::to_string(&crd).map_err(|e| ControllerError::UnknownError(e.to_string()))?);
    }

    Ok(rendered)
}
