// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::result;

use cap_operator_controller::error::ControllerError;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct APIError {
    pub code: u32,
    pub message: String,
}

impl APIError {
    pub fn new(code: u32, message: String) -> Self {
        Self { code, message }
    }

    pub fn unexpected_error(message: &str) -> Self {
        Self {
            code: 50000,
            message: message.to_string(),
        }
    }

    pub fn invalid_request(message: &str) -> Self {
        Self {
            code: 42200,
            message: message.to_string(),
        }
    }

    pub fn provisioning_failed(message: &str) -> Self {
        Self {
            code: 50200,
            message: message.to_string(),
        }
    }

    pub fn timed_out(message: &str) -> Self {
        Self {
            code: 50400,
            message: message.to_string(),
        }
    }

    /// HTTP status carried by the first three digits of the code
    pub fn status(&self) -> StatusCode {
        u16::try_from(self.code / 100)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<ControllerError> for APIError {
    fn from(error: ControllerError) -> Self {
        let message = error.to_string();
        match error {
            ControllerError::Timeout { .. } => APIError::timed_out(&message),
            ControllerError::ConfigurationError(_)
            | ControllerError::ScopeMismatch { .. }
            | ControllerError::ImplementationMismatch { .. } => APIError::invalid_request(&message),
            ControllerError::ProvisioningFailed { .. } => APIError::provisioning_failed(&message),
            _ => APIError::unexpected_error(&message),
        }
    }
}

impl IntoResponse for APIError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

pub type APIResult<T> = result::Result<T, APIError>;
