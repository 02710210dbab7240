// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

pub const APP_NAME: &str = "capability-operator";
pub const ENV_PREFIX: &str = "CAP_OPERATOR";
pub const API_GROUP: &str = "capability.dev";
