// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

#[allow(unused_extern_crates)]
extern crate self as cap_operator_command;

pub mod commands;
pub mod error;
pub mod router;
pub mod server;
