// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[
    clap(
        name = "capability-operator",
        version,
        author,
        about = "Operator provisioning shared infrastructure capabilities"
    )
]
pub struct CliArgs {
    /// YAML or JSON configuration file, merged over the defaults
    #[clap(long, global = true, env = "CAP_OPERATOR_CONFIG")]
    pub config: Option<String>,
    /// Namespace the operator runs in, home of cluster-scoped capabilities
    #[clap(long, global = true, env = "POD_NAMESPACE")]
    pub operator_namespace: Option<String>,
    #[clap(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[
        clap(
            name = "crds",
            about = "Generate Custom Resource Definitions (CRDs) for the operator"
        )
    ]
    Crds,
    #[
        clap(
            name = "controller",
            about = "Run the ProvidedCapability controller"
        )
    ]
    Controller,
    #[
        clap(
            name = "command-server",
            about = "Run the command server provisioning capabilities and deployments on request",
        )
    ]
    CommandServer,
}
