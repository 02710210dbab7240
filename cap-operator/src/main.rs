// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

mod cli;

use std::sync::Arc;
use futures::StreamExt;
use std::process;
use clap::Parser;
use clap::CommandFactory;
use rustls::crypto::aws_lc_rs;

use cap_operator_common::config::{AppConfig, AppConfigBuilder};
use cap_operator_common::telemetry::{error, info, setup_logging};
use cap_operator_controller::controller::{context::Context, utils::{error_policy, create_k8s_client}, CapabilityController};
use cap_operator_controller::crd::utils as crd_utils;
use cap_operator_command::commands::{CapabilityCommands, CommandService};
use cap_operator_command::server::{create_router, create_tls_config, serve};

use crate::cli::{CliArgs, Commands};

fn exit_on_error<E: std::fmt::Display>(e: E) -> ! {
    error!(
        event = "Error",
        error = %e,
    );
    process::exit(1);
}

fn load_config(args: &CliArgs) -> AppConfig {
    let mut builder = AppConfigBuilder::default();
    if let Some(path) = &args.config {
        builder.with_file(path);
    }
    builder
        .with_env()
        .with_override_option("controller.operator_namespace", args.operator_namespace.as_deref())
        .build()
        .unwrap_or_else(|e| exit_on_error(e))
}

async fn create_context(config: AppConfig) -> Arc<Context> {
    let client = create_k8s_client().await.unwrap_or_else(|e| exit_on_error(e));
    Arc::new(Context::new(client, Arc::new(config)))
}

#[tokio::main]
async fn main() {
    // Install the default aws_lc_rs crypto provider
    let _ = aws_lc_rs::default_provider().install_default();

    let args = CliArgs::parse();

    setup_logging("info");

    match &args.cmd {
        Some(Commands::Crds) => {
            let crds = crd_utils::generate_crds().unwrap_or_else(|e| exit_on_error(e));
            print!("{}", crds);
        },
        Some(Commands::CommandServer) => {
            info!(
                event = "Starting",
                version = env!("CARGO_PKG_VERSION"),
            );

            let config = load_config(&args);
            let addr = format!("{}:{}", config.command.host, config.command.port);
            let tls_config = create_tls_config(config.command.tls.cert_file.to_string(), config.command.tls.key_file.to_string())
                .await
                .unwrap_or_else(|e| exit_on_error(e));

            let ctx = create_context(config.clone()).await;
            let commands: Arc<dyn CapabilityCommands> = Arc::new(
                CommandService::new(ctx.resolver.clone(), ctx.orchestrator.clone(), &config.controller)
            );
            let router = create_router(commands);

            // Run the command server
            info!(event = "Listening", address = addr.as_str());
            serve(addr, router, tls_config).await.unwrap_or_else(|e| exit_on_error(e));
        },
        Some(Commands::Controller) => {
            info!(
                event = "Starting",
                version = env!("CARGO_PKG_VERSION"),
            );

            let config = load_config(&args);
            let controller_ctx = create_context(config).await;

            let capability_controller = CapabilityController::create_controller(controller_ctx.clone()).await;

            info!(event = "ControllerStarted", kind = "ProvidedCapability", version = "v1alpha1");
            let capability_handle = tokio::spawn(async move {
                capability_controller.run(CapabilityController::reconcile, error_policy, controller_ctx.clone())
                    .for_each(|r| async move {
                        match r {
                            Ok(_) => info!(event = "Reconciled", kind = "ProvidedCapability", version = "v1alpha1"),
                            Err(e) => error!(event = "ReconcileError", error = %e),
                        }
                    })
                    .await
            });

            match tokio::try_join!(capability_handle) {
                Ok(_) => info!(event = "Stopped"),
                Err(e) => error!(event = "Error", error = %e),
            }
        },
        None => {
            let mut cmd = CliArgs::command();
            let _ = cmd.print_help();
            process::exit(1);
        },
    }
}
