// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use nats_tracing::{
    app::{run_subscriber, LogPayload, Process},
    bus::nats::NatsConnector,
    config::{Args, Config},
    lifecycle::wait_for_signal,
    logger::{self, LOG_PREFIX},
    util::error_chain,
};

const INSTRUMENTATION_SCOPE: &str = "nats-tracing-sub";

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = logger::init(&args.log_level) {
        eprintln!("{LOG_PREFIX} | ERROR | {}", error_chain(&e));
        return ExitCode::FAILURE;
    }

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    config.print();

    let process = match Process::start(&config, INSTRUMENTATION_SCOPE) {
        Ok(process) => process,
        Err(e) => {
            error!("{}", error_chain(&e));
            return ExitCode::FAILURE;
        }
    };

    let connector = NatsConnector::new(format!("{}-sub", config.service_name));
    let result = run_subscriber(
        &config.nats_server,
        &connector,
        &process,
        LogPayload,
        wait_for_signal(),
    )
    .await;
    if let Err(e) = &result {
        error!("{}", error_chain(e));
    }

    if let Err(e) = process.finish(&result).await {
        error!("{}", error_chain(&e));
        return ExitCode::FAILURE;
    }

    match result {
        Ok(()) => {
            info!("Subscriber stopped");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
