// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bare isolated workflow executor.
//!
//! Embedding applications build their own runner binary with their
//! workflow definitions and plugins registered; this one executes nothing
//! but serves as the template and as the protocol reference.

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = dl_runner::run(dl_runner::RunnerSetup::new()).await;
    std::process::exit(code);
}
