// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Funcrun Invoker
//!
//! Serves one of the built-in function modules (`echo`, `echo-stream`),
//! selected by `FUNCRUN_FUNCTION_URI`. The process exit code reports how
//! the lifecycle ended.

use funcrun_invoker::{FunctionRegistry, launch};
use tracing::info;

#[tokio::main]
async fn main() {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("funcrun_invoker=info".parse().unwrap()),
        )
        .init();

    info!("Starting Funcrun Invoker");

    let status = launch(FunctionRegistry::with_builtins()).await;

    // Exit from inside the runtime so a hung hook cannot hold the process
    std::process::exit(status.code());
}
