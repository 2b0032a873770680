// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Funcrun Fixtures
//!
//! The invoker with every fixture module registered next to the built-ins.
//! Used by the process-level lifecycle tests.

use funcrun_invoker::launch;
use tracing::info;

// `init-blocks` pins one worker; the hook timeout fires on another
#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("funcrun_invoker=info".parse().unwrap())
                .add_directive("funcrun_fixtures=info".parse().unwrap()),
        )
        .init();

    info!("Starting Funcrun Fixtures");

    let status = launch(funcrun_fixtures::registry()).await;
    std::process::exit(status.code());
}
