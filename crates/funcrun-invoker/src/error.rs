// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Top-level invoker errors and their exit-status mapping.

use funcrun_protocol::ServerError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::lifecycle::{ExitStatus, LifecycleError};

/// Errors that end the invoker process.
#[derive(Debug, Error)]
pub enum InvokerError {
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The function locator does not name a registered module.
    #[error("no function module registered for locator '{locator}'")]
    UnknownFunction { locator: String },

    /// The module exposes neither a call function nor a duplex transform.
    #[error("function module exposes no recognized interaction model")]
    UnknownInteractionModel,

    /// The transport could not be started.
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// `init` or `destroy` failed or timed out.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl InvokerError {
    /// Exit status the process must terminate with for this error.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Config(_) | Self::UnknownFunction { .. } | Self::Server(_) => ExitStatus::Config,
            Self::UnknownInteractionModel => ExitStatus::UnknownInteractionModel,
            Self::Lifecycle(err) => err.exit_status(),
        }
    }
}
