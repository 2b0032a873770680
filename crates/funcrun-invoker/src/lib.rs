// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Funcrun Invoker - function invocation runtime
//!
//! The invoker turns one function module into a network service. It
//! classifies the module's shape, runs its `init` hook, serves the `Call`
//! method of [`funcrun_protocol`] and, on SIGINT or SIGTERM, drains in-flight
//! Calls before running `destroy`. The process exit code tells the
//! orchestrator how things ended.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   Call (QUIC bidi stream)   ┌──────────────────────────┐
//! │    Caller    │ ──────────────────────────▶ │  server (accept, gate)   │
//! └──────────────┘                             └────────────┬─────────────┘
//!                                                           │ MessageStream
//!                                                           ▼
//!                                              ┌──────────────────────────┐
//!                                              │  dispatcher              │
//!                                              │  request-reply | duplex  │
//!                                              └────────────┬─────────────┘
//!                                                           │ Result<Message>
//!                                                           ▼
//!                                              ┌──────────────────────────┐
//!                                              │  negotiate               │
//!                                              │  Content-Type, Error     │
//!                                              └──────────────────────────┘
//! ```
//!
//! # Lifecycle and exit codes
//!
//! | Outcome | Exit code |
//! |---------|-----------|
//! | Clean shutdown | 0 |
//! | `init` or `destroy` timed out | 1 |
//! | `init` or `destroy` failed | 2 |
//! | Configuration error (settings, unknown locator, bind failure) | 78 |
//! | Module exposes no recognized interaction model | 255 |
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FUNCRUN_FUNCTION_URI` | required | Function module locator (`name` or `builtin:name`) |
//! | `FUNCRUN_HOST` | `127.0.0.1` | Bind address |
//! | `FUNCRUN_PORT` | `8081` | Bind port |
//! | `FUNCRUN_INIT_TIMEOUT_MS` | `10000` | `init` hook timeout |
//! | `FUNCRUN_DESTROY_TIMEOUT_MS` | `10000` | `destroy` hook timeout |
//! | `FUNCRUN_DRAIN_TIMEOUT_MS` | `10000` | Wait for in-flight Calls on shutdown |
//! | `FUNCRUN_CALL_CONCURRENCY` | `16` | Concurrent invocations per request-reply Call |
//!
//! # Embedding
//!
//! Binaries that ship their own function modules register them and hand
//! over to [`launch`]:
//!
//! ```rust,ignore
//! use funcrun_invoker::{FunctionRegistry, launch};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut registry = FunctionRegistry::with_builtins();
//!     registry.register("upper", my_functions::upper);
//!     std::process::exit(launch(registry).await.code());
//! }
//! ```

/// Function modules shipped with the stock binary.
pub mod builtin;

/// Configuration loaded from environment variables.
pub mod config;

/// Per-Call adaptation of inbound Messages to the function.
pub mod dispatcher;

/// Top-level errors and their exit status.
pub mod error;

/// Function module contract and classifier.
pub mod function;

/// Lifecycle state machine, call gate and hook runner.
pub mod lifecycle;

/// Message value type.
pub mod message;

/// Outbound `Content-Type` and `Error` headers.
pub mod negotiate;

/// Function module registry.
pub mod registry;

/// Startup and shutdown sequencing.
pub mod runtime;

/// QUIC accept loop and Call serving.
pub mod server;

/// SIGINT/SIGTERM listener.
pub mod signal;

pub use config::{Config, ConfigError};
pub use dispatcher::Dispatcher;
pub use error::InvokerError;
pub use function::{
    DuplexStream, FunctionDescriptor, FunctionError, InteractionModel, LifecycleHook,
    MessageStream, ModuleExports, RequestReply, ResultStream,
};
pub use lifecycle::{ExitStatus, Lifecycle, LifecycleError, LifecycleState};
pub use message::{Message, MessageBuilder, MessageHeaders};
pub use negotiate::ContentNegotiator;
pub use registry::FunctionRegistry;
pub use runtime::{InvokerRuntime, InvokerRuntimeBuilder, launch};
