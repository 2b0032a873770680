// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invoker runtime: startup, serving and shutdown sequencing.
//!
//! [`InvokerRuntime`] drives one function module through its whole life:
//!
//! 1. classify the module (unknown shape fails before anything runs)
//! 2. run `init` under its timeout
//! 3. bind the Call server and mark the lifecycle `READY`
//! 4. on shutdown: drain in-flight Calls, close the endpoint, run `destroy`
//!
//! # Example
//!
//! ```rust,ignore
//! use funcrun_invoker::{InvokerRuntime, builtin};
//!
//! let runtime = InvokerRuntime::builder()
//!     .exports(builtin::echo())
//!     .bind_addr("127.0.0.1:0".parse()?)
//!     .start()
//!     .await?;
//!
//! // ... serve until told to stop ...
//!
//! runtime.shutdown().await?;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use funcrun_protocol::{FunctionServer, FunctionServerConfig};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatcher::{DEFAULT_CALL_CONCURRENCY, Dispatcher};
use crate::error::InvokerError;
use crate::function::{FunctionDescriptor, InteractionModel, ModuleExports};
use crate::lifecycle::{ExitStatus, Hook, Lifecycle, run_hook};
use crate::registry::FunctionRegistry;
use crate::server::run_call_server;
use crate::signal::ShutdownSignal;

/// Builder for an [`InvokerRuntime`].
pub struct InvokerRuntimeBuilder {
    exports: ModuleExports,
    bind_addr: SocketAddr,
    init_timeout: Duration,
    destroy_timeout: Duration,
    drain_timeout: Duration,
    call_concurrency: usize,
    server_config: Option<FunctionServerConfig>,
}

impl std::fmt::Debug for InvokerRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerRuntimeBuilder")
            .field("exports", &self.exports)
            .field("bind_addr", &self.bind_addr)
            .field("init_timeout", &self.init_timeout)
            .field("destroy_timeout", &self.destroy_timeout)
            .field("drain_timeout", &self.drain_timeout)
            .field("call_concurrency", &self.call_concurrency)
            .finish()
    }
}

impl Default for InvokerRuntimeBuilder {
    fn default() -> Self {
        Self {
            exports: ModuleExports::new(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            init_timeout: Duration::from_secs(10),
            destroy_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
            call_concurrency: DEFAULT_CALL_CONCURRENCY,
            server_config: None,
        }
    }
}

impl InvokerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every setting from a loaded [`Config`] except the locator.
    pub fn config(self, config: &Config) -> Self {
        self.bind_addr(config.bind_addr)
            .init_timeout(config.init_timeout)
            .destroy_timeout(config.destroy_timeout)
            .drain_timeout(config.drain_timeout)
            .call_concurrency(config.call_concurrency)
    }

    /// Set the function module to serve.
    pub fn exports(mut self, exports: ModuleExports) -> Self {
        self.exports = exports;
        self
    }

    /// Set the bind address for the Call server.
    ///
    /// Default: `127.0.0.1:8081`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = timeout;
        self
    }

    /// How long shutdown waits for in-flight Calls before closing the endpoint.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn call_concurrency(mut self, concurrency: usize) -> Self {
        self.call_concurrency = concurrency;
        self
    }

    /// Override QUIC transport tuning. Defaults to `FunctionServerConfig::from_env()`.
    pub fn server_config(mut self, config: FunctionServerConfig) -> Self {
        self.server_config = Some(config);
        self
    }

    /// Classify the module, run `init`, bind the Call server and become `READY`.
    ///
    /// The socket is not bound until `init` has completed.
    pub async fn start(self) -> Result<InvokerRuntime, InvokerError> {
        let descriptor = FunctionDescriptor::classify(self.exports);
        let model = descriptor.model();
        if model == InteractionModel::Unknown {
            error!("function module exposes neither a call function nor a duplex transform");
            return Err(InvokerError::UnknownInteractionModel);
        }
        let dispatcher = Arc::new(Dispatcher::new(&descriptor, self.call_concurrency)?);
        info!(%model, produces = ?descriptor.produces(), "function module classified");

        let lifecycle = Lifecycle::new();

        if let Err(e) = run_hook(Hook::Init, descriptor.init(), self.init_timeout).await {
            lifecycle.terminate();
            return Err(e.into());
        }

        let server_config = self
            .server_config
            .unwrap_or_else(FunctionServerConfig::from_env);
        let bound = FunctionServer::localhost_with_config(self.bind_addr, server_config)
            .and_then(|server| Ok((server.local_addr()?, Arc::new(server))));
        let (local_addr, server) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                // Release whatever init acquired; the bind error decides the exit status
                error!(addr = %self.bind_addr, "failed to bind Call server: {}", e);
                if let Err(destroy_err) =
                    run_hook(Hook::Destroy, descriptor.destroy(), self.destroy_timeout).await
                {
                    warn!("destroy after failed bind: {}", destroy_err);
                }
                lifecycle.terminate();
                return Err(e.into());
            }
        };

        lifecycle.mark_ready();

        let server_handle = tokio::spawn(run_call_server(
            server.clone(),
            lifecycle.clone(),
            dispatcher,
        ));

        info!(addr = %local_addr, %model, "invoker ready");

        Ok(InvokerRuntime {
            server,
            server_handle,
            lifecycle,
            descriptor,
            local_addr,
            destroy_timeout: self.destroy_timeout,
            drain_timeout: self.drain_timeout,
        })
    }

    /// Start, serve until `shutdown` resolves, then shut down.
    ///
    /// `shutdown` is only awaited once the runtime is `READY`, so a request
    /// that was already pending during startup is honoured right after `init`.
    pub async fn serve<S>(self, shutdown: S) -> Result<(), InvokerError>
    where
        S: Future<Output = ()>,
    {
        let runtime = self.start().await?;
        shutdown.await;
        runtime.shutdown().await
    }
}

/// A running invoker.
///
/// Call [`shutdown`](Self::shutdown) for the drain/destroy sequence.
pub struct InvokerRuntime {
    server: Arc<FunctionServer>,
    server_handle: JoinHandle<()>,
    lifecycle: Lifecycle,
    descriptor: FunctionDescriptor,
    local_addr: SocketAddr,
    destroy_timeout: Duration,
    drain_timeout: Duration,
}

impl std::fmt::Debug for InvokerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerRuntime")
            .field("local_addr", &self.local_addr)
            .field("lifecycle", &self.lifecycle)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl InvokerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> InvokerRuntimeBuilder {
        InvokerRuntimeBuilder::new()
    }

    /// Address the Call server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn model(&self) -> InteractionModel {
        self.descriptor.model()
    }

    /// Drain, close the endpoint and run `destroy`.
    ///
    /// `destroy` runs exactly once, after every admitted Call has finished
    /// or the drain timeout has elapsed. Its outcome decides the result.
    pub async fn shutdown(self) -> Result<(), InvokerError> {
        info!("invoker shutting down");

        self.lifecycle.begin_draining();
        if let Err(e) = self.server_handle.await {
            warn!("Call server task ended abnormally: {}", e);
        }

        let remaining = self.lifecycle.drain(self.drain_timeout).await;
        if remaining > 0 {
            warn!(
                active_calls = remaining,
                "aborting calls still in flight after drain timeout"
            );
        }
        self.server.close();

        let result = run_hook(Hook::Destroy, self.descriptor.destroy(), self.destroy_timeout).await;
        self.lifecycle.terminate();

        match result {
            Ok(()) => {
                info!("invoker shutdown complete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Entry point for invoker binaries.
///
/// Installs the signal listeners, loads configuration from the environment,
/// resolves the configured function module in `registry` and serves it until
/// SIGINT or SIGTERM. Returns the exit status the process must end with.
pub async fn launch(registry: FunctionRegistry) -> ExitStatus {
    let signal = match ShutdownSignal::install() {
        Ok(signal) => signal,
        Err(e) => {
            error!("failed to install signal handlers: {}", e);
            return ExitStatus::Config;
        }
    };

    let result: Result<(), InvokerError> = async {
        let config = Config::from_env()?;
        info!(
            function = %config.function_uri,
            addr = %config.bind_addr,
            init_timeout_ms = config.init_timeout.as_millis() as u64,
            destroy_timeout_ms = config.destroy_timeout.as_millis() as u64,
            drain_timeout_ms = config.drain_timeout.as_millis() as u64,
            call_concurrency = config.call_concurrency,
            "Configuration loaded"
        );

        let exports = registry.load(&config.function_uri)?;
        InvokerRuntime::builder()
            .config(&config)
            .exports(exports)
            .serve(signal.recv())
            .await
    }
    .await;

    match result {
        Ok(()) => ExitStatus::Clean,
        Err(e) => {
            let status = e.exit_status();
            error!(exit_code = status.code(), "invoker failed: {}", e);
            status
        }
    }
}
