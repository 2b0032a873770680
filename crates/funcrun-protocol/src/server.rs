// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server helpers for the function invoker.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::frame::{Frame, FrameError, FramedStream};

/// Errors that can occur in the QUIC server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("server closed")]
    Closed,
}

/// Configuration for the QUIC server
#[derive(Debug, Clone)]
pub struct FunctionServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM format)
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM format)
    pub key_pem: Vec<u8>,
    /// Maximum pending incoming connections (handshakes in progress)
    pub max_incoming: u32,
    /// Maximum concurrent Calls (bidirectional streams) per connection
    pub max_bi_streams: u32,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Server-side keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// UDP receive buffer size in bytes (0 for OS default)
    pub udp_receive_buffer_size: usize,
    /// UDP send buffer size in bytes (0 for OS default)
    pub udp_send_buffer_size: usize,
}

impl Default for FunctionServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_incoming: 1_000,
            max_bi_streams: 1_000,
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
            udp_receive_buffer_size: 2 * 1024 * 1024, // 2MB
            udp_send_buffer_size: 2 * 1024 * 1024,    // 2MB
        }
    }
}

impl FunctionServerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `FUNCRUN_QUIC_MAX_INCOMING`: Max pending handshakes (default: 1000)
    /// - `FUNCRUN_QUIC_MAX_BI_STREAMS`: Max concurrent Calls per connection (default: 1000)
    /// - `FUNCRUN_QUIC_IDLE_TIMEOUT_MS`: Idle timeout in ms (default: 120000)
    /// - `FUNCRUN_QUIC_KEEP_ALIVE_MS`: Keep-alive interval in ms, 0 to disable (default: 15000)
    /// - `FUNCRUN_QUIC_UDP_RECV_BUFFER`: UDP receive buffer size in bytes (default: 2097152)
    /// - `FUNCRUN_QUIC_UDP_SEND_BUFFER`: UDP send buffer size in bytes (default: 2097152)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            bind_addr: default.bind_addr,
            cert_pem: default.cert_pem,
            key_pem: default.key_pem,
            max_incoming: env_or("FUNCRUN_QUIC_MAX_INCOMING", default.max_incoming),
            max_bi_streams: env_or("FUNCRUN_QUIC_MAX_BI_STREAMS", default.max_bi_streams),
            idle_timeout_ms: env_or("FUNCRUN_QUIC_IDLE_TIMEOUT_MS", default.idle_timeout_ms),
            keep_alive_interval_ms: env_or(
                "FUNCRUN_QUIC_KEEP_ALIVE_MS",
                default.keep_alive_interval_ms,
            ),
            udp_receive_buffer_size: env_or(
                "FUNCRUN_QUIC_UDP_RECV_BUFFER",
                default.udp_receive_buffer_size,
            ),
            udp_send_buffer_size: env_or(
                "FUNCRUN_QUIC_UDP_SEND_BUFFER",
                default.udp_send_buffer_size,
            ),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// QUIC server exposing the `Call` method
pub struct FunctionServer {
    endpoint: Endpoint,
    config: FunctionServerConfig,
}

impl FunctionServer {
    /// Bind a new server with the given configuration.
    ///
    /// The socket is reachable as soon as this returns.
    pub fn bind(config: FunctionServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let server_config = Self::build_server_config(&config)?;

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if config.udp_receive_buffer_size > 0
            && let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size)
        {
            warn!(
                size = config.udp_receive_buffer_size,
                error = %e,
                "Failed to set UDP receive buffer size"
            );
        }
        if config.udp_send_buffer_size > 0
            && let Err(e) = socket.set_send_buffer_size(config.udp_send_buffer_size)
        {
            warn!(
                size = config.udp_send_buffer_size,
                error = %e,
                "Failed to set UDP send buffer size"
            );
        }

        socket.bind(&config.bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;

        info!(
            addr = %config.bind_addr,
            max_incoming = config.max_incoming,
            max_bi_streams = config.max_bi_streams,
            idle_timeout_ms = config.idle_timeout_ms,
            keep_alive_ms = config.keep_alive_interval_ms,
            "QUIC server bound"
        );

        Ok(Self { endpoint, config })
    }

    /// Bind a server with a self-signed `localhost` certificate
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        Self::localhost_with_config(bind_addr, FunctionServerConfig::from_env())
    }

    /// Bind a server with a self-signed certificate and custom config
    pub fn localhost_with_config(
        bind_addr: SocketAddr,
        mut config: FunctionServerConfig,
    ) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        config.bind_addr = bind_addr;
        config.cert_pem = cert.cert.pem().into_bytes();
        config.key_pem = cert.key_pair.serialize_pem().into_bytes();

        Self::bind(config)
    }

    /// Get the server configuration
    pub fn config(&self) -> &FunctionServerConfig {
        &self.config
    }

    fn build_server_config(config: &FunctionServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {}", e)))?;

        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

        let crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let idle_timeout = std::time::Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .map_err(|_| ServerError::Tls("idle timeout out of range".to_string()))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(idle_timeout));
        transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
        // Calls only ever use bidirectional streams
        transport.max_concurrent_uni_streams(0u32.into());

        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(std::time::Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));
        server_config.max_incoming(config.max_incoming as usize);

        Ok(server_config)
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Refuse new connections while keeping established ones alive.
    pub fn stop_accepting(&self) {
        self.endpoint.set_server_config(None);
        debug!("QUIC server no longer accepting connections");
    }

    /// Close the server, aborting every open connection
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }
}

/// Handler for an individual QUIC connection
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    /// Get the remote address of the connection
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Accept the next Call (bidirectional stream)
    pub async fn accept_call(&self) -> Result<CallHandler, ServerError> {
        let (send, recv) = self.connection.accept_bi().await?;
        Ok(CallHandler::new(send, recv))
    }

    /// Run the connection, spawning `handler` for every Call opened on it.
    ///
    /// Returns when the connection is closed by either side.
    #[instrument(skip(self, handler), fields(remote = %self.remote_address()))]
    pub async fn run<H, Fut>(&self, handler: H)
    where
        H: Fn(CallHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept_call().await {
                Ok(call) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler(call).await;
                    });
                }
                Err(e) => {
                    match &e {
                        ServerError::Connection(quinn::ConnectionError::ApplicationClosed(_))
                        | ServerError::Connection(quinn::ConnectionError::LocallyClosed)
                        | ServerError::Connection(quinn::ConnectionError::TimedOut) => {
                            debug!("connection closed");
                        }
                        _ => {
                            error!("error accepting call: {}", e);
                        }
                    }
                    break;
                }
            }
        }
    }
}

/// Server side of a single Call
pub struct CallHandler {
    send: SendStream,
    recv: RecvStream,
}

impl CallHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    /// Identifier of the underlying QUIC stream
    pub fn id(&self) -> u64 {
        self.send.id().index()
    }

    /// Refuse the Call: send a reject frame and finish the stream.
    pub async fn reject(mut self) -> Result<(), ServerError> {
        crate::frame::write_frame(&mut self.send, &Frame::reject()).await?;
        finish(&mut self.send)?;
        // Nothing more will be read from the caller
        let _ = self.recv.stop(0u32.into());
        Ok(())
    }

    /// Split into an outbound writer and an inbound reader
    pub fn into_split(self) -> (CallSender, FramedStream<RecvStream>) {
        (
            CallSender {
                inner: FramedStream::new(self.send),
            },
            FramedStream::new(self.recv),
        )
    }
}

/// Outbound half of a Call
pub struct CallSender {
    inner: FramedStream<SendStream>,
}

impl CallSender {
    /// Write one message to the caller
    pub async fn send(
        &mut self,
        msg: &crate::function_proto::Message,
    ) -> Result<(), ServerError> {
        Ok(self.inner.write_message(msg).await?)
    }

    /// Finish the send stream (signal no more messages)
    pub fn finish(&mut self) -> Result<(), ServerError> {
        finish(self.inner.get_mut())
    }

    /// Finish the send stream and wait until the caller has consumed it
    /// or stopped reading.
    pub async fn close(mut self) -> Result<(), ServerError> {
        self.finish()?;
        let send = self.inner.get_mut();
        match send.stopped().await {
            Ok(_) => Ok(()),
            Err(quinn::StoppedError::ConnectionLost(e)) => Err(ServerError::Connection(e)),
            Err(e) => Err(ServerError::Frame(FrameError::Io(std::io::Error::other(e)))),
        }
    }
}

fn finish(send: &mut SendStream) -> Result<(), ServerError> {
    send.finish()
        .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))
}
