// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Funcrun Protocol - QUIC + Protobuf communication layer
//!
//! This crate provides the wire protocol spoken between callers and a
//! function invoker. There is exactly one RPC method, `Call`: a
//! bidirectional stream of [`function_proto::Message`] values in each
//! direction.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    funcrun-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: one duplex Call per bidirectional QUIC stream   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use funcrun_protocol::{FunctionClient, function_proto};
//!
//! let client = FunctionClient::localhost()?;
//! client.connect().await?;
//!
//! let mut call = client.open_call().await?;
//! call.send(&function_proto::Message::text("text/plain", "riff")).await?;
//! call.finish()?;
//!
//! while let Some(reply) = call.recv().await? {
//!     println!("{:?}", reply.payload);
//! }
//! ```

pub mod client;
pub mod frame;
pub mod server;

/// Protobuf types for the function invocation protocol.
///
/// Hand-derived with `prost` so the crate builds without `protoc`. The
/// layout matches:
///
/// ```proto
/// message HeaderValue { repeated string values = 1; }
/// message Message {
///   bytes payload = 1;
///   map<string, HeaderValue> headers = 2;
/// }
/// ```
pub mod function_proto {
    use std::collections::BTreeMap;

    /// Ordered values of one header.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct HeaderValue {
        #[prost(string, repeated, tag = "1")]
        pub values: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }

    /// A single message exchanged on a Call.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Message {
        #[prost(bytes = "bytes", tag = "1")]
        pub payload: ::prost::bytes::Bytes,
        #[prost(btree_map = "string, message", tag = "2")]
        pub headers: BTreeMap<::prost::alloc::string::String, HeaderValue>,
    }

    impl Message {
        /// Build a message carrying a UTF-8 payload with the given content type.
        pub fn text(content_type: &str, payload: &str) -> Self {
            let mut headers = BTreeMap::new();
            headers.insert(
                "Content-Type".to_string(),
                HeaderValue {
                    values: vec![content_type.to_string()],
                },
            );
            Self {
                payload: ::prost::bytes::Bytes::copy_from_slice(payload.as_bytes()),
                headers,
            }
        }

        /// First value of a header, matched case-insensitively.
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .and_then(|(_, value)| value.values.first())
                .map(String::as_str)
        }

        /// Whether the encoded message fits in a single Data frame.
        pub fn fits_in_frame(&self) -> bool {
            ::prost::Message::encoded_len(self) <= crate::frame::MAX_FRAME_SIZE
        }
    }
}

// Re-export main types
pub use client::{CallStream, ClientError, FunctionClient, FunctionClientConfig};
pub use frame::{Frame, FrameError, FramedStream, FrameType};
pub use server::{
    CallHandler, CallSender, ConnectionHandler, FunctionServer, FunctionServerConfig, ServerError,
};
