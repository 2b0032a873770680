// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content negotiation for outbound Messages.
//!
//! The negotiator owns exactly two headers on the way out: `Content-Type`
//! (when the function did not set one) and `Error`. Everything else the
//! function returns is passed through untouched.

use std::cmp::Ordering;

use funcrun_protocol::frame::MAX_FRAME_SIZE;
use funcrun_protocol::function_proto;
use tracing::warn;

use crate::function::FunctionError;
use crate::message::{Message, MessageHeaders, header};

/// Content type used when nothing better can be negotiated.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// `Error` header value attached to failed invocations.
pub const INVOCATION_ERROR: &str = "error-server-function-invocation";

/// One entry of an `Accept` header.
#[derive(Debug, Clone, PartialEq)]
struct MediaRange {
    /// Media type as written, parameters stripped
    media_type: String,
    q: f32,
}

impl MediaRange {
    fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';');
        let media_type = parts.next()?.trim();
        if media_type.is_empty() {
            return None;
        }

        let mut q = 1.0;
        for param in parts {
            if let Some((name, value)) = param.split_once('=')
                && name.trim().eq_ignore_ascii_case("q")
            {
                q = value.trim().parse().unwrap_or(0.0);
            }
        }

        Some(Self {
            media_type: media_type.to_string(),
            q,
        })
    }

    fn matches(&self, media_type: &str) -> bool {
        let range = essence(&self.media_type);
        let candidate = essence(media_type);
        if range == "*/*" {
            return true;
        }
        match range.strip_suffix("/*") {
            Some(kind) => candidate
                .split_once('/')
                .is_some_and(|(candidate_kind, _)| candidate_kind == kind),
            None => range == candidate,
        }
    }

    fn is_wildcard(&self) -> bool {
        self.media_type.ends_with("/*")
    }
}

/// Lower-cased media type without parameters.
fn essence(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Parse every `Accept` value into media ranges ordered by preference.
///
/// Ranges with `q=0` are dropped; equal weights keep header order.
fn parse_accept(values: &[String]) -> Vec<MediaRange> {
    let mut ranges: Vec<MediaRange> = values
        .iter()
        .flat_map(|value| value.split(','))
        .filter_map(MediaRange::parse)
        .filter(|range| range.q > 0.0)
        .collect();
    // sort_by is stable
    ranges.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(Ordering::Equal));
    ranges
}

/// Derives outbound headers from inbound headers and the function's
/// declared capabilities.
#[derive(Debug, Clone, Default)]
pub struct ContentNegotiator {
    produces: Vec<String>,
}

impl ContentNegotiator {
    /// `produces` lists the media types the function can emit; empty means any.
    pub fn new(produces: Vec<String>) -> Self {
        Self { produces }
    }

    pub fn can_produce(&self, media_type: &str) -> bool {
        let wanted = essence(media_type);
        self.produces.is_empty() || self.produces.iter().any(|p| essence(p) == wanted)
    }

    /// Pick the outbound content type for a request carrying `inbound` headers.
    pub fn negotiate(&self, inbound: &MessageHeaders) -> String {
        let content_type = inbound
            .get(header::CONTENT_TYPE)
            .filter(|ct| self.can_produce(ct));

        if !inbound.contains(header::ACCEPT) {
            return content_type
                .map(str::to_string)
                .or_else(|| self.produces.first().cloned())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        }

        for range in parse_accept(inbound.get_all(header::ACCEPT)) {
            if !range.is_wildcard() {
                if self.can_produce(&range.media_type) {
                    return range.media_type;
                }
                continue;
            }

            if let Some(ct) = content_type
                && range.matches(ct)
            {
                return ct.to_string();
            }
            if let Some(produced) = self.produces.iter().find(|p| range.matches(p)) {
                return produced.clone();
            }
        }

        DEFAULT_CONTENT_TYPE.to_string()
    }

    /// Turn an invocation result into the outbound Message.
    ///
    /// Success keeps a function-supplied `Content-Type` and never carries an
    /// `Error` header. Failure becomes a `text/plain` Message describing the
    /// error, with `Error` set.
    pub fn finish(
        &self,
        inbound: &MessageHeaders,
        result: Result<Message, FunctionError>,
    ) -> Message {
        match result {
            Ok(reply) => {
                let builder = if reply.content_type().is_some() {
                    reply.into_builder()
                } else {
                    let content_type = self.negotiate(inbound);
                    reply.into_builder().content_type(content_type)
                };
                let reply = builder.remove_header(header::ERROR).build();

                // A reply that cannot be framed is reported like any other failure
                let wire = function_proto::Message::from(reply.clone());
                if wire.fits_in_frame() {
                    reply
                } else {
                    failure(FunctionError::msg(format!(
                        "reply of {} bytes exceeds the {} byte frame limit",
                        reply.payload().len(),
                        MAX_FRAME_SIZE
                    )))
                }
            }
            Err(err) => failure(err),
        }
    }
}

fn failure(err: FunctionError) -> Message {
    warn!(error = %err, "function invocation failed");
    Message::builder()
        .content_type("text/plain")
        .set_header(header::ERROR, INVOCATION_ERROR)
        .payload(err.to_string())
        .build()
}
