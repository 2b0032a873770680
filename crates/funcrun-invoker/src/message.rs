// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Immutable message value exchanged between callers and the function.
//!
//! A [`Message`] is a header multimap plus an opaque payload. Header names
//! are matched case-insensitively but keep the casing they were first
//! written with; repeated values keep their order.

use std::collections::BTreeMap;

use bytes::Bytes;
use funcrun_protocol::function_proto;

/// Well-known header names.
pub mod header {
    /// Media type of the payload.
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// Media ranges the caller is willing to receive.
    pub const ACCEPT: &str = "Accept";
    /// Present (and non-empty) only on failed invocations.
    pub const ERROR: &str = "Error";
}

/// Header multimap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    entries: BTreeMap<String, Vec<String>>,
}

impl MessageHeaders {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of(&self, name: &str) -> Option<&String> {
        self.entries
            .keys()
            .find(|key| key.eq_ignore_ascii_case(name))
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// Every value of `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.key_of(name)
            .and_then(|key| self.entries.get(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `name` carries at least one value.
    pub fn contains(&self, name: &str) -> bool {
        !self.get_all(name).is_empty()
    }

    /// Append a value, keeping any existing values of `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = self.key_of(&name).cloned().unwrap_or(name);
        self.entries.entry(key).or_default().push(value.into());
    }

    /// Replace every value of `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.insert(name, vec![value.into()]);
    }

    /// Remove `name`, returning its values.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let key = self.key_of(name)?.clone();
        self.entries.remove(&key)
    }

    /// Iterate over header names and their values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A header multimap plus a binary payload. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    headers: MessageHeaders,
    payload: Bytes,
}

impl Message {
    /// Start building a message.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The `Content-Type` header, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(header::CONTENT_TYPE)
    }

    /// The `Error` header, if any.
    pub fn error(&self) -> Option<&str> {
        self.headers.get(header::ERROR)
    }

    /// Continue building from this message's headers and payload.
    pub fn into_builder(self) -> MessageBuilder {
        MessageBuilder {
            headers: self.headers,
            payload: self.payload,
        }
    }
}

/// Builder for [`Message`].
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    headers: MessageHeaders,
    payload: Bytes,
}

impl MessageBuilder {
    /// Append a header value.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace all values of a header.
    pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Drop a header entirely.
    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self
    }

    /// Replace all headers.
    pub fn headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn content_type(self, value: impl Into<String>) -> Self {
        self.set_header(header::CONTENT_TYPE, value)
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn build(self) -> Message {
        Message {
            headers: self.headers,
            payload: self.payload,
        }
    }
}

impl From<function_proto::Message> for Message {
    fn from(msg: function_proto::Message) -> Self {
        let mut headers = MessageHeaders::new();
        for (name, value) in msg.headers {
            for v in value.values {
                headers.append(name.clone(), v);
            }
        }
        Self {
            headers,
            payload: msg.payload,
        }
    }
}

impl From<Message> for function_proto::Message {
    fn from(msg: Message) -> Self {
        let headers = msg
            .headers
            .entries
            .into_iter()
            .map(|(name, values)| (name, function_proto::HeaderValue { values }))
            .collect();
        Self {
            payload: msg.payload,
            headers,
        }
    }
}
