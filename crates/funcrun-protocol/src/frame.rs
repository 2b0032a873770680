// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for QUIC stream framing.
//!
//! Each bidirectional QUIC stream carries one Call. Both directions are a
//! sequence of frames with the following layout:
//! - 4 bytes: body length (big-endian)
//! - 2 bytes: frame type
//! - N bytes: protobuf body
//!
//! The end of a direction is signalled by finishing the QUIC send stream,
//! not by a frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::function_proto;

/// Maximum frame body size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type)
pub const HEADER_SIZE: usize = 6;

/// Frame types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    /// Body is a `function_proto::Message`
    Data = 1,
    /// The server refused the Call; body is empty
    Reject = 2,
}

impl TryFrom<u16> for FrameType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Reject),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid frame type: {0}")]
    InvalidFrameType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("call rejected by server")]
    Rejected,

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed body with its type
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub body: Bytes,
}

impl Frame {
    /// Create a data frame carrying a function message
    pub fn data(msg: &function_proto::Message) -> Result<Self, FrameError> {
        let body = msg.encode_to_vec();
        if body.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(body.len()));
        }
        Ok(Self {
            frame_type: FrameType::Data,
            body: Bytes::from(body),
        })
    }

    /// Create a reject frame
    pub fn reject() -> Self {
        Self {
            frame_type: FrameType::Reject,
            body: Bytes::new(),
        }
    }

    /// Decode the body of a data frame.
    ///
    /// A reject frame decodes to [`FrameError::Rejected`].
    pub fn into_message(self) -> Result<function_proto::Message, FrameError> {
        match self.frame_type {
            FrameType::Data => Ok(function_proto::Message::decode(self.body)?),
            FrameType::Reject => Err(FrameError::Rejected),
        }
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        buf.put_u32(self.body.len() as u32);
        buf.put_u16(self.frame_type as u16);
        buf.put(self.body.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let frame_type = FrameType::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame body",
            )));
        }

        let body = bytes.split_to(length);
        Ok(Self { frame_type, body })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Read a frame from an async reader.
///
/// A clean end of stream before the first header byte is reported as
/// [`FrameError::ConnectionClosed`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let frame_type = FrameType::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    Ok(Frame {
        frame_type,
        body: Bytes::from(body),
    })
}

/// Framed codec for one direction (or both) of a Call stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` once the peer has finished its side of the stream.
    pub async fn read_message(&mut self) -> Result<Option<function_proto::Message>, FrameError> {
        match self.read_frame().await {
            Ok(frame) => frame.into_message().map(Some),
            Err(FrameError::ConnectionClosed) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }

    /// Write a message as a data frame
    pub async fn write_message(&mut self, msg: &function_proto::Message) -> Result<(), FrameError> {
        let frame = Frame::data(msg)?;
        self.write_frame(&frame).await
    }
}
