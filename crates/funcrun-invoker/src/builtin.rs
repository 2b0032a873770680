// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function modules shipped with the stock binary.

use futures::StreamExt;

use crate::function::{FunctionError, MessageStream, ModuleExports, ResultStream};
use crate::message::Message;

/// Request-reply echo. Replies with the inbound payload; the content type
/// is left to negotiation.
pub fn echo() -> ModuleExports {
    ModuleExports::new().with_call(|msg: Message| async move {
        Ok::<_, FunctionError>(Message::builder().payload(msg.payload().clone()).build())
    })
}

/// Streaming echo. One outbound Message per inbound Message, same order.
///
/// Each reply carries its own inbound `Content-Type`; duplex negotiation
/// only sees the first Message of the Call.
pub fn echo_stream() -> ModuleExports {
    ModuleExports::new().with_transform(|input: MessageStream| -> ResultStream {
        input
            .map(|msg| {
                let mut reply = Message::builder().payload(msg.payload().clone());
                if let Some(content_type) = msg.content_type() {
                    reply = reply.content_type(content_type);
                }
                Ok(reply.build())
            })
            .boxed()
    })
}
