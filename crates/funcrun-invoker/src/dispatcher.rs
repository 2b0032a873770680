// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call dispatcher: adapts one Call's inbound Messages to the function.
//!
//! - Request-reply: every inbound Message is one invocation. Up to
//!   `call_concurrency` invocations of a Call run at once; replies are
//!   emitted in inbound order.
//! - Duplex stream: the whole inbound sequence feeds one transform.
//!
//! Function errors and panics never escape a Call. They become outbound
//! Messages carrying the `Error` header.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::{FutureExt, StreamExt, stream};

use crate::error::InvokerError;
use crate::function::{
    DuplexStream, FunctionDescriptor, FunctionError, InteractionModel, Invocation, MessageStream,
    RequestReply, ResultStream,
};
use crate::message::MessageHeaders;
use crate::negotiate::ContentNegotiator;

/// Default number of concurrent invocations per request-reply Call.
pub const DEFAULT_CALL_CONCURRENCY: usize = 16;

enum Adapter {
    RequestReply(Arc<dyn RequestReply>),
    DuplexStream(Arc<dyn DuplexStream>),
}

/// Bridges Calls to a classified function.
pub struct Dispatcher {
    adapter: Adapter,
    negotiator: Arc<ContentNegotiator>,
    call_concurrency: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("model", &self.model())
            .field("negotiator", &self.negotiator)
            .field("call_concurrency", &self.call_concurrency)
            .finish()
    }
}

impl Dispatcher {
    /// Build a dispatcher for `descriptor`.
    ///
    /// Fails for [`InteractionModel::Unknown`]: there is nothing to dispatch to.
    pub fn new(
        descriptor: &FunctionDescriptor,
        call_concurrency: usize,
    ) -> Result<Self, InvokerError> {
        let adapter = match descriptor.invocation() {
            Invocation::RequestReply(call) => Adapter::RequestReply(call.clone()),
            Invocation::DuplexStream(transform) => Adapter::DuplexStream(transform.clone()),
            Invocation::Unknown => return Err(InvokerError::UnknownInteractionModel),
        };

        Ok(Self {
            adapter,
            negotiator: Arc::new(ContentNegotiator::new(descriptor.produces().to_vec())),
            call_concurrency: call_concurrency.max(1),
        })
    }

    pub fn model(&self) -> InteractionModel {
        match self.adapter {
            Adapter::RequestReply(_) => InteractionModel::RequestReply,
            Adapter::DuplexStream(_) => InteractionModel::DuplexStream,
        }
    }

    /// Map one Call's inbound sequence to its outbound sequence.
    ///
    /// The outbound stream ends once the inbound stream has ended and every
    /// pending result has been emitted.
    pub fn dispatch(&self, inbound: MessageStream) -> MessageStream {
        match &self.adapter {
            Adapter::RequestReply(call) => {
                request_reply(call.clone(), self.negotiator.clone(), inbound, self.call_concurrency)
            }
            Adapter::DuplexStream(transform) => {
                duplex_stream(transform.clone(), self.negotiator.clone(), inbound)
            }
        }
    }
}

fn request_reply(
    call: Arc<dyn RequestReply>,
    negotiator: Arc<ContentNegotiator>,
    inbound: MessageStream,
    concurrency: usize,
) -> MessageStream {
    inbound
        .map(move |msg| {
            let call = call.clone();
            let negotiator = negotiator.clone();
            async move {
                let headers = msg.headers().clone();
                let result = AssertUnwindSafe(call.call(msg))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(FunctionError::from_panic(panic)));
                negotiator.finish(&headers, result)
            }
        })
        .buffered(concurrency)
        .boxed()
}

fn duplex_stream(
    transform: Arc<dyn DuplexStream>,
    negotiator: Arc<ContentNegotiator>,
    inbound: MessageStream,
) -> MessageStream {
    // Outbound Messages negotiate against the first inbound Message
    let first_headers: Arc<OnceLock<MessageHeaders>> = Arc::new(OnceLock::new());
    let tap = first_headers.clone();
    let input = inbound
        .inspect(move |msg| {
            let _ = tap.set(msg.headers().clone());
        })
        .boxed();

    let output = match std::panic::catch_unwind(AssertUnwindSafe(|| transform.transform(input))) {
        Ok(output) => guard_panics(output),
        Err(panic) => stream::once(async move { Err(FunctionError::from_panic(panic)) }).boxed(),
    };

    let empty = MessageHeaders::new();
    output
        .map(move |result| {
            let headers = first_headers.get().unwrap_or(&empty);
            negotiator.finish(headers, result)
        })
        .boxed()
}

/// End the stream with an error item if polling it panics.
fn guard_panics(output: ResultStream) -> ResultStream {
    stream::unfold(Some(output), |state| async move {
        let mut output = state?;
        match AssertUnwindSafe(output.next()).catch_unwind().await {
            Ok(Some(item)) => Some((item, Some(output))),
            Ok(None) => None,
            Err(panic) => Some((Err(FunctionError::from_panic(panic)), None)),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::ModuleExports;
    use crate::message::{Message, header};
    use crate::negotiate::INVOCATION_ERROR;
    use std::time::Duration;

    fn text(payload: &str) -> Message {
        Message::builder()
            .content_type("text/plain")
            .header(header::ACCEPT, "text/plain")
            .payload(payload.to_string())
            .build()
    }

    fn inbound(messages: Vec<Message>) -> MessageStream {
        stream::iter(messages).boxed()
    }

    fn payloads(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .map(|m| String::from_utf8(m.payload().to_vec()).unwrap())
            .collect()
    }

    fn echo() -> ModuleExports {
        ModuleExports::new().with_call(|msg: Message| async move {
            Ok::<_, FunctionError>(Message::builder().payload(msg.payload().clone()).build())
        })
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let descriptor = FunctionDescriptor::classify(ModuleExports::new());
        assert!(matches!(
            Dispatcher::new(&descriptor, 4),
            Err(InvokerError::UnknownInteractionModel)
        ));
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let descriptor = FunctionDescriptor::classify(echo());
        let dispatcher = Dispatcher::new(&descriptor, 0).unwrap();
        assert_eq!(dispatcher.call_concurrency, 1);
        assert_eq!(dispatcher.model(), InteractionModel::RequestReply);
    }

    #[tokio::test]
    async fn test_request_reply_echo_scenario() {
        let dispatcher = Dispatcher::new(&FunctionDescriptor::classify(echo()), 4).unwrap();

        let out: Vec<Message> = dispatcher
            .dispatch(inbound(vec![text("riff")]))
            .collect()
            .await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content_type(), Some("text/plain"));
        assert!(out[0].error().is_none());
        assert_eq!(&out[0].payload()[..], b"riff");
    }

    #[tokio::test]
    async fn test_request_reply_preserves_order_under_concurrency() {
        // Earlier messages sleep longer, so they finish last
        let exports = ModuleExports::new().with_call(|msg: Message| async move {
            let n: u64 = std::str::from_utf8(msg.payload()).unwrap().parse().unwrap();
            tokio::time::sleep(Duration::from_millis(50 - n * 10)).await;
            Ok::<_, FunctionError>(msg)
        });
        let dispatcher = Dispatcher::new(&FunctionDescriptor::classify(exports), 8).unwrap();

        let messages = (0..5).map(|i| text(&i.to_string())).collect();
        let out: Vec<Message> = dispatcher.dispatch(inbound(messages)).collect().await;

        assert_eq!(payloads(&out), vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_request_reply_error_is_one_message_per_failure() {
        let exports = ModuleExports::new().with_call(|msg: Message| async move {
            if msg.payload().as_ref() == b"bad" {
                Err(FunctionError::msg("cannot handle bad"))
            } else {
                Ok(msg)
            }
        });
        let dispatcher = Dispatcher::new(&FunctionDescriptor::classify(exports), 4).unwrap();

        let out: Vec<Message> = dispatcher
            .dispatch(inbound(vec![text("good"), text("bad"), text("good")]))
            .collect()
            .await;

        assert_eq!(out.len(), 3);
        assert!(out[0].error().is_none());
        assert_eq!(out[1].error(), Some(INVOCATION_ERROR));
        assert_eq!(&out[1].payload()[..], b"cannot handle bad");
        assert!(out[2].error().is_none());
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn test_request_reply_panic_is_contained() {
        let exports = ModuleExports::new().with_call(|_msg: Message| async move {
            panic!("kaboom");
            Ok::<Message, FunctionError>(Message::default())
        });
        let dispatcher = Dispatcher::new(&FunctionDescriptor::classify(exports), 4).unwrap();

        let out: Vec<Message> = dispatcher
            .dispatch(inbound(vec![text("a"), text("b")]))
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.error() == Some(INVOCATION_ERROR)));
        assert!(String::from_utf8_lossy(out[0].payload()).contains("kaboom"));
    }

    #[tokio::test]
    async fn test_duplex_stream_echo() {
        let exports = ModuleExports::new().with_transform(|input: MessageStream| -> ResultStream {
            input
                .map(|msg| Ok(Message::builder().payload(msg.payload().clone()).build()))
                .boxed()
        });
        let dispatcher = Dispatcher::new(&FunctionDescriptor::classify(exports), 4).unwrap();
        assert_eq!(dispatcher.model(), InteractionModel::DuplexStream);

        let out: Vec<Message> = dispatcher
            .dispatch(inbound(vec![text("riff 1"), text("riff 2"), text("riff 3")]))
            .collect()
            .await;

        assert_eq!(payloads(&out), vec!["riff 1", "riff 2", "riff 3"]);
        assert!(out.iter().all(|m| m.content_type() == Some("text/plain")));
        assert!(out.iter().all(|m| m.error().is_none()));
    }

    #[tokio::test]
    async fn test_duplex_stream_may_change_cardinality() {
        // Emits one summary per call regardless of input count
        let exports = ModuleExports::new().with_transform(|input: MessageStream| -> ResultStream {
            stream::once(async move {
                let count = input.count().await;
                Ok(Message::builder().payload(count.to_string()).build())
            })
            .boxed()
        });
        let dispatcher = Dispatcher::new(&FunctionDescriptor::classify(exports), 4).unwrap();

        let out: Vec<Message> = dispatcher
            .dispatch(inbound(vec![text("a"), text("b"), text("c")]))
            .collect()
            .await;

        assert_eq!(payloads(&out), vec!["3"]);
        assert_eq!(out[0].content_type(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_duplex_stream_error_items_continue() {
        let exports = ModuleExports::new().with_transform(|input: MessageStream| -> ResultStream {
            input
                .map(|msg| {
                    if msg.payload().as_ref() == b"bad" {
                        Err(FunctionError::msg("bad item"))
                    } else {
                        Ok(msg)
                    }
                })
                .boxed()
        });
        let dispatcher = Dispatcher::new(&FunctionDescriptor::classify(exports), 4).unwrap();

        let out: Vec<Message> = dispatcher
            .dispatch(inbound(vec![text("a"), text("bad"), text("c")]))
            .collect()
            .await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[1].error(), Some(INVOCATION_ERROR));
        assert!(out[2].error().is_none());
    }

    #[tokio::test]
    async fn test_duplex_stream_panic_while_polling_ends_call() {
        let exports = ModuleExports::new().with_transform(|input: MessageStream| -> ResultStream {
            input
                .map(|msg| {
                    if msg.payload().as_ref() == b"boom" {
                        panic!("stream exploded");
                    }
                    Ok(msg)
                })
                .boxed()
        });
        let dispatcher = Dispatcher::new(&FunctionDescriptor::classify(exports), 4).unwrap();

        let out: Vec<Message> = dispatcher
            .dispatch(inbound(vec![text("a"), text("boom"), text("never")]))
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert!(out[0].error().is_none());
        assert_eq!(out[1].error(), Some(INVOCATION_ERROR));
    }

    #[tokio::test]
    async fn test_duplex_stream_panic_in_transform_call() {
        let exports = ModuleExports::new().with_transform(|_input: MessageStream| -> ResultStream {
            panic!("no stream for you")
        });
        let dispatcher = Dispatcher::new(&FunctionDescriptor::classify(exports), 4).unwrap();

        let out: Vec<Message> = dispatcher
            .dispatch(inbound(vec![text("a")]))
            .collect()
            .await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].error(), Some(INVOCATION_ERROR));
    }

    #[tokio::test]
    async fn test_duplex_stream_output_before_input_uses_default() {
        let exports = ModuleExports::new().with_transform(|_input: MessageStream| -> ResultStream {
            stream::iter(vec![Ok(Message::builder().payload("hello").build())]).boxed()
        });
        let dispatcher = Dispatcher::new(&FunctionDescriptor::classify(exports), 4).unwrap();

        let out: Vec<Message> = dispatcher.dispatch(inbound(vec![])).collect().await;

        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].content_type(),
            Some(crate::negotiate::DEFAULT_CONTENT_TYPE)
        );
    }
}
