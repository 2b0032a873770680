// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process runtime tests: a real QUIC Call server on loopback driven by
//! the protocol client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use funcrun_invoker::{
    ExitStatus, FunctionError, InvokerError, InvokerRuntime, LifecycleState, Message,
    MessageStream, ModuleExports, ResultStream, builtin,
};
use funcrun_protocol::function_proto;
use funcrun_protocol::{ClientError, FunctionClient};

fn text(content_type: &str, accept: &str, payload: &str) -> function_proto::Message {
    let mut msg = function_proto::Message::text(content_type, payload);
    msg.headers.insert(
        "Accept".to_string(),
        function_proto::HeaderValue {
            values: vec![accept.to_string()],
        },
    );
    msg
}

async fn start(exports: ModuleExports) -> InvokerRuntime {
    InvokerRuntime::builder()
        .exports(exports)
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .start()
        .await
        .expect("runtime should start")
}

/// Count how many times destroy ran.
fn with_destroy_counter(exports: ModuleExports) -> (ModuleExports, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let exports = exports.with_destroy(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, FunctionError>(())
        }
    });
    (exports, count)
}

async fn wait_for_state(runtime_lifecycle: &funcrun_invoker::Lifecycle, state: LifecycleState) {
    tokio::time::timeout(Duration::from_secs(5), runtime_lifecycle.wait_until(state))
        .await
        .expect("lifecycle should reach state");
}

#[tokio::test]
async fn test_echo_scenario() {
    let runtime = start(builtin::echo()).await;
    let client = FunctionClient::localhost_at(runtime.local_addr()).unwrap();

    let reply = client
        .request(&text("text/plain", "text/plain", "riff"))
        .await
        .unwrap();

    assert_eq!(reply.header("Content-Type"), Some("text/plain"));
    assert_eq!(reply.header("Error"), None);
    assert_eq!(&reply.payload[..], b"riff");

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_echo_negotiates_accept() {
    let runtime = start(builtin::echo()).await;
    let client = FunctionClient::localhost_at(runtime.local_addr()).unwrap();

    let reply = client
        .request(&text("text/plain", "application/json;q=0.9, text/csv", "1,2"))
        .await
        .unwrap();
    assert_eq!(reply.header("Content-Type"), Some("text/csv"));

    let reply = client
        .request(&function_proto::Message::text("text/plain", "no accept"))
        .await
        .unwrap();
    assert_eq!(reply.header("Content-Type"), Some("text/plain"));

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_streaming_echo_scenario() {
    let runtime = start(builtin::echo_stream()).await;
    let client = FunctionClient::localhost_at(runtime.local_addr()).unwrap();

    let requests: Vec<_> = (1..=3)
        .map(|i| text("text/plain", "text/plain", &format!("riff {}", i)))
        .collect();
    let replies = client.stream(&requests).await.unwrap();

    let payloads: Vec<_> = replies
        .iter()
        .map(|r| String::from_utf8(r.payload.to_vec()).unwrap())
        .collect();
    assert_eq!(payloads, vec!["riff 1", "riff 2", "riff 3"]);
    assert!(replies.iter().all(|r| r.header("Error").is_none()));
    assert!(
        replies
            .iter()
            .all(|r| r.header("Content-Type") == Some("text/plain"))
    );

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_reply_stream_keeps_order() {
    let runtime = start(builtin::echo()).await;
    let client = FunctionClient::localhost_at(runtime.local_addr()).unwrap();

    let requests: Vec<_> = (0..20)
        .map(|i| text("text/plain", "text/plain", &i.to_string()))
        .collect();
    let replies = client.stream(&requests).await.unwrap();

    assert_eq!(replies.len(), 20);
    for (i, reply) in replies.iter().enumerate() {
        assert_eq!(reply.payload, i.to_string().into_bytes());
    }

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_are_independent() {
    let runtime = start(builtin::echo_stream()).await;
    let client = Arc::new(FunctionClient::localhost_at(runtime.local_addr()).unwrap());
    client.connect().await.unwrap();

    let mut handles = Vec::new();
    for call in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let requests: Vec<_> = (0..5)
                .map(|i| text("text/plain", "text/plain", &format!("{}-{}", call, i)))
                .collect();
            let replies = client.stream(&requests).await.unwrap();
            let payloads: Vec<_> = replies.iter().map(|r| r.payload.to_vec()).collect();
            let expected: Vec<_> = requests.iter().map(|r| r.payload.to_vec()).collect();
            assert_eq!(payloads, expected);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_function_error_is_reported_per_message() {
    let exports = ModuleExports::new().with_call(|msg: Message| async move {
        if msg.payload().as_ref() == b"fail" {
            Err(FunctionError::msg("refusing to echo"))
        } else {
            Ok(msg)
        }
    });
    let runtime = start(exports).await;
    let client = FunctionClient::localhost_at(runtime.local_addr()).unwrap();

    let replies = client
        .stream(&[
            text("text/plain", "text/plain", "ok"),
            text("text/plain", "text/plain", "fail"),
            text("text/plain", "text/plain", "ok again"),
        ])
        .await
        .unwrap();

    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0].header("Error"), None);
    assert_eq!(
        replies[1].header("Error"),
        Some("error-server-function-invocation")
    );
    assert_eq!(&replies[1].payload[..], b"refusing to echo");
    assert_eq!(replies[2].header("Error"), None);

    // The process keeps serving
    let reply = client
        .request(&text("text/plain", "text/plain", "still alive"))
        .await
        .unwrap();
    assert_eq!(&reply.payload[..], b"still alive");

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_model_exit_status() {
    let err = InvokerRuntime::builder()
        .exports(ModuleExports::new())
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .start()
        .await
        .unwrap_err();

    assert_eq!(err.exit_status(), ExitStatus::UnknownInteractionModel);
    assert_eq!(err.exit_status().code(), 255);
}

#[tokio::test]
async fn test_init_error_exit_status() {
    let exports = builtin::echo().with_init(|| async {
        Err::<(), _>(FunctionError::msg("init refused"))
    });
    let err = InvokerRuntime::builder()
        .exports(exports)
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .start()
        .await
        .unwrap_err();

    assert!(matches!(err, InvokerError::Lifecycle(_)));
    assert_eq!(err.exit_status().code(), 2);
}

#[tokio::test]
async fn test_init_timeout_exit_status() {
    let exports = builtin::echo().with_init(|| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok::<_, FunctionError>(())
    });
    let err = InvokerRuntime::builder()
        .exports(exports)
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .init_timeout(Duration::from_millis(100))
        .start()
        .await
        .unwrap_err();

    assert_eq!(err.exit_status().code(), 1);
}

#[tokio::test]
async fn test_destroy_error_exit_status() {
    let exports = builtin::echo().with_destroy(|| async {
        Err::<(), _>(FunctionError::msg("destroy refused"))
    });
    let runtime = start(exports).await;

    let err = runtime.shutdown().await.unwrap_err();
    assert_eq!(err.exit_status().code(), 2);
}

#[tokio::test]
async fn test_destroy_timeout_exit_status() {
    let exports = builtin::echo().with_destroy(|| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok::<_, FunctionError>(())
    });
    let runtime = InvokerRuntime::builder()
        .exports(exports)
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .destroy_timeout(Duration::from_millis(100))
        .start()
        .await
        .unwrap();

    let err = runtime.shutdown().await.unwrap_err();
    assert_eq!(err.exit_status().code(), 1);
}

#[tokio::test]
async fn test_serve_honours_shutdown_future() {
    let (exports, destroyed) = with_destroy_counter(builtin::echo());
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    // Shutdown requested before the runtime is even started
    tx.send(()).unwrap();

    InvokerRuntime::builder()
        .exports(exports)
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .serve(async {
            let _ = rx.await;
        })
        .await
        .unwrap();

    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_draining_rejects_new_calls_and_waits_for_inflight() {
    let (exports, destroyed) = with_destroy_counter(builtin::echo_stream());
    let runtime = start(exports).await;
    let lifecycle = runtime.lifecycle().clone();
    let client = FunctionClient::localhost_at(runtime.local_addr()).unwrap();

    // Keep one duplex Call open
    let mut call = client.open_call().await.unwrap();
    call.send(&text("text/plain", "text/plain", "first"))
        .await
        .unwrap();
    let first = call.recv().await.unwrap().unwrap();
    assert_eq!(&first.payload[..], b"first");
    assert_eq!(lifecycle.active_calls(), 1);

    let shutdown = tokio::spawn(runtime.shutdown());
    wait_for_state(&lifecycle, LifecycleState::Draining).await;

    // New Calls on the existing connection are refused
    let refused = client
        .request(&text("text/plain", "text/plain", "late"))
        .await;
    assert!(matches!(refused, Err(ClientError::Rejected)));

    // destroy waits for the in-flight Call
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    assert!(!shutdown.is_finished());

    // The in-flight Call still works and can finish normally
    call.send(&text("text/plain", "text/plain", "second"))
        .await
        .unwrap();
    let second = call.recv().await.unwrap().unwrap();
    assert_eq!(&second.payload[..], b"second");
    call.finish().unwrap();
    assert!(call.recv().await.unwrap().is_none());

    shutdown.await.unwrap().unwrap();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.state(), LifecycleState::Terminated);
}

#[tokio::test]
async fn test_drain_timeout_still_runs_destroy() {
    let (exports, destroyed) = with_destroy_counter(builtin::echo_stream());
    let runtime = InvokerRuntime::builder()
        .exports(exports)
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .drain_timeout(Duration::from_millis(200))
        .start()
        .await
        .unwrap();
    let client = FunctionClient::localhost_at(runtime.local_addr()).unwrap();

    // A Call that never finishes
    let mut call = client.open_call().await.unwrap();
    call.send(&text("text/plain", "text/plain", "hang"))
        .await
        .unwrap();
    let _ = call.recv().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("shutdown should not wait past the drain timeout")
        .unwrap();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_custom_duplex_transform_over_the_wire() {
    // Upper-cases every payload, then appends a trailer Message
    let exports = ModuleExports::new()
        .produces("text/plain")
        .with_transform(|input: MessageStream| -> ResultStream {
            let upper = input.map(|msg| {
                let text = String::from_utf8_lossy(msg.payload()).to_uppercase();
                Ok(Message::builder().payload(text).build())
            });
            let trailer = futures::stream::once(async {
                Ok(Message::builder()
                    .content_type("application/x-trailer")
                    .payload("done")
                    .build())
            });
            upper.chain(trailer).boxed()
        });
    let runtime = start(exports).await;
    let client = FunctionClient::localhost_at(runtime.local_addr()).unwrap();

    let replies = client
        .stream(&[
            text("text/plain", "text/plain", "a"),
            text("text/plain", "text/plain", "b"),
        ])
        .await
        .unwrap();

    let payloads: Vec<_> = replies.iter().map(|r| r.payload.to_vec()).collect();
    assert_eq!(payloads, vec![b"A".to_vec(), b"B".to_vec(), b"done".to_vec()]);
    assert_eq!(replies[0].header("Content-Type"), Some("text/plain"));
    assert_eq!(
        replies[2].header("Content-Type"),
        Some("application/x-trailer")
    );

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unframeable_reply_becomes_error_message() {
    let exports = ModuleExports::new().with_call(|msg: Message| async move {
        let payload = if &msg.payload()[..] == b"big" {
            vec![b'x'; funcrun_protocol::frame::MAX_FRAME_SIZE + 1]
        } else {
            msg.payload().to_vec()
        };
        Ok::<_, FunctionError>(Message::builder().payload(payload).build())
    });
    let runtime = start(exports).await;
    let client = FunctionClient::localhost_at(runtime.local_addr()).unwrap();

    let replies = client
        .stream(&[
            text("text/plain", "text/plain", "big"),
            text("text/plain", "text/plain", "small"),
        ])
        .await
        .unwrap();

    assert_eq!(replies.len(), 2);
    assert_eq!(
        replies[0].header("Error"),
        Some("error-server-function-invocation")
    );
    assert_eq!(replies[0].header("Content-Type"), Some("text/plain"));
    assert_eq!(replies[1].header("Error"), None);
    assert_eq!(&replies[1].payload[..], b"small");

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_streaming_echo_keeps_mixed_content_types() {
    let runtime = start(builtin::echo_stream()).await;
    let client = FunctionClient::localhost_at(runtime.local_addr()).unwrap();

    let replies = client
        .stream(&[
            function_proto::Message::text("text/plain", "a"),
            function_proto::Message::text("application/json", "{}"),
            function_proto::Message::text("text/csv", "x,y"),
        ])
        .await
        .unwrap();

    let echoed: Vec<_> = replies
        .iter()
        .map(|r| (r.header("Content-Type"), r.payload.to_vec()))
        .collect();
    assert_eq!(
        echoed,
        vec![
            (Some("text/plain"), b"a".to_vec()),
            (Some("application/json"), b"{}".to_vec()),
            (Some("text/csv"), b"x,y".to_vec()),
        ]
    );

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_still_runs_destroy() {
    let (exports, destroyed) = with_destroy_counter(builtin::echo());

    // TEST-NET-1 is never a local address
    let err = InvokerRuntime::builder()
        .exports(exports)
        .bind_addr("192.0.2.1:0".parse().unwrap())
        .start()
        .await
        .unwrap_err();

    assert!(matches!(err, InvokerError::Server(_)));
    assert_eq!(err.exit_status(), ExitStatus::Config);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}
