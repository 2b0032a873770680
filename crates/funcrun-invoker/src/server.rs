// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport glue: accepts connections and serves Calls through the dispatcher.

use std::sync::Arc;

use futures::{StreamExt, stream};
use funcrun_protocol::function_proto;
use funcrun_protocol::{CallHandler, ConnectionHandler, FunctionServer};
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::function::MessageStream;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::message::Message;

/// Accept connections until the lifecycle leaves `READY`.
///
/// On leaving `READY` the endpoint stops accepting new connections.
/// Established connections stay open so in-flight Calls can finish; new
/// Calls on them are rejected by the call gate.
pub async fn run_call_server(
    server: Arc<FunctionServer>,
    lifecycle: Lifecycle,
    dispatcher: Arc<Dispatcher>,
) {
    let stop = lifecycle.wait_until(LifecycleState::Draining);
    tokio::pin!(stop);

    info!(addr = ?server.local_addr().ok(), "Call server accepting connections");

    loop {
        tokio::select! {
            biased;

            _ = &mut stop => {
                server.stop_accepting();
                info!("Call server stopped accepting connections");
                break;
            }

            incoming = server.accept() => {
                match incoming {
                    Some(incoming) => {
                        let lifecycle = lifecycle.clone();
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            match incoming.await {
                                Ok(connection) => {
                                    let remote_addr = connection.remote_address();
                                    debug!(%remote_addr, "accepted connection");
                                    handle_connection(ConnectionHandler::new(connection), lifecycle, dispatcher).await;
                                }
                                Err(e) => {
                                    debug!("failed to accept connection: {}", e);
                                }
                            }
                        });
                    }
                    None => {
                        // Endpoint closed
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    conn: ConnectionHandler,
    lifecycle: Lifecycle,
    dispatcher: Arc<Dispatcher>,
) {
    conn.run(move |call| {
        let lifecycle = lifecycle.clone();
        let dispatcher = dispatcher.clone();
        async move { serve_call(call, lifecycle, dispatcher).await }
    })
    .await;
}

/// Serve one Call from first inbound Message to the end of its replies.
#[instrument(skip_all, fields(call_id = call.id()))]
async fn serve_call(call: CallHandler, lifecycle: Lifecycle, dispatcher: Arc<Dispatcher>) {
    let Some(_permit) = lifecycle.try_begin_call() else {
        debug!(state = %lifecycle.state(), "rejecting call");
        if let Err(e) = call.reject().await {
            debug!(error = %e, "failed to reject call");
        }
        return;
    };

    let (mut sender, receiver) = call.into_split();

    let inbound: MessageStream = stream::unfold(Some(receiver), |state| async move {
        let mut receiver = state?;
        match receiver.read_message().await {
            Ok(Some(msg)) => Some((Message::from(msg), Some(receiver))),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to read inbound message");
                None
            }
        }
    })
    .boxed();

    let mut outbound = dispatcher.dispatch(inbound);
    let mut sent = 0usize;
    while let Some(msg) = outbound.next().await {
        let wire = function_proto::Message::from(msg);
        if let Err(e) = sender.send(&wire).await {
            warn!(error = %e, "caller went away mid-call");
            return;
        }
        sent += 1;
    }

    if let Err(e) = sender.close().await {
        debug!(error = %e, "call ended uncleanly");
    }
    debug!(replies = sent, "call complete");
}
