use std::{borrow::Cow, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use lawhelp_core::chat::{ChatTransport, Inbound};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::AppState;

const TRACING_TARGET: &str = "lawhelp_server::ws";

/// Close frame reasons are limited to 123 bytes.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// `GET /api/chat`: upgrade to a chat session.
pub(crate) async fn chat_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state))
}

async fn handle_chat_socket(socket: WebSocket, state: Arc<AppState>) {
    let Some(chat) = state.chat.clone() else {
        let reason = state
            .completion
            .as_ref()
            .err()
            .cloned()
            .unwrap_or_else(|| "chat is unavailable".to_string());
        tracing::warn!(target: TRACING_TARGET, %reason, "refusing chat connection");
        refuse(socket, &reason).await;
        return;
    };

    let transport = WsTransport::new(socket);
    let id = chat.run(transport).await;
    tracing::debug!(target: TRACING_TARGET, session = %id, "websocket finished");
}

/// Tell the peer why the connection cannot be served, then close it.
async fn refuse(mut socket: WebSocket, reason: &str) {
    for message in refusal(reason) {
        if socket.send(message).await.is_err() {
            break;
        }
    }
}

fn refusal(reason: &str) -> [Message; 2] {
    [
        Message::Text(format!("Error: {reason}")),
        Message::Close(Some(CloseFrame {
            code: close_code::ERROR,
            reason: Cow::Owned(close_reason(reason).to_string()),
        })),
    ]
}

/// Longest prefix of `reason` that fits a close frame.
fn close_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// [`ChatTransport`] over an axum WebSocket.
///
/// A reader task drains the socket into a channel so that a disconnect is
/// noticed even while the chat loop is busy with a backend call.
struct WsTransport {
    sender: SplitSink<WebSocket, Message>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    reader: JoinHandle<()>,
    disconnected: CancellationToken,
    closed: bool,
}

impl WsTransport {
    fn new(socket: WebSocket) -> Self {
        let (sender, receiver) = socket.split();
        let (tx, inbound) = mpsc::unbounded_channel();
        let disconnected = CancellationToken::new();
        let reader = tokio::spawn(read_socket(receiver, tx, disconnected.clone()));
        Self {
            sender,
            inbound,
            reader,
            disconnected,
            closed: false,
        }
    }
}

/// What the reader does with one item from the socket stream.
#[derive(Debug, PartialEq)]
enum Frame {
    Deliver(Inbound),
    Skip,
    /// Deliver, then stop reading.
    Last(Inbound),
}

fn frame(item: Option<Result<Message, axum::Error>>) -> Frame {
    match item {
        Some(Ok(Message::Text(text))) => Frame::Deliver(Inbound::Text(text)),
        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
            Ok(text) => Frame::Deliver(Inbound::Text(text)),
            Err(_) => {
                tracing::debug!(target: TRACING_TARGET, "ignoring non-UTF-8 binary frame");
                Frame::Skip
            }
        },
        // Pings are answered by axum.
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => Frame::Skip,
        Some(Ok(Message::Close(close))) => {
            tracing::debug!(
                target: TRACING_TARGET,
                code = close.as_ref().map(|f| f.code),
                "peer sent close"
            );
            Frame::Last(Inbound::Closed)
        }
        Some(Err(e)) => Frame::Last(Inbound::Failed(e.to_string())),
        None => Frame::Last(Inbound::Closed),
    }
}

async fn read_socket(
    mut receiver: SplitStream<WebSocket>,
    tx: mpsc::UnboundedSender<Inbound>,
    disconnected: CancellationToken,
) {
    loop {
        match frame(receiver.next().await) {
            Frame::Deliver(event) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            Frame::Skip => {}
            Frame::Last(event) => {
                let _ = tx.send(event);
                break;
            }
        }
    }
    disconnected.cancel();
}

#[async_trait]
impl ChatTransport for WsTransport {
    async fn recv(&mut self) -> Inbound {
        self.inbound.recv().await.unwrap_or(Inbound::Closed)
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.sender
            .send(Message::Text(text))
            .await
            .context("websocket send failed")
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if !self.disconnected.is_cancelled() {
                let _ = self.sender.send(Message::Close(None)).await;
            }
            let _ = self.sender.close().await;
        }
        self.reader.abort();
    }

    fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
