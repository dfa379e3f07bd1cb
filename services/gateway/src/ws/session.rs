//! Manages the WebSocket connection lifecycle, from upgrade to teardown.

use super::protocol::{Frame, events};
use crate::{error::GatewayError, state::AppState};
use axum::{
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use uuid::Uuid;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sending half of a connection.
///
/// Frames are queued on an unbounded channel and written by a dedicated task.
/// The number of queued-but-unwritten bytes is the connection's buffered amount,
/// which flow control compares against its watermarks.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
    buffered: Arc<AtomicUsize>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                buffered: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), GatewayError> {
        let bytes = frame.encode()?;
        let len = bytes.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(Message::Binary(bytes.into())).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            debug!(event = %frame.event, "Connection writer gone; frame dropped");
        }
        Ok(())
    }

    /// Bytes queued for the socket but not yet written.
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Queues a close frame behind everything already queued.
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }

    fn written(&self, len: usize) {
        self.buffered.fetch_sub(len, Ordering::AcqRel);
    }
}

/// Per-connection state that lives exactly as long as the connection.
pub struct ClientContext {
    pub connection_id: u64,
    pub session_id: String,
    pub remote_addr: SocketAddr,
    /// Correlates every log line of this connection.
    pub span: Span,
    pub outbound: Outbound,
    /// Cancelled when the connection is closing.
    pub shutdown: CancellationToken,
}

impl ClientContext {
    pub fn new(connection_id: u64, remote_addr: SocketAddr, outbound: Outbound) -> Self {
        let session_id = format!("sessionID:{}", Uuid::new_v4());
        let span = info_span!(
            "ws_session",
            session_id = %session_id,
            connection_id,
            ip = %remote_addr.ip()
        );
        Self {
            connection_id,
            session_id,
            remote_addr,
            span,
            outbound,
            shutdown: CancellationToken::new(),
        }
    }

    /// Queues a frame for this client, logging instead of failing.
    pub fn send(&self, frame: Frame) {
        if let Err(e) = self.outbound.send_frame(&frame) {
            error!(event = %frame.event, error = %e, "Failed to send frame");
        }
    }
}

/// Live connections keyed by a monotonically assigned id.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<ClientContext>>>,
}

impl ConnectionRegistry {
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn register(&self, context: Arc<ClientContext>) {
        self.connections
            .lock()
            .await
            .insert(context.connection_id, context);
    }

    pub async fn remove(&self, connection_id: u64) -> Option<Arc<ClientContext>> {
        self.connections.lock().await.remove(&connection_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Asks every live connection to close.
    pub async fn close_all(&self) {
        for context in self.connections.lock().await.values() {
            context.shutdown.cancel();
        }
    }
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, remote_addr, state))
}

async fn handle_socket(socket: WebSocket, remote_addr: SocketAddr, state: Arc<AppState>) {
    let (outbound, outbound_rx) = Outbound::channel();
    let context = Arc::new(ClientContext::new(
        state.connections.next_id(),
        remote_addr,
        outbound,
    ));
    let span = context.span.clone();
    run_session(socket, outbound_rx, context, state)
        .instrument(span)
        .await;
}

async fn run_session(
    socket: WebSocket,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    context: Arc<ClientContext>,
    state: Arc<AppState>,
) {
    let (socket_tx, mut socket_rx) = socket.split();
    let writer = tokio::spawn(
        write_outbound(socket_tx, outbound_rx, context.outbound.clone()).in_current_span(),
    );

    state.connections.register(context.clone()).await;
    info!("New WebSocket connection");
    context.send(Frame::success(events::CONNECTED, json!({})));

    loop {
        tokio::select! {
            biased;
            _ = context.shutdown.cancelled() => {
                info!("Closing connection");
                break;
            }
            msg = socket_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => state.dispatcher.dispatch(&context, &data).await,
                Some(Ok(Message::Text(_))) => {
                    warn!("Rejected text frame");
                    context.send(Frame::from_error(&GatewayError::ExpectedBinary));
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the connection");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    error!(error = ?e, "Error receiving from client WebSocket");
                    break;
                }
            },
        }
    }

    context.shutdown.cancel();
    state.transcriptions.close(&context.session_id).await;
    state.dispatcher.forget(&context).await;
    state.connections.remove(context.connection_id).await;
    context.outbound.close();
    drain_writer(writer, WRITER_DRAIN_TIMEOUT).await;
    info!("WebSocket connection closed");
}

/// Waits for the writer to flush, aborting it if the peer stops reading.
///
/// Returns `false` when the writer had to be aborted.
async fn drain_writer(writer: JoinHandle<()>, limit: Duration) -> bool {
    let abort = writer.abort_handle();
    if tokio::time::timeout(limit, writer).await.is_err() {
        warn!("Timed out flushing outbound frames");
        abort.abort();
        return false;
    }
    true
}

/// Writes queued frames to the socket until a close frame is written.
async fn write_outbound(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    outbound: Outbound,
) {
    while let Some(message) = outbound_rx.recv().await {
        let len = match &message {
            Message::Binary(data) => data.len(),
            _ => 0,
        };
        let closing = matches!(message, Message::Close(_));
        let result = socket_tx.send(message).await;
        outbound.written(len);
        if let Err(e) = result {
            debug!(error = %e, "Socket write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_context_identity() {
        let (outbound, _rx) = Outbound::channel();
        let context = ClientContext::new(7, addr(), outbound);
        assert_eq!(context.connection_id, 7);
        assert!(context.session_id.starts_with("sessionID:"));
        assert!(!context.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_outbound_tracks_buffered_bytes() {
        let (outbound, mut rx) = Outbound::channel();
        outbound
            .send_frame(&Frame::success(events::CONNECTED, json!({})))
            .unwrap();
        let queued = outbound.buffered_amount();
        assert!(queued > 0);

        let Some(Message::Binary(data)) = rx.recv().await else {
            panic!("expected a binary frame");
        };
        assert_eq!(data.len(), queued);
        outbound.written(data.len());
        assert_eq!(outbound.buffered_amount(), 0);

        let frame = Frame::decode(&data).unwrap();
        assert_eq!(frame.event, "connected");
    }

    #[tokio::test]
    async fn test_outbound_after_writer_gone() {
        let (outbound, rx) = Outbound::channel();
        drop(rx);
        outbound.send_frame(&Frame::error("X", "late")).unwrap();
        assert_eq!(outbound.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_close_is_queued_behind_frames() {
        let (outbound, mut rx) = Outbound::channel();
        outbound.send_frame(&Frame::error("X", "first")).unwrap();
        outbound.close();
        assert!(matches!(rx.recv().await, Some(Message::Binary(_))));
        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_is_aborted() {
        let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel::<()>();
        let writer = tokio::spawn(async move {
            let _held = dropped_tx;
            std::future::pending::<()>().await;
        });

        assert!(!drain_writer(writer, Duration::from_secs(5)).await);
        assert!(dropped_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_finished_writer_drains() {
        let writer = tokio::spawn(async {});
        assert!(drain_writer(writer, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_registry_assigns_ids_and_removes() {
        let registry = ConnectionRegistry::default();
        let first = registry.next_id();
        let second = registry.next_id();
        assert!(second > first);

        let (outbound, _rx) = Outbound::channel();
        let context = Arc::new(ClientContext::new(first, addr(), outbound));
        registry.register(context.clone()).await;
        assert_eq!(registry.len().await, 1);

        registry.close_all().await;
        assert!(context.shutdown.is_cancelled());

        assert!(registry.remove(first).await.is_some());
        assert!(registry.remove(first).await.is_none());
        assert!(registry.is_empty().await);
    }
}
