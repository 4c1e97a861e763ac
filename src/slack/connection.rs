//! One live RTM WebSocket connection.
//!
//! A [`Connection`] owns the socket through two tasks:
//! - the receive task parses frames into [`InboundMessage`]s and closes the
//!   inbound queue on the first read failure, close frame, or end of stream;
//! - the send task stamps each queued [`OutboundMessage`] with the next
//!   sequence id (starting at 0 for every connection) and writes it. The
//!   first write failure cancels both tasks, so the inbound queue closes
//!   either way.
//!
//! A connection is never reused. When it is superseded, [`Connection::release`]
//! stops both tasks and waits for them, which drops both socket halves.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::slack::message::{InboundMessage, OutboundMessage};
use crate::{AppError, Result};

const INBOUND_QUEUE_CAPACITY: usize = 256;
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Upper bound on waiting for the I/O tasks during [`Connection::release`].
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle for queuing frames on a connection's send task.
#[derive(Debug, Clone)]
pub struct OutboundSink {
    tx: mpsc::Sender<OutboundMessage>,
}

impl OutboundSink {
    /// A sink paired with the receiver that drains it.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a frame for sending.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when the connection's send task has
    /// stopped.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| AppError::Transport("connection no longer accepts frames".into()))
    }

    /// `true` once the send task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An active RTM connection and its two I/O tasks.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    inbound: mpsc::Receiver<InboundMessage>,
    outbound: OutboundSink,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Open a WebSocket to `url` and start the I/O tasks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the handshake fails.
    pub async fn dial(url: &str) -> Result<Self> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| AppError::Transport(format!("websocket dial failed: {err}")))?;
        Ok(Self::spawn(ws))
    }

    /// Take ownership of an established WebSocket and start the I/O tasks.
    #[must_use]
    pub fn spawn<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (write, read) = ws.split();
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (outbound, outbound_rx) = OutboundSink::channel(OUTBOUND_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let span = info_span!("rtm_connection", connection_id = %id);

        let receive = tokio::spawn(
            receive_frames(read, inbound_tx, cancel.clone()).instrument(span.clone()),
        );
        let send = tokio::spawn(send_frames(write, outbound_rx, cancel.clone()).instrument(span));

        info!(connection_id = %id, "rtm connection active");

        Self {
            id,
            inbound,
            outbound,
            cancel,
            tasks: vec![receive, send],
        }
    }

    /// Next inbound message; `None` once the connection has dropped.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.inbound.recv().await
    }

    /// A sink for queuing frames on this connection.
    #[must_use]
    pub fn outbound(&self) -> OutboundSink {
        self.outbound.clone()
    }

    /// Identifier used in log fields.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop both I/O tasks and drop the socket.
    pub async fn release(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            match tokio::time::timeout(RELEASE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(connection_id = %self.id, %err, "connection task failed"),
                Err(_elapsed) => {
                    warn!(connection_id = %self.id, "connection task did not stop in time");
                }
            }
        }
        info!(connection_id = %self.id, "rtm connection released");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_frames<S>(
    mut read: SplitStream<WebSocketStream<S>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("receive task: cancellation received, stopping");
                break;
            }

            frame = read.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, "receive task: discarding non-utf8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(close))) => {
                info!(?close, "receive task: server closed the connection");
                break;
            }
            // Ping/pong are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(%err, "receive task: read failed, disconnecting");
                break;
            }
            None => {
                info!("receive task: stream ended");
                break;
            }
        };

        match InboundMessage::parse(&text) {
            Ok(Some(message)) => {
                if inbound_tx.send(message).await.is_err() {
                    debug!("receive task: inbound consumer gone, stopping");
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%err, raw_frame = %text, "receive task: discarding frame");
            }
        }
    }
}

async fn send_frames<S>(
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundMessage>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut next_id: u64 = 0;

    loop {
        let message = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("send task: cancellation received, closing socket");
                if let Err(err) = write.close().await {
                    debug!(%err, "send task: close handshake failed");
                }
                break;
            }

            message = outbound_rx.recv() => message,
        };

        let Some(mut message) = message else {
            debug!("send task: outbound queue closed, stopping");
            break;
        };

        message.id = Some(next_id);
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "send task: failed to serialise frame, skipping");
                continue;
            }
        };

        if let Err(err) = write.send(Message::Text(payload)).await {
            warn!(%err, "send task: write failed, closing connection");
            // Stops the receive task too, which closes the inbound queue.
            cancel.cancel();
            break;
        }

        debug!(id = next_id, kind = message.kind, "send task: frame sent");
        next_id += 1;
    }
}
