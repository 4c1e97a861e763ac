//! Quiescence framing for unframed subprocess output.
//!
//! Interactive programs such as `dfrotz` never mark the end of a response;
//! they print and then wait for input. The framer infers response boundaries
//! from silence: bytes are accumulated until no new output has arrived for
//! the configured quiescence interval, and the accumulated text is emitted as
//! one turn.
//!
//! The interval is a tuning knob, not a protocol guarantee. It must exceed the
//! host's scheduling jitter between two writes of the same response, yet stay
//! short enough to keep the conversation responsive.
//!
//! Two tasks cooperate:
//! - a reader that drives a [`FramedRead`] with [`BytesCodec`] and forwards
//!   each non-empty chunk into a bounded queue, closing it on EOF or error;
//! - an accumulator that appends chunks, restarts the idle timer on every
//!   chunk, and emits the buffer when the timer fires or the queue closes.

use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, trace, warn};

/// Chunks buffered between the reader and the accumulator.
const CHUNK_QUEUE_CAPACITY: usize = 64;

/// Completed turns buffered ahead of the consumer.
const TURN_QUEUE_CAPACITY: usize = 16;

/// Finite, non-restartable sequence of turns produced by [`frame`].
#[derive(Debug)]
pub struct Turns {
    rx: mpsc::Receiver<String>,
}

impl Turns {
    /// Wait for the next turn. `None` once the output stream has ended and
    /// every buffered turn has been consumed.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Return a turn that is already complete, without waiting.
    pub fn try_next(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// Split `stream` into turns separated by at least `quiescence` of silence.
///
/// Must be called from within a tokio runtime; the reader and accumulator
/// tasks are spawned immediately and stop on their own when the stream ends
/// or when the returned [`Turns`] is dropped.
#[must_use]
pub fn frame<R>(stream: R, quiescence: Duration) -> Turns
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE_CAPACITY);
    let (turn_tx, turn_rx) = mpsc::channel(TURN_QUEUE_CAPACITY);

    tokio::spawn(read_chunks(stream, chunk_tx));
    tokio::spawn(accumulate(chunk_rx, turn_tx, quiescence));

    Turns { rx: turn_rx }
}

async fn read_chunks<R>(stream: R, chunk_tx: mpsc::Sender<BytesMut>)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(stream, BytesCodec::new());

    loop {
        match framed.next().await {
            Some(Ok(chunk)) if !chunk.is_empty() => {
                trace!(len = chunk.len(), "framer: chunk read");
                if chunk_tx.send(chunk).await.is_err() {
                    debug!("framer: accumulator gone, stopping reader");
                    break;
                }
            }
            Some(Ok(_)) | None => {
                debug!("framer: end of stream");
                break;
            }
            Some(Err(err)) => {
                warn!(%err, "framer: read error, treating as end of stream");
                break;
            }
        }
    }
}

async fn accumulate(
    mut chunk_rx: mpsc::Receiver<BytesMut>,
    turn_tx: mpsc::Sender<String>,
    quiescence: Duration,
) {
    let mut buf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            chunk = chunk_rx.recv() => {
                let Some(chunk) = chunk else {
                    if !buf.is_empty() {
                        // Receiver may already be gone; nothing left to do either way.
                        let _ = turn_tx.send(decode(&buf)).await;
                    }
                    debug!("framer: turn source closed");
                    return;
                };
                buf.extend_from_slice(&chunk);
            }
            // Armed only while there is something to emit.
            () = tokio::time::sleep(quiescence), if !buf.is_empty() => {
                let turn = decode(&buf);
                buf.clear();
                if turn_tx.send(turn).await.is_err() {
                    debug!("framer: turn consumer gone, stopping");
                    return;
                }
            }
            () = turn_tx.closed() => {
                debug!("framer: turn consumer gone, stopping");
                return;
            }
        }
    }
}

fn decode(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf).into_owned()
}
