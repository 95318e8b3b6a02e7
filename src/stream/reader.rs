//! Stream reader task.
//!
//! Reads newline-delimited JSON frames from the training process, parses
//! each line into an [`InboundFrame`], and forwards the results through a
//! tokio [`mpsc`] channel to the session worker.
//!
//! Malformed lines are reported as [`StreamEvent::Malformed`] so the worker
//! can count consecutive protocol errors; they never stop the reader.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stream::codec::FrameCodec;
use crate::stream::frames::{parse_inbound_line, InboundFrame};
use crate::AppError;

/// Event forwarded from the reader to the session worker.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A decoded frame.
    Frame(InboundFrame),
    /// A line that could not be decoded.
    Malformed(String),
    /// The stream ended; no further events follow.
    Closed {
        /// Human-readable cause.
        reason: String,
    },
}

/// Reader task: decodes frames from `source` and emits [`StreamEvent`]s.
///
/// On EOF or an unrecoverable I/O error, sends [`StreamEvent::Closed`] before
/// returning. When `cancel` fires the reader exits without a close event.
pub async fn run_reader<R>(
    session_id: String,
    source: R,
    max_frame_bytes: usize,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(source, FrameCodec::with_max_frame_bytes(max_frame_bytes));
    // FramedRead yields a single `None` after a decoder error before resuming.
    let mut after_decode_error = false;

    loop {
        let event = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "stream reader: cancellation received, stopping");
                return;
            }

            item = framed.next() => match item {
                None if after_decode_error => {
                    after_decode_error = false;
                    continue;
                }
                None => {
                    debug!(session_id, "stream reader: EOF detected");
                    send_closed(&event_tx, &session_id, "stream closed").await;
                    return;
                }
                Some(Err(AppError::Protocol(msg))) => {
                    after_decode_error = true;
                    warn!(session_id, error = msg.as_str(), "stream reader: framing error, skipping");
                    StreamEvent::Malformed(msg)
                }
                Some(Err(e)) => {
                    warn!(session_id, error = %e, "stream reader: IO error, stopping");
                    send_closed(&event_tx, &session_id, &format!("stream error: {e}")).await;
                    return;
                }
                Some(Ok(line)) => {
                    after_decode_error = false;
                    match parse_inbound_line(&line) {
                        Ok(Some(frame)) => StreamEvent::Frame(frame),
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(session_id, error = %e, "stream reader: parse error, skipping line");
                            StreamEvent::Malformed(e.to_string())
                        }
                    }
                }
            },
        };

        if event_tx.send(event).await.is_err() {
            debug!(session_id, "stream reader: event_tx closed, stopping");
            return;
        }
    }
}

async fn send_closed(event_tx: &mpsc::Sender<StreamEvent>, session_id: &str, reason: &str) {
    let event = StreamEvent::Closed {
        reason: reason.to_owned(),
    };
    if event_tx.send(event).await.is_err() {
        debug!(
            session_id,
            "stream reader: event_tx closed before close event could be delivered"
        );
    }
}
