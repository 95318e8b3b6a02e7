//! Stream writer task.
//!
//! Receives [`OutboundFrame`]s from a tokio [`mpsc`] channel and writes each
//! as one NDJSON line through a [`FramedWrite`] over the transport.

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stream::codec::FrameCodec;
use crate::stream::frames::OutboundFrame;
use crate::{AppError, Result};

/// Writer task: serialises outbound frames to `sink`.
///
/// Exits cleanly when `cancel` fires or every sender of `frame_rx` is
/// dropped. Pending frames are flushed before exit on channel close.
///
/// # Errors
///
/// - [`AppError::Protocol`] if a frame cannot be serialised.
/// - [`AppError::Io`] if the transport write fails.
pub async fn run_writer<W>(
    session_id: String,
    sink: W,
    mut frame_rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(sink, FrameCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "stream writer: cancellation received, stopping");
                break;
            }

            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    debug!(session_id, "stream writer: frame channel closed, stopping");
                    break;
                };
                let line = frame.to_line()?;
                framed.send(line).await.map_err(|e| {
                    warn!(session_id, error = %e, "stream writer: write failed");
                    AppError::Io(format!("write failed: {e}"))
                })?;
            }
        }
    }

    let _ = framed.close().await;
    Ok(())
}
