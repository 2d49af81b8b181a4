//! Worker stdin writer task.
//!
//! Receives outbound JSON values from an [`mpsc`] channel and writes each
//! one as a single `\n`-terminated line.

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Serialise and write queued messages to `stdin`.
///
/// Exits cleanly on cancellation or when every sender is dropped.
///
/// # Errors
///
/// Returns [`AppError::Io`]`("write failed: …")` when the write fails,
/// typically because the worker has exited.
pub async fn run_writer<W>(
    worker_id: &str,
    mut stdin: W,
    mut msg_rx: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(worker_id, "writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(worker_id, "writer: channel closed, stopping");
                    break;
                };

                let mut bytes = serde_json::to_vec(&value)?;
                bytes.push(b'\n');

                if let Err(e) = write_line(&mut stdin, &bytes).await {
                    warn!(worker_id, error = %e, "writer: write to stdin failed");
                    return Err(AppError::Io(format!("write failed: {e}")));
                }
            }
        }
    }

    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(stdin: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}
