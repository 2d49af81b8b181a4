//! Worker stdout reader task.
//!
//! Drives a [`FramedRead`] over the worker's stdout using [`WorkerCodec`]
//! and hands each decoded [`InboundLine`] to a synchronous sink. The sink
//! runs on the reader task itself, so responses are correlated in arrival
//! order before any later event is looked at.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::WorkerCodec;
use crate::protocol::message::{parse_inbound_line, InboundLine};
use crate::AppError;

/// Why the reader loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The cancellation token fired.
    Cancelled,
    /// The stream reached EOF.
    Closed,
    /// Unrecoverable I/O error.
    Failed(String),
}

/// Read lines from `stdout` until EOF, I/O failure or cancellation.
///
/// Blank, malformed and over-long lines are logged and skipped; they never
/// terminate the loop.
pub async fn run_reader<R, F>(
    worker_id: &str,
    stdout: R,
    mut sink: F,
    cancel: CancellationToken,
) -> ReaderExit
where
    R: AsyncRead + Unpin + Send,
    F: FnMut(InboundLine) + Send,
{
    let mut framed = FramedRead::new(stdout, WorkerCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(worker_id, "reader: cancellation received, stopping");
                return ReaderExit::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(worker_id, "reader: EOF");
                        return ReaderExit::Closed;
                    }
                    Some(Err(AppError::Protocol(ref msg))) => {
                        warn!(worker_id, error = msg.as_str(), "reader: framing error, skipping");
                    }
                    Some(Err(e)) => {
                        warn!(worker_id, error = %e, "reader: stream error, stopping");
                        return ReaderExit::Failed(e.to_string());
                    }
                    Some(Ok(line)) => match parse_inbound_line(worker_id, &line) {
                        Ok(Some(parsed)) => sink(parsed),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(worker_id, error = %e, raw_line = %line, "reader: parse error, skipping line");
                        }
                    },
                }
            }
        }
    }
}
