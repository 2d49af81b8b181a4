//! Channel adapter contract.
//!
//! Front ends (UI sockets, messaging bridges, HTTP callers) register an
//! adapter per channel tag. The gateway uses it to push text that does not
//! travel through a task's reply callback: failure notices for tasks
//! without one, extension notifications and direct subagent replies.

use std::future::Future;
use std::pin::Pin;

use crate::models::task::TaskOrigin;
use crate::Result;

/// Delivers text to a conversation or UI connection on one channel.
pub trait ChannelAdapter: Send + Sync {
    /// Deliver `text` to `target` (its conversation key or UI handle).
    ///
    /// # Errors
    ///
    /// Returns an error if the channel could not deliver the text; the
    /// gateway logs it and, for direct replies, falls back to the parent.
    fn deliver(
        &self,
        target: &TaskOrigin,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Adapter that only logs; used for the HTTP channel, whose callers get
/// their replies through the request itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

impl ChannelAdapter for LogChannel {
    fn deliver(
        &self,
        target: &TaskOrigin,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        tracing::info!(
            channel = %target.channel,
            conversation_key = ?target.conversation_key,
            len = text.len(),
            "channel message"
        );
        Box::pin(async { Ok(()) })
    }
}
