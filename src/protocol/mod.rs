//! Line protocol spoken with worker processes.
//!
//! - `codec`: bounded NDJSON framing.
//! - `message`: typed outbound commands and inbound responses/events.
//! - `reader` / `writer`: the per-process stream tasks.

pub mod codec;
pub mod message;
pub mod reader;
pub mod writer;

pub use message::{InboundLine, ResponseLine, WorkerCommand, WorkerEvent};
