//! Domain models.

pub mod session;
pub mod status;
pub mod subagent;
pub mod task;
