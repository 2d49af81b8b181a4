//! Session files owned by workers.
//!
//! - `path_safety`: confine caller-supplied paths to a worker's session root.
//! - `relocate`: move session files, with a copy fallback across devices.
//! - `store`: the per-worker index and conversation map.

pub mod path_safety;
pub mod relocate;
pub mod store;

pub use path_safety::resolve_session_file_path;
pub use relocate::{relocate, RelocateOutcome};
pub use store::{RenamedSession, SessionStore};
