#![forbid(unsafe_code)]

//! Agent process gateway: multiplexes front-end channels onto supervised,
//! long-lived agent worker processes.

pub mod channel;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod http;
pub mod models;
pub mod persistence;
pub mod protocol;
pub mod sessions;
pub mod subagent;
pub mod worker;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
pub use gateway::Gateway;
