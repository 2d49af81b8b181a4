//! On-disk persistence helpers.

pub mod json_file;
pub mod run_log;
