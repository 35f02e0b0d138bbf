//! Storage infrastructure: configuration, session export and uploads.
//!
//! - `config` reads and writes the TOML configuration file and converts it
//!   into the settings each service takes.
//! - `session_export` writes finished sessions as structured JSON records.
//! - `uploads` reassembles and verifies files devices send in chunks.

pub mod config;
pub mod session_export;
pub mod uploads;
