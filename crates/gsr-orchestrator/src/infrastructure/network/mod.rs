//! Network infrastructure for the orchestrator.
//!
//! # Sub-modules
//!
//! - **`connection_server`** – WebSocket listener for devices.  Accepts
//!   connections, decodes one JSON envelope per frame and dispatches it to
//!   the session, device and time-sync services.

pub mod connection_server;
