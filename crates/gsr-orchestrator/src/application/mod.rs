//! Application layer services for the orchestrator.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (sessions, samples and sync marks in `gsr-core`) and the infrastructure
//! (sockets, files, the command line).  Services here own the shared state
//! and the rules for changing it, but never touch a socket or a file.
//!
//! # Sub-modules
//!
//! - **`session_manager`** – The single source of truth for recording
//!   sessions: at most one active session per device, sample buffers and
//!   sync marks.
//!
//! - **`manage_devices`** – Registry of live device connections, with
//!   supersede-on-reconnect semantics.
//!
//! - **`time_sync`** – Periodic round-trip probes that estimate each
//!   device's clock offset and drift.
//!
//! - **`error_recovery`** – Classifies errors against pattern-based
//!   strategies and keeps a rolling error history for health reports.
//!
//! - **`performance`** – Throughput, latency and process resource metrics.

pub mod error_recovery;
pub mod manage_devices;
pub mod performance;
pub mod session_manager;
pub mod time_sync;
