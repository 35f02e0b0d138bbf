//! # gsr-core
//!
//! Shared library for the GSR device orchestrator containing the wire
//! protocol and the session domain entities.
//!
//! It has zero dependencies on OS APIs, network sockets or an async runtime.
//!
//! # Architecture overview (for beginners)
//!
//! A central controller coordinates several physiological sensing devices
//! (phones and wearables measuring galvanic skin response).  Devices connect
//! over WebSocket, announce themselves, and stream batches of samples while a
//! recording session is active.
//!
//! This crate defines:
//!
//! - **`protocol`** – How messages travel over the network.  Every exchange is
//!   a JSON [`Envelope`] whose `type` selects one typed [`Payload`] schema.
//!
//! - **`domain`** – The [`Session`] entity: a recording episode that collects
//!   samples and sync marks in arrival order and tracks sequence gaps.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `gsr_core::Session` instead of `gsr_core::domain::session::Session`.
pub use domain::session::{
    DeviceId, SequenceGap, Session, SessionId, SessionQuality, SessionState, SessionStateError,
    SessionSummary, SyncMark,
};
pub use protocol::codec::{decode_envelope, encode_envelope, ProtocolError};
pub use protocol::messages::{Envelope, MessageType, Payload, Sample};
