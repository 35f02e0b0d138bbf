//! Infrastructure layer for the orchestrator.
//!
//! Contains the OS-facing adapters: the device WebSocket server, file-system
//! storage, and the control boundary used by external surfaces (desktop UI,
//! web dashboard, CLI).
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `gsr_core`, but MUST NOT be imported by the `application` layer.

pub mod control;
pub mod network;
pub mod storage;
